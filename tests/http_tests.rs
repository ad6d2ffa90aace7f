//! Integration tests for the HTTP binding, over real local sockets.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use fedavg_coordinator::transport::{
    router, HttpClientChannel, RegisterRequest, RegisterResponse, RegistryState, RoundRequest,
    StatusResponse,
};
use fedavg_coordinator::{
    ClientChannel, ClientError, ClientFailure, ClientPool, ClientUpdate, EvaluateReply, FailureKind,
    FedAvg, MemoryCheckpointStore, ParameterVector, RoundPhase, RoundScheduler, RoundSettings,
    ShapeSchema,
};
use tokio::net::TcpListener;

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

/// A client that adds one to every parameter and reports 12 samples.
fn training_client(client_id: &'static str) -> Router {
    Router::new()
        .route(
            "/fit",
            post(move |Json(req): Json<RoundRequest<'static>>| async move {
                let layers = req
                    .parameters
                    .into_owned()
                    .into_layers()
                    .into_iter()
                    .map(|layer| layer + 1.0)
                    .collect();
                Json(ClientUpdate::new(
                    client_id,
                    ParameterVector::new(layers),
                    12,
                    req.round,
                ))
            }),
        )
        .route(
            "/evaluate",
            post(|Json(_req): Json<RoundRequest<'static>>| async move {
                Json(EvaluateReply {
                    loss: 0.5,
                    num_examples: 12,
                })
            }),
        )
}

fn model() -> ParameterVector {
    ParameterVector::filled(&ShapeSchema::new(vec![vec![2, 3], vec![3]]), 1.0)
}

#[tokio::test]
async fn test_fit_and_evaluate_over_http() {
    let url = serve(training_client("alpha")).await;
    let channel = HttpClientChannel::new("alpha", url, reqwest::Client::new());

    let update = channel.fit(4, Arc::new(model())).await.unwrap();
    assert_eq!(update.client_id, "alpha");
    assert_eq!(update.round, 4);
    assert_eq!(update.sample_count, 12);
    assert!(update.parameters.values().all(|&v| v == 2.0));
    assert_eq!(update.parameters.schema(), model().schema());

    let eval = channel.evaluate(4, Arc::new(model())).await.unwrap();
    assert_eq!(eval.num_examples, 12);
}

#[tokio::test]
async fn test_malformed_and_failed_replies_are_classified() {
    let app = Router::new()
        .route("/fit", post(|| async { "definitely not json" }))
        .route(
            "/evaluate",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
    let url = serve(app).await;
    let channel = HttpClientChannel::new("broken", url, reqwest::Client::new());

    let fit = channel.fit(1, Arc::new(model())).await.unwrap_err();
    assert!(matches!(fit, ClientError::Malformed(_)), "{fit:?}");

    let eval = channel.evaluate(1, Arc::new(model())).await.unwrap_err();
    assert!(matches!(eval, ClientError::Malformed(_)), "{eval:?}");
    assert!(eval.to_string().contains("500"), "{eval}");
    let failure = ClientFailure::from_channel("broken", 1, &eval);
    assert_eq!(failure.kind, FailureKind::InvalidUpdate);
}

#[tokio::test]
async fn test_register_and_status() {
    let pool = Arc::new(ClientPool::new());
    let scheduler = RoundScheduler::new(
        RoundSettings::default(),
        model(),
        pool.clone(),
        Arc::new(FedAvg),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .unwrap();
    let registry = serve(router(RegistryState {
        pool: pool.clone(),
        http: reqwest::Client::new(),
        progress: scheduler.subscribe(),
    }))
    .await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{registry}/register"))
        .json(&RegisterRequest {
            client_id: "alpha".into(),
            url: "http://127.0.0.1:9999".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: RegisterResponse = response.json().await.unwrap();
    assert!(body.ok);
    assert_eq!(body.message, "registered");

    let rejected = http
        .post(format!("{registry}/register"))
        .json(&RegisterRequest {
            client_id: "beta".into(),
            url: "ftp://example".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::BAD_REQUEST);

    let tls = http
        .post(format!("{registry}/register"))
        .json(&RegisterRequest {
            client_id: "gamma".into(),
            url: "https://127.0.0.1:9443".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(tls.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: RegisterResponse = tls.json().await.unwrap();
    assert!(!body.ok);
    assert_eq!(body.message, "url must start with http://");

    let status: StatusResponse = http
        .get(format!("{registry}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.registered_clients, vec!["alpha"]);
    assert_eq!(status.progress.phase, RoundPhase::Idle);

    let removed = http
        .delete(format!("{registry}/clients/alpha"))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn test_round_over_http() {
    let pool = Arc::new(ClientPool::new());
    for id in ["alpha", "beta"] {
        let url = serve(training_client(id)).await;
        pool.register(Arc::new(HttpClientChannel::new(id, url, reqwest::Client::new())))
            .await;
    }

    let store = Arc::new(MemoryCheckpointStore::new());
    let mut scheduler = RoundScheduler::new(
        RoundSettings::default(),
        model(),
        pool,
        Arc::new(FedAvg),
        store.clone(),
    )
    .unwrap();
    let summary = scheduler.run(2, 2).await.unwrap();

    assert_eq!(summary.history.len(), 2);
    assert!(summary.final_parameters.values().all(|&v| v == 3.0));
    assert_eq!(store.len(), 2);
}
