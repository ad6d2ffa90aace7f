//! HTTP implementation: an axum registry server and a reqwest client channel.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{RegisterRequest, RegisterResponse, RoundRequest, StatusResponse};
use crate::client::{ClientChannel, ClientError, ClientPool, EvaluateReply};
use crate::error::RoundNumber;
use crate::params::{ClientId, ClientUpdate, ParameterVector};
use crate::scheduler::RoundProgress;

/// Channel to a client reachable over HTTP.
#[derive(Clone, Debug)]
pub struct HttpClientChannel {
    client_id: ClientId,
    base_url: String,
    http: reqwest::Client,
}

impl HttpClientChannel {
    /// Channel to the client serving at `base_url`.
    pub fn new(client_id: impl Into<ClientId>, base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url: String = base_url.into();
        Self {
            client_id: client_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Base URL of the client.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        round: RoundNumber,
        parameters: &ParameterVector,
    ) -> Result<T, ClientError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let body = RoundRequest {
            round,
            parameters: Cow::Borrowed(parameters),
        };
        debug!(client_id = %self.client_id, url = %url, round, "Calling client");

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(classify)?;
        response.json::<T>().await.map_err(classify)
    }
}

fn classify(err: reqwest::Error) -> ClientError {
    if err.is_connect() || err.is_timeout() {
        ClientError::Unreachable(err.to_string())
    } else if err.is_decode() || err.is_status() {
        ClientError::Malformed(err.to_string())
    } else {
        ClientError::Disconnected(err.to_string())
    }
}

#[async_trait]
impl ClientChannel for HttpClientChannel {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn fit(
        &self,
        round: RoundNumber,
        parameters: Arc<ParameterVector>,
    ) -> Result<ClientUpdate, ClientError> {
        self.post("fit", round, &parameters).await
    }

    async fn evaluate(
        &self,
        round: RoundNumber,
        parameters: Arc<ParameterVector>,
    ) -> Result<EvaluateReply, ClientError> {
        self.post("evaluate", round, &parameters).await
    }
}

/// Shared state of the registry server.
#[derive(Clone)]
pub struct RegistryState {
    /// Pool new registrations are added to
    pub pool: Arc<ClientPool>,
    /// HTTP client shared by all channels
    pub http: reqwest::Client,
    /// Scheduler progress
    pub progress: watch::Receiver<RoundProgress>,
}

/// Routes: `POST /register`, `DELETE /clients/:client_id`, `GET /status`.
pub fn router(state: RegistryState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/clients/:client_id", delete(unregister))
        .route("/status", get(status))
        .with_state(state)
}

async fn register(
    State(state): State<RegistryState>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<RegisterResponse>) {
    let client_id = req.client_id.trim();
    if client_id.is_empty() {
        return rejected("client_id must not be empty");
    }
    // Built without a TLS backend, so only plain http can be dialed.
    if !req.url.starts_with("http://") {
        warn!(client_id = %client_id, url = %req.url, "Registration with unusable url");
        return rejected("url must start with http://");
    }

    let channel = HttpClientChannel::new(client_id, req.url.as_str(), state.http.clone());
    let is_new = state.pool.register(Arc::new(channel)).await;
    let message = if is_new { "registered" } else { "re-registered" };
    (
        StatusCode::OK,
        Json(RegisterResponse {
            ok: true,
            message: message.to_string(),
        }),
    )
}

fn rejected(message: &str) -> (StatusCode, Json<RegisterResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(RegisterResponse {
            ok: false,
            message: message.to_string(),
        }),
    )
}

async fn unregister(State(state): State<RegistryState>, Path(client_id): Path<String>) -> StatusCode {
    if state.pool.remove(&client_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn status(State(state): State<RegistryState>) -> Json<StatusResponse> {
    let progress = state.progress.borrow().clone();
    Json(StatusResponse {
        progress,
        registered_clients: state.pool.client_ids().await,
    })
}
