//! The client side of the protocol, as seen by the coordinator.
//!
//! [`ClientChannel`] is the RPC seam: one value per reachable client, able to
//! ask that client to train on (or evaluate) a snapshot of the global
//! parameters. [`ClientPool`] holds the clients currently reachable.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::info;

use crate::error::RoundNumber;
use crate::params::{ClientId, ClientUpdate, ParameterVector};

/// Errors a channel reports instead of a reply.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Could not reach the client, or it did not answer in time
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// Connection dropped while the request was in flight
    #[error("disconnected: {0}")]
    Disconnected(String),
    /// The client answered with an error status or something that does not decode
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Result of a client evaluating the global parameters on its local data.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluateReply {
    /// Mean loss over the client's evaluation set
    pub loss: f64,
    /// Size of the client's evaluation set
    pub num_examples: u64,
}

/// Request/response channel to one client.
///
/// Implementations own the transport. The coordinator bounds every call with
/// the round deadline, so implementations need no timeout of their own.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Identifier the client registered under.
    fn client_id(&self) -> &str;

    /// Send the global parameters and wait for the locally trained update.
    async fn fit(
        &self,
        round: RoundNumber,
        parameters: Arc<ParameterVector>,
    ) -> Result<ClientUpdate, ClientError>;

    /// Ask the client to evaluate the global parameters.
    async fn evaluate(
        &self,
        round: RoundNumber,
        parameters: Arc<ParameterVector>,
    ) -> Result<EvaluateReply, ClientError>;
}

/// The set of currently reachable clients, keyed by id.
#[derive(Default)]
pub struct ClientPool {
    clients: RwLock<BTreeMap<ClientId, Arc<dyn ClientChannel>>>,
    changed: Notify,
}

impl ClientPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. Re-registering an id replaces the previous channel.
    ///
    /// Returns `true` if the id was new.
    pub async fn register(&self, channel: Arc<dyn ClientChannel>) -> bool {
        let client_id = channel.client_id().to_string();
        let is_new = {
            let mut clients = self.clients.write().await;
            clients.insert(client_id.clone(), channel).is_none()
        };
        info!(client_id = %client_id, is_new, "Client registered");
        self.changed.notify_waiters();
        is_new
    }

    /// Remove a client. Returns `true` if it was present.
    pub async fn remove(&self, client_id: &str) -> bool {
        let removed = self.clients.write().await.remove(client_id).is_some();
        if removed {
            info!(client_id = %client_id, "Client removed");
            self.changed.notify_waiters();
        }
        removed
    }

    /// Number of registered clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no clients are registered.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Registered client ids, sorted.
    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Channels of all registered clients, in id order.
    pub async fn snapshot(&self) -> Vec<Arc<dyn ClientChannel>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Wait until at least `min` clients are registered or `deadline` passes.
    ///
    /// Returns the number registered when the wait ended.
    pub async fn wait_for(&self, min: usize, deadline: Instant) -> usize {
        loop {
            // Created before the check so a registration in between still wakes us.
            let notified = self.changed.notified();
            let available = self.len().await;
            if available >= min {
                return available;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Idle(&'static str);

    #[async_trait]
    impl ClientChannel for Idle {
        fn client_id(&self) -> &str {
            self.0
        }

        async fn fit(
            &self,
            _round: RoundNumber,
            _parameters: Arc<ParameterVector>,
        ) -> Result<ClientUpdate, ClientError> {
            Err(ClientError::Unreachable("idle".into()))
        }

        async fn evaluate(
            &self,
            _round: RoundNumber,
            _parameters: Arc<ParameterVector>,
        ) -> Result<EvaluateReply, ClientError> {
            Err(ClientError::Unreachable("idle".into()))
        }
    }

    #[tokio::test]
    async fn test_register_and_replace() {
        let pool = ClientPool::new();
        assert!(pool.is_empty().await);
        assert!(pool.register(Arc::new(Idle("b"))).await);
        assert!(pool.register(Arc::new(Idle("a"))).await);
        assert!(!pool.register(Arc::new(Idle("a"))).await);
        assert_eq!(pool.len().await, 2);
        assert_eq!(pool.client_ids().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let pool = ClientPool::new();
        pool.register(Arc::new(Idle("a"))).await;
        assert!(pool.remove("a").await);
        assert!(!pool.remove("a").await);
        assert!(pool.snapshot().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_wakes_on_registration() {
        let pool = Arc::new(ClientPool::new());
        let registrar = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            registrar.register(Arc::new(Idle("late"))).await;
        });
        let available = pool
            .wait_for(1, Instant::now() + Duration::from_secs(60))
            .await;
        assert_eq!(available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_gives_up_at_deadline() {
        let pool = ClientPool::new();
        pool.register(Arc::new(Idle("only"))).await;
        let available = pool
            .wait_for(3, Instant::now() + Duration::from_secs(5))
            .await;
        assert_eq!(available, 1);
    }
}
