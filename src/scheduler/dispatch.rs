//! Concurrent fan-out of one request to many clients.
//!
//! Each client call runs in its own task and posts exactly one [`Reply`]
//! into a bounded channel owned by the round attempt. Dropping [`Replies`]
//! closes the round: calls that finish afterwards find the channel closed and
//! their results are discarded.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{ClientChannel, ClientError};
use crate::error::RoundNumber;
use crate::params::ClientId;

/// One client's answer, tagged with the client it was sent to.
#[derive(Debug)]
pub(crate) struct Reply<T> {
    pub client_id: ClientId,
    pub result: Result<T, ClientError>,
}

/// Receiving end of a dispatch.
pub(crate) struct Replies<T> {
    rx: mpsc::Receiver<Reply<T>>,
    pending: usize,
}

impl<T> Replies<T> {
    /// Clients that have not replied yet.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Next reply in arrival order, or `None` once every task has finished.
    pub async fn next(&mut self) -> Option<Reply<T>> {
        let reply = self.rx.recv().await?;
        self.pending = self.pending.saturating_sub(1);
        Some(reply)
    }

    /// Replies that have already arrived, without waiting.
    pub fn drain_ready(&mut self) -> Vec<Reply<T>> {
        let mut ready = Vec::new();
        while let Ok(reply) = self.rx.try_recv() {
            self.pending = self.pending.saturating_sub(1);
            ready.push(reply);
        }
        ready
    }
}

/// Call every client concurrently, bounding each call by `deadline`.
pub(crate) fn dispatch<T, F, Fut>(
    clients: &[Arc<dyn ClientChannel>],
    round: RoundNumber,
    deadline: Instant,
    call: F,
) -> Replies<T>
where
    T: Send + 'static,
    F: Fn(Arc<dyn ClientChannel>) -> Fut,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(clients.len().max(1));

    for channel in clients {
        let client_id = channel.client_id().to_string();
        let request = call(Arc::clone(channel));
        let tx = tx.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout_at(deadline, request).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Unreachable(
                    "no reply before round deadline".to_string(),
                )),
            };
            if let Err(mpsc::error::SendError(late)) = tx.send(Reply { client_id, result }).await {
                debug!(
                    round,
                    client_id = %late.client_id,
                    succeeded = late.result.is_ok(),
                    "Round already closed, discarding late reply"
                );
            }
        });
    }

    Replies {
        rx,
        pending: clients.len(),
    }
}
