//! Per-client failure classification and reporting.
//!
//! A failing client never aborts a round on its own. Its reply is excluded
//! from aggregation, the failure is logged and kept in a [`FailureLog`], and
//! the scheduler decides afterwards whether enough successful updates remain.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::client::ClientError;
use crate::error::{FedError, RoundNumber};
use crate::params::ClientId;

/// Failure categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error or no reply before the deadline
    Unreachable,
    /// Malformed or shape-mismatched update
    InvalidUpdate,
    /// Connection closed mid-round
    Disconnected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::InvalidUpdate => "invalid_update",
            FailureKind::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// One client's failure in one round.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("client {client_id} failed in round {round}: {kind} ({detail})")]
pub struct ClientFailure {
    /// Failing client
    pub client_id: ClientId,
    /// Classification
    pub kind: FailureKind,
    /// Round in which it failed
    pub round: RoundNumber,
    /// Human-readable cause
    pub detail: String,
}

impl ClientFailure {
    /// Classify an error reported by a client channel.
    pub fn from_channel(client_id: &str, round: RoundNumber, err: &ClientError) -> Self {
        let kind = match err {
            ClientError::Unreachable(_) => FailureKind::Unreachable,
            ClientError::Disconnected(_) => FailureKind::Disconnected,
            ClientError::Malformed(_) => FailureKind::InvalidUpdate,
        };
        Self {
            client_id: client_id.to_string(),
            kind,
            round,
            detail: err.to_string(),
        }
    }

    /// An update that arrived but failed verification.
    pub fn invalid_update(client_id: &str, round: RoundNumber, err: &FedError) -> Self {
        Self {
            client_id: client_id.to_string(),
            kind: FailureKind::InvalidUpdate,
            round,
            detail: err.to_string(),
        }
    }
}

/// Failures recorded during one round.
#[derive(Clone, Debug, Default)]
pub struct FailureLog {
    failures: Vec<ClientFailure>,
}

impl FailureLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report and keep a failure.
    pub fn record(&mut self, failure: ClientFailure) {
        warn!(
            client_id = %failure.client_id,
            round = failure.round,
            kind = %failure.kind,
            detail = %failure.detail,
            "Client failure, excluding from round"
        );
        self.failures.push(failure);
    }

    /// All recorded failures in arrival order.
    pub fn failures(&self) -> &[ClientFailure] {
        &self.failures
    }

    /// Number of failures.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no failures were recorded.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure counts per kind.
    pub fn by_kind(&self) -> BTreeMap<FailureKind, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.kind).or_insert(0) += 1;
        }
        counts
    }
}
