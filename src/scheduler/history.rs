//! Round history for post-hoc analysis.
//!
//! One entry per completed round, appended after the round's checkpoint is
//! durable. Failed or retried attempts show up only through `attempts` and
//! the failure counts of the round that eventually completed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result, RoundNumber};
use crate::failure::FailureKind;
use crate::params::ClientId;

/// Metadata for a single completed round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Round number (1-indexed).
    pub round: RoundNumber,
    /// Clients whose updates were aggregated, sorted.
    pub participants: Vec<ClientId>,
    /// Sum of the participants' sample counts.
    pub total_samples: u64,
    /// Failures in the attempt that completed, by kind.
    pub failures: BTreeMap<FailureKind, usize>,
    /// Aggregation strategy used.
    pub method: String,
    /// Attempts needed to reach quorum (1 unless retried).
    pub attempts: u32,
    /// Sample-weighted evaluation loss, when federated evaluation ran.
    pub evaluation_loss: Option<f64>,
    /// Timestamp of the round's checkpoint (Unix seconds).
    pub checkpoint_timestamp: u64,
}

impl RoundRecord {
    /// Total failures across kinds.
    pub fn failure_count(&self) -> usize {
        self.failures.values().sum()
    }
}

/// Append-only history of completed rounds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoundHistory {
    records: Vec<RoundRecord>,
}

impl RoundHistory {
    /// Create a new, empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: RoundRecord) {
        self.records.push(record);
    }

    /// All records, oldest first.
    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    /// Most recent record.
    pub fn last(&self) -> Option<&RoundRecord> {
        self.records.last()
    }

    /// Number of recorded rounds.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `(round, loss)` pairs for rounds that were evaluated.
    pub fn losses(&self) -> Vec<(RoundNumber, f64)> {
        self.records
            .iter()
            .filter_map(|r| r.evaluation_loss.map(|loss| (r.round, loss)))
            .collect()
    }

    /// Serialize the history to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FedError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(round: RoundNumber, loss: Option<f64>) -> RoundRecord {
        RoundRecord {
            round,
            participants: vec!["a".to_string(), "b".to_string()],
            total_samples: 30,
            failures: BTreeMap::from([(FailureKind::Unreachable, 1)]),
            method: "fedavg".to_string(),
            attempts: 1,
            evaluation_loss: loss,
            checkpoint_timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_history_push_and_len() {
        let mut history = RoundHistory::new();
        assert!(history.is_empty());
        history.push(record(1, None));
        history.push(record(2, Some(0.4)));
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().round, 2);
        assert_eq!(history.records()[0].failure_count(), 1);
    }

    #[test]
    fn test_losses_skip_unevaluated_rounds() {
        let mut history = RoundHistory::new();
        history.push(record(1, None));
        history.push(record(2, Some(0.5)));
        history.push(record(3, Some(0.25)));
        assert_eq!(history.losses(), vec![(2, 0.5), (3, 0.25)]);
    }

    #[test]
    fn test_history_json_roundtrip() {
        let mut history = RoundHistory::new();
        history.push(record(4, Some(1.5)));
        let json = history.to_json().unwrap();
        assert!(json.contains("\"unreachable\""));
        let restored: RoundHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.records(), history.records());
    }
}
