//! Per-round checkpoints of the global parameters.
//!
//! A [`CheckpointStore`] is append-only: each completed round writes one new
//! entry keyed by its round number, and nothing ever rewrites or deletes an
//! existing entry. A round only counts as complete once `save` has returned.

pub mod file;
pub mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result, RoundNumber};
use crate::params::ParameterVector;

/// Snapshot of the global parameters after a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Round that produced the parameters
    pub round: RoundNumber,
    /// Aggregated parameters
    pub parameters: ParameterVector,
    /// Creation time (Unix seconds)
    pub timestamp: u64,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time.
    pub fn new(round: RoundNumber, parameters: ParameterVector) -> Self {
        Self {
            round,
            parameters,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Serialize to CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| FedError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| FedError::Serialization(e.to_string()))
    }
}

/// Durable, append-only storage for round checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Durably write the checkpoint for `round`.
    ///
    /// Fails with [`FedError::CheckpointWrite`] if the write cannot be made
    /// durable or a checkpoint for `round` already exists.
    fn save(&self, round: RoundNumber, parameters: &ParameterVector) -> Result<Checkpoint>;

    /// Read the checkpoint for `round`, or [`FedError::NotFound`].
    fn load(&self, round: RoundNumber) -> Result<Checkpoint>;

    /// Stored round numbers in ascending order.
    fn rounds(&self) -> Result<Vec<RoundNumber>>;

    /// The checkpoint with the highest round number, or [`FedError::EmptyStore`].
    fn latest(&self) -> Result<Checkpoint> {
        match self.rounds()?.last() {
            Some(&round) => self.load(round),
            None => Err(FedError::EmptyStore),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_checkpoint_cbor_roundtrip() {
        let checkpoint = Checkpoint::new(
            3,
            ParameterVector::new(vec![array![[0.25, -1.5], [3.0, 1e-7]].into_dyn()]),
        );
        let bytes = checkpoint.to_cbor().unwrap();
        assert_eq!(Checkpoint::from_cbor(&bytes).unwrap(), checkpoint);
    }

    #[test]
    fn test_checkpoint_timestamp_is_set() {
        let checkpoint = Checkpoint::new(1, ParameterVector::new(vec![]));
        assert!(checkpoint.timestamp > 0);
    }
}
