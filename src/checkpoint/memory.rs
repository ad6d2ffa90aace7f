//! In-memory checkpoint store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::{Checkpoint, CheckpointStore};
use crate::error::{FedError, Result, RoundNumber};
use crate::params::ParameterVector;

/// Checkpoint store that keeps everything in a map.
///
/// Same append-only contract as the file store, minus durability.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<RoundNumber, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, round: RoundNumber, parameters: &ParameterVector) -> Result<Checkpoint> {
        let mut checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if checkpoints.contains_key(&round) {
            return Err(FedError::CheckpointWrite {
                round,
                reason: "checkpoint already exists".to_string(),
            });
        }
        let checkpoint = Checkpoint::new(round, parameters.clone());
        checkpoints.insert(round, checkpoint.clone());
        Ok(checkpoint)
    }

    fn load(&self, round: RoundNumber) -> Result<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&round)
            .cloned()
            .ok_or(FedError::NotFound(round))
    }

    fn rounds(&self) -> Result<Vec<RoundNumber>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect())
    }
}
