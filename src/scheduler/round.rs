//! State of the round in progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RoundNumber;
use crate::failure::{ClientFailure, FailureLog};
use crate::params::{ClientId, ClientUpdate, ParameterVector};

/// Everything the scheduler knows about the round it is collecting.
///
/// Owned by exactly one scheduler call and dropped once the round is
/// aggregated or abandoned.
#[derive(Debug)]
pub struct RoundState {
    /// Round being collected
    pub round_number: RoundNumber,
    /// Snapshot broadcast to the clients
    pub global_parameters: Arc<ParameterVector>,
    /// Successful, verified updates keyed by client
    pub received: BTreeMap<ClientId, ClientUpdate>,
    /// Failures seen so far
    pub failures: FailureLog,
    /// Quorum for this round
    pub required_min_clients: usize,
    /// Clients the parameters were sent to
    pub available_clients: usize,
}

impl RoundState {
    /// Open a round.
    pub fn new(
        round_number: RoundNumber,
        global_parameters: Arc<ParameterVector>,
        required_min_clients: usize,
        available_clients: usize,
    ) -> Self {
        Self {
            round_number,
            global_parameters,
            received: BTreeMap::new(),
            failures: FailureLog::new(),
            required_min_clients,
            available_clients,
        }
    }

    /// Number of distinct successful updates.
    pub fn successes(&self) -> usize {
        self.received.len()
    }

    /// Whether the quorum is met.
    pub fn has_quorum(&self) -> bool {
        self.successes() >= self.required_min_clients
    }

    /// Accept a verified update. One update per client is kept.
    pub fn accept(&mut self, update: ClientUpdate) {
        self.received.insert(update.client_id.clone(), update);
    }

    /// Record a failed client.
    pub fn reject(&mut self, failure: ClientFailure) {
        self.failures.record(failure);
    }

    /// Hand the accepted updates to aggregation, consuming the state.
    pub fn into_parts(self) -> (Vec<ClientUpdate>, FailureLog) {
        (self.received.into_values().collect(), self.failures)
    }
}
