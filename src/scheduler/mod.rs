//! The round loop.
//!
//! [`RoundScheduler`] drives rounds strictly one after another. Within a round
//! it broadcasts an immutable snapshot of the global parameters to every
//! registered client, collects replies concurrently until the quorum is met or
//! the deadline passes, aggregates, and writes the checkpoint. The global
//! parameters are only replaced after the checkpoint is durable.

mod dispatch;
pub mod history;
pub mod round;

pub use history::{RoundHistory, RoundRecord};
pub use round::RoundState;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregators::{weighted_loss, AggregationStrategy};
use crate::checkpoint::CheckpointStore;
use crate::client::ClientPool;
use crate::error::{FedError, Result, RoundNumber};
use crate::failure::{ClientFailure, FailureLog};
use crate::math::parameters_l2_norm;
use crate::params::{ClientUpdate, ParameterVector, ShapeSchema};
use crate::verification::{check_sample_count, verify_update, UpdateExpectations};

use dispatch::{dispatch, Reply};

/// What to do when a round ends below quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Fail the run on the first short round
    Abort,
    /// Re-run the same round with a fresh deadline, up to `max_retries` times
    Retry {
        /// Extra attempts after the first
        max_retries: u32,
    },
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::Retry { max_retries: 2 }
    }
}

/// Federated evaluation after each round.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationSettings {
    /// Replies needed before a loss is recorded
    pub min_evaluate_clients: usize,
    /// Waiting window for evaluation replies
    pub timeout: Duration,
}

/// Round behavior that does not change between rounds.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundSettings {
    /// Registered clients required before a round broadcasts
    pub min_available_clients: usize,
    /// Waiting window per round attempt
    pub round_timeout: Duration,
    /// How long to keep accepting replies once the quorum is met
    pub quorum_grace: Duration,
    /// Short-round policy
    pub quorum_policy: QuorumPolicy,
    /// Reject updates whose L2 norm exceeds this
    pub max_update_norm: Option<f32>,
    /// Run federated evaluation when set
    pub evaluation: Option<EvaluationSettings>,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            min_available_clients: 1,
            round_timeout: Duration::from_secs(300),
            quorum_grace: Duration::ZERO,
            quorum_policy: QuorumPolicy::default(),
            max_update_norm: None,
            evaluation: None,
        }
    }
}

impl RoundSettings {
    /// Reject settings the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.round_timeout.is_zero() {
            return Err(FedError::Config("round timeout must be positive".into()));
        }
        if let Some(max_norm) = self.max_update_norm {
            if !(max_norm.is_finite() && max_norm > 0.0) {
                return Err(FedError::Config(format!(
                    "max_update_norm must be positive, got {max_norm}"
                )));
            }
        }
        if let Some(evaluation) = &self.evaluation {
            if evaluation.timeout.is_zero() || evaluation.min_evaluate_clients == 0 {
                return Err(FedError::Config(
                    "evaluation needs a positive timeout and at least one client".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Where the scheduler is in the current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// No round started yet
    Idle,
    /// Waiting for enough clients to register
    WaitingForClients,
    /// Parameters broadcast, collecting updates
    Collecting,
    /// Combining updates
    Aggregating,
    /// Writing the checkpoint
    Checkpointing,
    /// Federated evaluation in flight
    Evaluating,
    /// Round finished and checkpointed
    Completed,
    /// Round failed and the run stopped
    Failed,
    /// All rounds done
    Finished,
}

/// Progress notification published after every phase change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundProgress {
    /// Current round (0 before the first)
    pub round: RoundNumber,
    /// Current phase
    pub phase: RoundPhase,
    /// Attempt within the round
    pub attempt: u32,
    /// Successful updates so far
    pub participants: usize,
    /// Clients the round was broadcast to
    pub available_clients: usize,
}

impl RoundProgress {
    fn idle() -> Self {
        Self {
            round: 0,
            phase: RoundPhase::Idle,
            attempt: 0,
            participants: 0,
            available_clients: 0,
        }
    }
}

/// Result of a completed run.
#[derive(Clone, Debug)]
pub struct TrainingSummary {
    /// Global parameters after the last round
    pub final_parameters: Arc<ParameterVector>,
    /// One record per completed round
    pub history: RoundHistory,
}

/// Drives federated training rounds.
pub struct RoundScheduler {
    settings: RoundSettings,
    schema: ShapeSchema,
    global: Arc<ParameterVector>,
    pool: Arc<ClientPool>,
    strategy: Arc<dyn AggregationStrategy>,
    store: Arc<dyn CheckpointStore>,
    progress: watch::Sender<RoundProgress>,
}

impl RoundScheduler {
    /// Create a scheduler starting from `initial_parameters`.
    ///
    /// The initial model's layer shapes become the schema every update is
    /// checked against.
    pub fn new(
        settings: RoundSettings,
        initial_parameters: ParameterVector,
        pool: Arc<ClientPool>,
        strategy: Arc<dyn AggregationStrategy>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        settings.validate()?;
        if initial_parameters.is_empty() {
            return Err(FedError::Config("initial model has no layers".into()));
        }
        if !initial_parameters.all_finite() {
            return Err(FedError::Config(
                "initial model contains non-finite values".into(),
            ));
        }

        let schema = initial_parameters.schema();
        let (progress, _) = watch::channel(RoundProgress::idle());
        Ok(Self {
            settings,
            schema,
            global: Arc::new(initial_parameters),
            pool,
            strategy,
            store,
            progress,
        })
    }

    /// Layer shapes every update must match.
    pub fn schema(&self) -> &ShapeSchema {
        &self.schema
    }

    /// Snapshot of the current global parameters.
    pub fn global_parameters(&self) -> Arc<ParameterVector> {
        Arc::clone(&self.global)
    }

    /// Subscribe to progress notifications.
    pub fn subscribe(&self) -> watch::Receiver<RoundProgress> {
        self.progress.subscribe()
    }

    /// Run rounds `1..=total_rounds`.
    pub async fn run(
        &mut self,
        total_rounds: RoundNumber,
        min_clients: usize,
    ) -> Result<TrainingSummary> {
        self.run_from(1, total_rounds, min_clients).await
    }

    /// Run rounds `first_round..=total_rounds`, for resuming from a checkpoint.
    ///
    /// Nothing runs if `first_round > total_rounds`; the current parameters
    /// are returned as-is.
    pub async fn run_from(
        &mut self,
        first_round: RoundNumber,
        total_rounds: RoundNumber,
        min_clients: usize,
    ) -> Result<TrainingSummary> {
        if first_round == 0 || total_rounds == 0 {
            return Err(FedError::Config("rounds are numbered from 1".into()));
        }
        if min_clients == 0 {
            return Err(FedError::Config("min_clients must be at least 1".into()));
        }

        info!(
            first_round,
            total_rounds,
            min_clients,
            strategy = self.strategy.name(),
            layers = self.schema.layers().len(),
            params = self.global.num_params(),
            "Starting federated training"
        );

        let mut history = RoundHistory::new();
        for round in first_round..=total_rounds {
            match self.run_round(round, min_clients).await {
                Ok(record) => history.push(record),
                Err(e) => {
                    error!(round, error = %e, "Round failed, stopping run");
                    self.publish(round, RoundPhase::Failed, 0, 0, 0);
                    return Err(e);
                }
            }
        }

        self.publish(total_rounds, RoundPhase::Finished, 0, 0, 0);
        info!(rounds = history.len(), "Federated training finished");
        Ok(TrainingSummary {
            final_parameters: Arc::clone(&self.global),
            history,
        })
    }

    async fn run_round(&mut self, round: RoundNumber, min_clients: usize) -> Result<RoundRecord> {
        let mut attempt: u32 = 1;
        let state = loop {
            match self.collect(round, min_clients, attempt).await {
                Ok(state) => break state,
                Err(FedError::InsufficientClients { needed, actual, .. })
                    if self.may_retry(attempt) =>
                {
                    warn!(round, attempt, needed, actual, "Quorum not reached, retrying round");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let available = state.available_clients;
        let participants = state.successes();
        self.publish(round, RoundPhase::Aggregating, attempt, participants, available);

        let (updates, failures) = state.into_parts();
        let aggregated = self.strategy.aggregate(&updates)?;
        self.schema.check(&aggregated)?;

        self.publish(round, RoundPhase::Checkpointing, attempt, participants, available);
        let checkpoint = self.store.save(round, &aggregated)?;
        self.global = Arc::new(aggregated);

        let total_samples = updates
            .iter()
            .fold(0u64, |acc, u| acc.saturating_add(u.sample_count));
        info!(
            round,
            participants,
            failures = failures.len(),
            total_samples,
            norm = parameters_l2_norm(&self.global),
            "Round complete"
        );

        let evaluation_loss = self.evaluate(round, attempt).await;
        self.publish(round, RoundPhase::Completed, attempt, participants, available);

        Ok(RoundRecord {
            round,
            participants: updates.into_iter().map(|u| u.client_id).collect(),
            total_samples,
            failures: failures.by_kind(),
            method: self.strategy.name().to_string(),
            attempts: attempt,
            evaluation_loss,
            checkpoint_timestamp: checkpoint.timestamp,
        })
    }

    fn may_retry(&self, attempt: u32) -> bool {
        match self.settings.quorum_policy {
            QuorumPolicy::Abort => false,
            QuorumPolicy::Retry { max_retries } => attempt <= max_retries,
        }
    }

    /// Broadcast and collect one attempt of a round.
    async fn collect(
        &self,
        round: RoundNumber,
        min_clients: usize,
        attempt: u32,
    ) -> Result<RoundState> {
        let deadline = Instant::now() + self.settings.round_timeout;
        let min_available = self.settings.min_available_clients.max(min_clients);

        self.publish(round, RoundPhase::WaitingForClients, attempt, 0, 0);
        let available = self.pool.wait_for(min_available, deadline).await;
        if available < min_available {
            warn!(round, attempt, available, min_available, "Not enough clients registered");
            return Err(FedError::InsufficientClients {
                round,
                needed: min_clients,
                actual: 0,
            });
        }

        let clients = self.pool.snapshot().await;
        let mut state = RoundState::new(round, Arc::clone(&self.global), min_clients, clients.len());
        self.publish(round, RoundPhase::Collecting, attempt, 0, clients.len());
        info!(round, attempt, clients = clients.len(), "Broadcasting global parameters");

        let snapshot = Arc::clone(&state.global_parameters);
        let mut replies = dispatch(&clients, round, deadline, move |channel| {
            let parameters = Arc::clone(&snapshot);
            async move { channel.fit(round, parameters).await }
        });

        let mut quorum_at: Option<Instant> = None;
        while replies.pending() > 0 {
            let close_at = match quorum_at {
                Some(at) => (at + self.settings.quorum_grace).min(deadline),
                None => deadline,
            };
            match tokio::time::timeout_at(close_at, replies.next()).await {
                Ok(Some(reply)) => {
                    self.handle_reply(&mut state, reply);
                    if quorum_at.is_none() && state.has_quorum() {
                        debug!(round, participants = state.successes(), "Quorum reached");
                        quorum_at = Some(Instant::now());
                    }
                    self.publish(
                        round,
                        RoundPhase::Collecting,
                        attempt,
                        state.successes(),
                        state.available_clients,
                    );
                }
                Ok(None) | Err(_) => break,
            }
        }
        for reply in replies.drain_ready() {
            self.handle_reply(&mut state, reply);
        }
        // Closing the channel: anything still in flight is now late.
        drop(replies);

        if !state.has_quorum() {
            warn!(
                round,
                attempt,
                participants = state.successes(),
                failures = state.failures.len(),
                min_clients,
                "Round closed below quorum"
            );
            return Err(FedError::InsufficientClients {
                round,
                needed: min_clients,
                actual: state.successes(),
            });
        }
        Ok(state)
    }

    fn handle_reply(&self, state: &mut RoundState, reply: Reply<ClientUpdate>) {
        let round = state.round_number;
        let Reply { client_id, result } = reply;

        let update = match result {
            Ok(update) => update,
            Err(err) => {
                state.reject(ClientFailure::from_channel(&client_id, round, &err));
                return;
            }
        };

        let expected = UpdateExpectations {
            client_id: &client_id,
            round,
            schema: &self.schema,
            max_norm: self.settings.max_update_norm,
        };
        if let Err(err) = verify_update(&update, &expected) {
            state.reject(ClientFailure::invalid_update(&client_id, round, &err));
        } else {
            debug!(
                round,
                client_id = %client_id,
                sample_count = update.sample_count,
                norm = parameters_l2_norm(&update.parameters),
                "Update accepted"
            );
            state.accept(update);
        }
    }

    /// Federated evaluation of the freshly checkpointed parameters.
    ///
    /// Failures here are reported but never fail the round.
    async fn evaluate(&self, round: RoundNumber, attempt: u32) -> Option<f64> {
        let settings = self.settings.evaluation.as_ref()?;
        let clients = self.pool.snapshot().await;
        if clients.len() < settings.min_evaluate_clients {
            warn!(
                round,
                available = clients.len(),
                min_evaluate_clients = settings.min_evaluate_clients,
                "Skipping evaluation, not enough clients"
            );
            return None;
        }

        self.publish(round, RoundPhase::Evaluating, attempt, 0, clients.len());
        let deadline = Instant::now() + settings.timeout;
        let snapshot = Arc::clone(&self.global);
        let mut replies = dispatch(&clients, round, deadline, move |channel| {
            let parameters = Arc::clone(&snapshot);
            async move { channel.evaluate(round, parameters).await }
        });

        let mut results = Vec::new();
        let mut failures = FailureLog::new();
        while let Ok(Some(reply)) = tokio::time::timeout_at(deadline, replies.next()).await {
            match reply.result {
                Ok(eval)
                    if check_sample_count(eval.num_examples).is_ok() && eval.loss.is_finite() =>
                {
                    results.push((eval.num_examples, eval.loss));
                }
                Ok(eval) => {
                    let err = FedError::Verification(format!(
                        "unusable evaluation: loss {} over {} examples",
                        eval.loss, eval.num_examples
                    ));
                    failures.record(ClientFailure::invalid_update(&reply.client_id, round, &err));
                }
                Err(err) => {
                    failures.record(ClientFailure::from_channel(&reply.client_id, round, &err));
                }
            }
        }

        if results.len() < settings.min_evaluate_clients {
            warn!(
                round,
                evaluated = results.len(),
                failures = failures.len(),
                min_evaluate_clients = settings.min_evaluate_clients,
                "Too few evaluation results, loss not recorded"
            );
            return None;
        }

        let loss = weighted_loss(&results);
        info!(round, loss = ?loss, evaluated = results.len(), "Federated evaluation complete");
        loss
    }

    fn publish(
        &self,
        round: RoundNumber,
        phase: RoundPhase,
        attempt: u32,
        participants: usize,
        available_clients: usize,
    ) {
        self.progress.send_replace(RoundProgress {
            round,
            phase,
            attempt,
            participants,
            available_clients,
        });
    }
}
