//! Server configuration, read from TOML.
//!
//! Every section has defaults, so a file only needs the keys it changes.
//! Command-line flags are applied on top of the loaded file by the binary,
//! after which [`ServerConfig::validate`] must pass before anything runs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregators::{AggregationMethod, AggregationStrategy, TrimmedMean};
use crate::error::{FedError, Result, RoundNumber};
use crate::scheduler::{EvaluationSettings, QuorumPolicy, RoundSettings};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings
    pub server: ServerSection,
    /// Round loop settings
    pub rounds: RoundsSection,
    /// Aggregation strategy
    pub aggregation: AggregationSection,
    /// Per-update verification
    pub validation: ValidationSection,
    /// Federated evaluation
    pub evaluation: EvaluationSection,
    /// Checkpoint storage and initial model
    pub checkpoint: CheckpointSection,
    /// Logging
    pub logging: LoggingSection,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the registry server binds to
    pub listen_address: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// `[rounds]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundsSection {
    /// Rounds to run
    pub total_rounds: RoundNumber,
    /// Successful updates needed to close a round
    pub min_clients: usize,
    /// Registered clients needed before a round starts
    pub min_available_clients: usize,
    /// Waiting window per round attempt
    pub round_timeout_secs: u64,
    /// Extra wait for stragglers once the quorum is met
    pub quorum_grace_ms: u64,
    /// Short-round policy
    pub quorum_policy: QuorumPolicy,
}

impl Default for RoundsSection {
    fn default() -> Self {
        Self {
            total_rounds: 3,
            min_clients: 2,
            min_available_clients: 2,
            round_timeout_secs: 300,
            quorum_grace_ms: 0,
            quorum_policy: QuorumPolicy::default(),
        }
    }
}

/// `[aggregation]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSection {
    /// Strategy to use
    pub method: AggregationMethod,
    /// Fraction trimmed from each end by `trimmed_mean`
    pub trim_fraction: f32,
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            method: AggregationMethod::FedAvg,
            trim_fraction: 0.1,
        }
    }
}

/// `[validation]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    /// Reject updates with an L2 norm above this
    pub max_update_norm: Option<f32>,
}

/// `[evaluation]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSection {
    /// Run federated evaluation after each round
    pub enabled: bool,
    /// Replies needed to record a loss
    pub min_evaluate_clients: usize,
    /// Waiting window for evaluation replies
    pub timeout_secs: u64,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            min_evaluate_clients: 2,
            timeout_secs: 60,
        }
    }
}

/// `[checkpoint]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// Directory holding one file per round
    pub dir: PathBuf,
    /// CBOR-encoded initial parameters
    pub initial_model: Option<PathBuf>,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            initial_model: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level; `RUST_LOG` overrides it
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Write the configuration as TOML, via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, toml_string)?;
        std::fs::rename(&temp_path, path)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Check every value the server depends on.
    pub fn validate(&self) -> Result<()> {
        self.listen_address()?;

        let rounds = &self.rounds;
        if rounds.total_rounds == 0 {
            return Err(FedError::Config("total_rounds must be at least 1".into()));
        }
        if rounds.min_clients == 0 {
            return Err(FedError::Config("min_clients must be at least 1".into()));
        }
        if rounds.min_available_clients < rounds.min_clients {
            return Err(FedError::Config(format!(
                "min_available_clients ({}) must be at least min_clients ({})",
                rounds.min_available_clients, rounds.min_clients
            )));
        }

        if self.evaluation.enabled && self.evaluation.min_evaluate_clients == 0 {
            return Err(FedError::Config(
                "min_evaluate_clients must be at least 1".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(FedError::Config(format!(
                    "log level must be one of trace, debug, info, warn, error; got {other:?}"
                )))
            }
        }

        TrimmedMean::new(self.aggregation.trim_fraction)?;
        self.round_settings().validate()
    }

    /// Parsed listen address.
    pub fn listen_address(&self) -> Result<SocketAddr> {
        self.server.listen_address.parse().map_err(|e| {
            FedError::Config(format!(
                "invalid listen_address {:?}: {e}",
                self.server.listen_address
            ))
        })
    }

    /// Configured aggregation strategy.
    pub fn strategy(&self) -> Result<Arc<dyn AggregationStrategy>> {
        self.aggregation.method.strategy(self.aggregation.trim_fraction)
    }

    /// Scheduler settings derived from `[rounds]`, `[validation]` and `[evaluation]`.
    pub fn round_settings(&self) -> RoundSettings {
        let evaluation = self.evaluation.enabled.then(|| EvaluationSettings {
            min_evaluate_clients: self.evaluation.min_evaluate_clients,
            timeout: Duration::from_secs(self.evaluation.timeout_secs),
        });

        RoundSettings {
            min_available_clients: self.rounds.min_available_clients,
            round_timeout: Duration::from_secs(self.rounds.round_timeout_secs),
            quorum_grace: Duration::from_millis(self.rounds.quorum_grace_ms),
            quorum_policy: self.rounds.quorum_policy,
            max_update_norm: self.validation.max_update_norm,
            evaluation,
        }
    }
}
