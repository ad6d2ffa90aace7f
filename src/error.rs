//! Error types for the coordinator

use thiserror::Error;

/// Round number, starting at 1.
pub type RoundNumber = u64;

/// Round-level and library errors.
///
/// Per-client problems are not represented here: they are recovered by
/// exclusion and travel as [`ClientFailure`](crate::failure::ClientFailure)
/// values instead.
#[derive(Error, Debug)]
pub enum FedError {
    /// No updates were provided for aggregation
    #[error("Empty updates provided")]
    EmptyUpdates,

    /// Parameter shapes disagree with each other or with the model schema
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An update's sample counts sum to zero
    #[error("Total sample count is zero")]
    ZeroSampleCount,

    /// Trim fraction is outside valid range
    #[error("Invalid trim fraction: {0} (must be 0.0-0.5)")]
    InvalidTrimFraction(f32),

    /// Trimming removed every value
    #[error("Trimming {trim_fraction} from each end of {clients} updates leaves nothing to average")]
    NothingLeftAfterTrim {
        /// Number of updates offered
        clients: usize,
        /// Configured trim fraction
        trim_fraction: f32,
    },

    /// Quorum not met before the round deadline
    #[error("Insufficient clients in round {round}: need {needed}, got {actual}")]
    InsufficientClients {
        /// Round that failed
        round: RoundNumber,
        /// Minimum required successful updates
        needed: usize,
        /// Successful updates actually received
        actual: usize,
    },

    /// Update rejected by verification
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Checkpoint could not be durably written
    #[error("Failed to write checkpoint for round {round}: {reason}")]
    CheckpointWrite {
        /// Round whose checkpoint failed
        round: RoundNumber,
        /// Underlying cause
        reason: String,
    },

    /// No checkpoint exists for the requested round
    #[error("No checkpoint for round {0}")]
    NotFound(RoundNumber),

    /// The checkpoint store holds no checkpoints
    #[error("Checkpoint store is empty")]
    EmptyStore,

    /// Invalid configuration or run parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error outside the checkpoint write path
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, FedError>;

impl From<ndarray::ShapeError> for FedError {
    fn from(e: ndarray::ShapeError) -> Self {
        FedError::ShapeMismatch(e.to_string())
    }
}

impl From<toml::de::Error> for FedError {
    fn from(e: toml::de::Error) -> Self {
        FedError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for FedError {
    fn from(e: toml::ser::Error) -> Self {
        FedError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_clients_display() {
        let err = FedError::InsufficientClients {
            round: 3,
            needed: 2,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient clients in round 3: need 2, got 1"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FedError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_checkpoint_write_display() {
        let err = FedError::CheckpointWrite {
            round: 7,
            reason: "disk full".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("round 7") && msg.contains("disk full"));
    }
}
