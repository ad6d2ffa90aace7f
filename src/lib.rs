//! # fedavg-coordinator: round-based federated averaging
//!
//! A coordinator for synchronous federated learning. Each round it broadcasts
//! the global model to the registered clients, collects their locally trained
//! updates until a quorum is met or the round deadline passes, combines them
//! with a sample-weighted average, and durably checkpoints the result before
//! moving on.
//!
//! ## Pieces
//!
//! - [`RoundScheduler`] - the round loop, with quorum, deadline and retry policy
//! - [`fedavg()`] - sample-weighted averaging, behind [`AggregationStrategy`]
//!   together with [`median()`] and [`trimmed_mean()`]
//! - [`CheckpointStore`] - append-only per-round persistence
//!   ([`FileCheckpointStore`], [`MemoryCheckpointStore`])
//! - [`ClientChannel`] - the RPC seam to a client; [`transport::http`] binds it
//!   to JSON over HTTP
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fedavg_coordinator::{
//!     ClientPool, FedAvg, FileCheckpointStore, ParameterVector, RoundScheduler,
//!     RoundSettings, ShapeSchema,
//! };
//!
//! # async fn run() -> fedavg_coordinator::Result<()> {
//! let initial = ParameterVector::filled(&ShapeSchema::new(vec![vec![784, 10], vec![10]]), 0.0);
//! let mut scheduler = RoundScheduler::new(
//!     RoundSettings::default(),
//!     initial,
//!     Arc::new(ClientPool::new()),
//!     Arc::new(FedAvg),
//!     Arc::new(FileCheckpointStore::open("checkpoints")?),
//! )?;
//! let summary = scheduler.run(3, 2).await?;
//! println!("{} rounds", summary.history.len());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod aggregators;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod failure;
pub mod logging;
pub mod math;
pub mod params;
pub mod scheduler;
pub mod transport;
pub mod verification;

// Re-exports
pub use aggregators::fedavg;
pub use aggregators::median;
pub use aggregators::trimmed_mean;
pub use aggregators::{AggregationMethod, AggregationStrategy, CoordinateMedian, FedAvg, TrimmedMean};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use client::{ClientChannel, ClientError, ClientPool, EvaluateReply};
pub use config::ServerConfig;
pub use error::{FedError, Result, RoundNumber};
pub use failure::{ClientFailure, FailureKind};
pub use params::{ClientId, ClientUpdate, ParameterVector, ShapeSchema};
pub use scheduler::{
    QuorumPolicy, RoundHistory, RoundPhase, RoundProgress, RoundRecord, RoundScheduler,
    RoundSettings, TrainingSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
