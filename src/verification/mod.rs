//! Verification of incoming client updates.
//!
//! Every update passes these checks before it counts toward a round's quorum:
//!
//! - [`update_check`] - identity, round label, sample count, schema, finiteness
//! - [`norm_bound`] - optional rejection of updates with excessive L2 norm

pub mod norm_bound;
pub mod update_check;

pub use norm_bound::check_norm_bound;
pub use update_check::{check_sample_count, verify_update, UpdateExpectations, MAX_SAMPLE_COUNT};
