//! Norm-bound verification for model updates.
//!
//! Rejects updates whose L2 norm exceeds a threshold, keeping a single
//! diverged or hostile client from dragging the global model arbitrarily far.

use crate::error::{FedError, Result};
use crate::math::norms::parameters_l2_norm;
use crate::params::ParameterVector;

/// Check that an update's L2 norm is within `max_norm`.
///
/// Returns [`FedError::Verification`] if it exceeds the limit.
pub fn check_norm_bound(params: &ParameterVector, max_norm: f32) -> Result<()> {
    let norm = parameters_l2_norm(params);
    if norm <= max_norm {
        Ok(())
    } else {
        Err(FedError::Verification(format!(
            "Update norm {:.4} exceeds bound {:.4}",
            norm, max_norm
        )))
    }
}
