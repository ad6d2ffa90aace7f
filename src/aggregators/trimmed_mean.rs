//! Coordinate-wise trimmed mean aggregation
//!
//! Drops the `trim_fraction` largest and smallest values of every coordinate,
//! then averages what remains.

use super::{coordinate_wise, AggregationStrategy};
use crate::error::{FedError, Result};
use crate::params::{ClientUpdate, ParameterVector};

/// Coordinate-wise trimmed mean across client updates.
///
/// `ceil(n * trim_fraction)` values are removed from each end.
///
/// # Note
///
/// Sample counts are ignored: sorting destroys the correspondence between
/// values and the clients that sent them. Use [`super::fedavg`] for weighted
/// aggregation.
pub fn trimmed_mean(updates: &[ClientUpdate], trim_fraction: f32) -> Result<ParameterVector> {
    if updates.is_empty() {
        return Err(FedError::EmptyUpdates);
    }
    validate_fraction(trim_fraction)?;

    let n_clients = updates.len();
    let n_trim = (n_clients as f32 * trim_fraction).ceil() as usize;
    if n_clients <= 2 * n_trim {
        return Err(FedError::NothingLeftAfterTrim {
            clients: n_clients,
            trim_fraction,
        });
    }

    coordinate_wise(updates, |values| {
        values.sort_by(f32::total_cmp);
        let kept = &values[n_trim..n_clients - n_trim];
        kept.iter().sum::<f32>() / kept.len() as f32
    })
}

fn validate_fraction(trim_fraction: f32) -> Result<()> {
    if (0.0..=0.5).contains(&trim_fraction) {
        Ok(())
    } else {
        Err(FedError::InvalidTrimFraction(trim_fraction))
    }
}

/// [`AggregationStrategy`] wrapper around [`trimmed_mean`].
#[derive(Clone, Copy, Debug)]
pub struct TrimmedMean {
    trim_fraction: f32,
}

impl TrimmedMean {
    /// Create a trimmed-mean strategy. Fails unless `trim_fraction` is in `[0, 0.5]`.
    pub fn new(trim_fraction: f32) -> Result<Self> {
        validate_fraction(trim_fraction)?;
        Ok(Self { trim_fraction })
    }

    /// Configured fraction trimmed from each end.
    pub fn trim_fraction(&self) -> f32 {
        self.trim_fraction
    }
}

impl AggregationStrategy for TrimmedMean {
    fn name(&self) -> &'static str {
        "trimmed_mean"
    }

    fn aggregate(&self, updates: &[ClientUpdate]) -> Result<ParameterVector> {
        trimmed_mean(updates, self.trim_fraction)
    }
}
