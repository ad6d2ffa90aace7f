//! Aggregation strategies for combining client updates.
//!
//! The scheduler only sees the [`AggregationStrategy`] trait, so rules can be
//! swapped without touching round logic:
//!
//! | Strategy | Weighting | Outlier tolerance |
//! |----------|-----------|-------------------|
//! | [`FedAvg`] | sample count | none (baseline) |
//! | [`CoordinateMedian`] | unweighted | ~50% |
//! | [`TrimmedMean`] | unweighted | ~`trim_fraction` |
//!
//! Every strategy orders its inputs by `client_id` before reducing, so the
//! result never depends on the order in which updates arrived.

pub mod fedavg;
pub mod median;
pub mod trimmed_mean;

pub use fedavg::{fedavg, weighted_loss, FedAvg};
pub use median::{median, CoordinateMedian};
pub use trimmed_mean::{trimmed_mean, TrimmedMean};

use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result};
use crate::params::{ClientUpdate, ParameterVector, ShapeSchema};

/// A rule that folds a round's client updates into new global parameters.
pub trait AggregationStrategy: Send + Sync {
    /// Short name recorded in round history.
    fn name(&self) -> &'static str;

    /// Combine a non-empty set of updates with identical shapes.
    fn aggregate(&self, updates: &[ClientUpdate]) -> Result<ParameterVector>;
}

/// Aggregation method selection, as written in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Sample-weighted federated averaging (default)
    #[default]
    FedAvg,
    /// Coordinate-wise median
    Median,
    /// Coordinate-wise trimmed mean
    TrimmedMean,
}

impl AggregationMethod {
    /// Instantiate the strategy. `trim_fraction` is only read by
    /// [`AggregationMethod::TrimmedMean`].
    pub fn strategy(self, trim_fraction: f32) -> Result<Arc<dyn AggregationStrategy>> {
        Ok(match self {
            AggregationMethod::FedAvg => Arc::new(FedAvg),
            AggregationMethod::Median => Arc::new(CoordinateMedian),
            AggregationMethod::TrimmedMean => Arc::new(TrimmedMean::new(trim_fraction)?),
        })
    }
}

/// Shared shape check: every update must match the first one.
pub(crate) fn consistent_schema(updates: &[ClientUpdate]) -> Result<ShapeSchema> {
    let first = updates.first().ok_or(FedError::EmptyUpdates)?;
    let schema = first.parameters.schema();
    for update in &updates[1..] {
        schema.check(&update.parameters).map_err(|e| {
            FedError::ShapeMismatch(format!(
                "update from {} disagrees with {}: {}",
                update.client_id, first.client_id, e
            ))
        })?;
    }
    Ok(schema)
}

/// Updates in `client_id` order, which fixes the summation order.
pub(crate) fn sorted_by_client(updates: &[ClientUpdate]) -> Vec<&ClientUpdate> {
    let mut ordered: Vec<&ClientUpdate> = updates.iter().collect();
    ordered.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    ordered
}

/// Apply `reduce` to every coordinate across all updates.
///
/// `reduce` receives one value per update (in `client_id` order) and may
/// reorder the buffer freely.
pub(crate) fn coordinate_wise<F>(updates: &[ClientUpdate], reduce: F) -> Result<ParameterVector>
where
    F: Fn(&mut [f32]) -> f32 + Sync,
{
    let schema = consistent_schema(updates)?;
    let ordered = sorted_by_client(updates);

    let layers = schema
        .layers()
        .iter()
        .enumerate()
        .map(|(layer_idx, shape)| {
            let flat: Vec<Vec<f32>> = ordered
                .iter()
                .map(|u| u.parameters.layers()[layer_idx].iter().copied().collect())
                .collect();
            let n_params: usize = shape.iter().product();

            let values: Vec<f32> = (0..n_params)
                .into_par_iter()
                .map(|param_idx| {
                    let mut column: Vec<f32> = flat.iter().map(|v| v[param_idx]).collect();
                    reduce(&mut column)
                })
                .collect();

            ArrayD::from_shape_vec(IxDyn(shape), values).map_err(FedError::from)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ParameterVector::new(layers))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_method_builds_named_strategy() {
        assert_eq!(AggregationMethod::FedAvg.strategy(0.0).unwrap().name(), "fedavg");
        assert_eq!(AggregationMethod::Median.strategy(0.0).unwrap().name(), "median");
        assert_eq!(
            AggregationMethod::TrimmedMean.strategy(0.2).unwrap().name(),
            "trimmed_mean"
        );
    }

    #[test]
    fn test_method_rejects_bad_trim() {
        assert!(matches!(
            AggregationMethod::TrimmedMean.strategy(0.7),
            Err(FedError::InvalidTrimFraction(_))
        ));
    }

    #[test]
    fn test_default_method_is_fedavg() {
        assert_eq!(AggregationMethod::default(), AggregationMethod::FedAvg);
    }

    #[test]
    fn test_consistent_schema_names_offender() {
        let updates = vec![
            row_update("a", &[1.0, 2.0], 1),
            row_update("b", &[1.0], 1),
        ];
        let err = consistent_schema(&updates).unwrap_err();
        assert!(matches!(err, FedError::ShapeMismatch(_)));
        assert!(err.to_string().contains("update from b"));
    }

    #[test]
    fn test_sorted_by_client() {
        let updates = vec![
            filled_update("c", 3.0, 1),
            filled_update("a", 1.0, 1),
            filled_update("b", 2.0, 1),
        ];
        let ids: Vec<&str> = sorted_by_client(&updates)
            .iter()
            .map(|u| u.client_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_coordinate_wise_keeps_shapes() {
        let updates = vec![filled_update("a", 1.0, 1), filled_update("b", 3.0, 1)];
        let result = coordinate_wise(&updates, |vals| vals.iter().sum()).unwrap();
        assert_eq!(result.schema(), updates[0].parameters.schema());
        assert!(result.values().all(|&v| v == 4.0));
    }
}
