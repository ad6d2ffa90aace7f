//! Federated averaging (McMahan et al., 2017).
//!
//! Each layer of the result is the sample-weighted mean of the clients'
//! layers: `Σ n_u · p_u[i] / Σ n_u`. Clients that trained on more data pull
//! the global model proportionally harder. There is no outlier defense.

use ndarray::ArrayD;
use rayon::prelude::*;

use super::{consistent_schema, sorted_by_client, AggregationStrategy};
use crate::error::{FedError, Result};
use crate::params::{ClientUpdate, ParameterVector};

/// Sample-count weighted federated averaging.
///
/// A single update is returned unchanged. Layers are reduced in parallel; within
/// a layer, updates are summed in `client_id` order so repeated runs over the
/// same set produce bit-identical output regardless of arrival order.
///
/// # Errors
///
/// * [`FedError::EmptyUpdates`] if `updates` is empty
/// * [`FedError::ShapeMismatch`] if any two updates disagree on shapes
/// * [`FedError::ZeroSampleCount`] if the sample counts sum to zero
pub fn fedavg(updates: &[ClientUpdate]) -> Result<ParameterVector> {
    let schema = consistent_schema(updates)?;

    if let [single] = updates {
        return Ok(single.parameters.clone());
    }

    let ordered = sorted_by_client(updates);
    // Widened so no combination of u64 counts can overflow.
    let total: u128 = ordered.iter().map(|u| u128::from(u.sample_count)).sum();
    if total == 0 {
        return Err(FedError::ZeroSampleCount);
    }
    let weights: Vec<f32> = ordered
        .iter()
        .map(|u| (u.sample_count as f64 / total as f64) as f32)
        .collect();

    let layers: Vec<ArrayD<f32>> = (0..schema.layers().len())
        .into_par_iter()
        .map(|idx| {
            let mut acc = ArrayD::<f32>::zeros(schema.layers()[idx].as_slice());
            for (update, &weight) in ordered.iter().zip(&weights) {
                acc.scaled_add(weight, &update.parameters.layers()[idx]);
            }
            acc
        })
        .collect();

    Ok(ParameterVector::new(layers))
}

/// Sample-weighted mean of per-client losses: `Σ n·loss / Σ n`.
///
/// Returns `None` when there are no results or no examples.
pub fn weighted_loss(results: &[(u64, f64)]) -> Option<f64> {
    let total: u128 = results.iter().map(|&(n, _)| u128::from(n)).sum();
    if total == 0 {
        return None;
    }
    let weighted: f64 = results.iter().map(|&(n, loss)| n as f64 * loss).sum();
    Some(weighted / total as f64)
}

/// [`AggregationStrategy`] wrapper around [`fedavg`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FedAvg;

impl AggregationStrategy for FedAvg {
    fn name(&self) -> &'static str {
        "fedavg"
    }

    fn aggregate(&self, updates: &[ClientUpdate]) -> Result<ParameterVector> {
        fedavg(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregators::test_support::{filled_update, row_update};

    #[test]
    fn test_fedavg_weighted_closed_form() {
        // (10*0 + 30*1) / 40 = 0.75
        let updates = vec![filled_update("a", 0.0, 10), filled_update("b", 1.0, 30)];
        let result = fedavg(&updates).unwrap();
        assert!(result.values().all(|&v| (v - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_fedavg_is_not_plain_mean() {
        let updates = vec![row_update("a", &[1.0], 1), row_update("b", &[3.0], 3)];
        let result = fedavg(&updates).unwrap();
        // (1*1 + 3*3) / 4 = 2.5, plain mean would give 2.0
        assert!((result.layers()[0][[0, 0]] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_fedavg_single_client_unchanged() {
        let update = row_update("only", &[42.0, 7.0], 5);
        let result = fedavg(std::slice::from_ref(&update)).unwrap();
        assert_eq!(result, update.parameters);
    }

    #[test]
    fn test_fedavg_empty() {
        assert!(matches!(fedavg(&[]), Err(FedError::EmptyUpdates)));
    }

    #[test]
    fn test_fedavg_shape_mismatch() {
        let updates = vec![row_update("a", &[1.0, 2.0], 1), row_update("b", &[1.0], 1)];
        assert!(matches!(fedavg(&updates), Err(FedError::ShapeMismatch(_))));
    }

    #[test]
    fn test_fedavg_zero_samples() {
        let updates = vec![row_update("a", &[1.0], 0), row_update("b", &[2.0], 0)];
        assert!(matches!(fedavg(&updates), Err(FedError::ZeroSampleCount)));
    }

    #[test]
    fn test_fedavg_arrival_order_is_irrelevant() {
        let forward = vec![
            row_update("a", &[0.1, 0.7], 3),
            row_update("b", &[0.2, 0.3], 11),
            row_update("c", &[0.9, 0.05], 7),
        ];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(fedavg(&forward).unwrap(), fedavg(&backward).unwrap());
    }

    #[test]
    fn test_weighted_loss() {
        let loss = weighted_loss(&[(10, 1.0), (30, 3.0)]).unwrap();
        assert!((loss - 2.5).abs() < 1e-12);
        assert_eq!(weighted_loss(&[]), None);
        assert_eq!(weighted_loss(&[(0, 4.0)]), None);
    }

    #[test]
    fn test_fedavg_huge_sample_counts_do_not_overflow() {
        let updates = vec![row_update("a", &[1.0], u64::MAX), row_update("b", &[3.0], 2)];
        let result = fedavg(&updates).unwrap();
        assert!((result.layers()[0][[0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_loss_huge_counts() {
        let loss = weighted_loss(&[(u64::MAX, 2.0), (u64::MAX, 2.0)]).unwrap();
        assert!((loss - 2.0).abs() < 1e-9);
    }
}
