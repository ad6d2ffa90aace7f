//! Norm computations for vectors.
//!
//! Used by update verification and by round logging.

use crate::params::ParameterVector;

/// L2 norm of all parameters, treating the layers as one flat vector.
///
/// Accumulates in f64 so that large models do not lose the small layers.
pub fn parameters_l2_norm(params: &ParameterVector) -> f32 {
    params
        .values()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parameters_norm_empty() {
        assert_eq!(parameters_l2_norm(&ParameterVector::new(vec![])), 0.0);
    }

    #[test]
    fn test_parameters_norm_spans_layers() {
        // 3 in one layer, 4 in the other
        let params = ParameterVector::new(vec![
            array![[3.0, 0.0]].into_dyn(),
            array![4.0].into_dyn(),
        ]);
        assert!((parameters_l2_norm(&params) - 5.0).abs() < 1e-6);
    }
}
