//! Structural checks on a single client update.

use crate::error::{FedError, Result, RoundNumber};
use crate::params::{ClientUpdate, ShapeSchema};

use super::norm_bound::check_norm_bound;

/// Largest sample count a single client may report.
pub const MAX_SAMPLE_COUNT: u64 = 1 << 40;

/// What the scheduler expects of an update it dispatched.
#[derive(Clone, Debug)]
pub struct UpdateExpectations<'a> {
    /// Client the request was sent to
    pub client_id: &'a str,
    /// Round the request was sent for
    pub round: RoundNumber,
    /// Layer shapes of the global model
    pub schema: &'a ShapeSchema,
    /// Optional L2 norm ceiling
    pub max_norm: Option<f32>,
}

/// Verify an update against what was dispatched.
///
/// Rejects updates that claim another client or round, report no training
/// examples, disagree with the model schema, contain NaN or infinity, or
/// exceed the norm bound.
pub fn verify_update(update: &ClientUpdate, expected: &UpdateExpectations<'_>) -> Result<()> {
    if update.client_id != expected.client_id {
        return Err(FedError::Verification(format!(
            "update claims client {:?}, sent to {:?}",
            update.client_id, expected.client_id
        )));
    }
    if update.round != expected.round {
        return Err(FedError::Verification(format!(
            "update is labelled round {}, expected {}",
            update.round, expected.round
        )));
    }
    check_sample_count(update.sample_count)?;
    expected.schema.check(&update.parameters)?;
    if !update.parameters.all_finite() {
        return Err(FedError::Verification(
            "parameters contain non-finite values".to_string(),
        ));
    }
    if let Some(max_norm) = expected.max_norm {
        check_norm_bound(&update.parameters, max_norm)?;
    }
    Ok(())
}

/// Reject sample counts of zero or above [`MAX_SAMPLE_COUNT`].
pub fn check_sample_count(sample_count: u64) -> Result<()> {
    if sample_count == 0 {
        return Err(FedError::Verification(
            "sample_count must be positive".to_string(),
        ));
    }
    if sample_count > MAX_SAMPLE_COUNT {
        return Err(FedError::Verification(format!(
            "sample_count {sample_count} exceeds {MAX_SAMPLE_COUNT}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterVector;

    fn schema() -> ShapeSchema {
        ShapeSchema::new(vec![vec![2, 2], vec![2]])
    }

    fn expectations(schema: &ShapeSchema) -> UpdateExpectations<'_> {
        UpdateExpectations {
            client_id: "alice",
            round: 4,
            schema,
            max_norm: None,
        }
    }

    fn good_update() -> ClientUpdate {
        ClientUpdate::new("alice", ParameterVector::filled(&schema(), 0.5), 12, 4)
    }

    #[test]
    fn test_accepts_well_formed_update() {
        let schema = schema();
        assert!(verify_update(&good_update(), &expectations(&schema)).is_ok());
    }

    #[test]
    fn test_rejects_foreign_client() {
        let schema = schema();
        let mut update = good_update();
        update.client_id = "mallory".to_string();
        assert!(matches!(
            verify_update(&update, &expectations(&schema)),
            Err(FedError::Verification(_))
        ));
    }

    #[test]
    fn test_rejects_stale_round() {
        let schema = schema();
        let mut update = good_update();
        update.round = 3;
        let err = verify_update(&update, &expectations(&schema)).unwrap_err();
        assert!(err.to_string().contains("round 3"));
    }

    #[test]
    fn test_rejects_zero_samples() {
        let schema = schema();
        let mut update = good_update();
        update.sample_count = 0;
        assert!(verify_update(&update, &expectations(&schema)).is_err());
    }

    #[test]
    fn test_rejects_absurd_sample_count() {
        let schema = schema();
        let mut update = good_update();
        update.sample_count = u64::MAX;
        let err = verify_update(&update, &expectations(&schema)).unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        update.sample_count = MAX_SAMPLE_COUNT;
        assert!(verify_update(&update, &expectations(&schema)).is_ok());
    }

    #[test]
    fn test_rejects_shape_mismatch() {
        let schema = schema();
        let mut update = good_update();
        update.parameters = ParameterVector::filled(&ShapeSchema::new(vec![vec![4]]), 0.5);
        assert!(matches!(
            verify_update(&update, &expectations(&schema)),
            Err(FedError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_rejects_nan() {
        let schema = schema();
        let mut update = good_update();
        update.parameters = ParameterVector::filled(&schema, f32::NAN);
        assert!(verify_update(&update, &expectations(&schema)).is_err());
    }

    #[test]
    fn test_norm_bound_applies_when_set() {
        let schema = schema();
        let mut expected = expectations(&schema);
        expected.max_norm = Some(0.1);
        // six values of 0.5 -> norm ~1.22
        assert!(verify_update(&good_update(), &expected).is_err());
        expected.max_norm = Some(2.0);
        assert!(verify_update(&good_update(), &expected).is_ok());
    }
}
