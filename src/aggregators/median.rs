//! Coordinate-wise median aggregation
//!
//! Ignores sample counts. Tolerates strictly fewer than half of the clients
//! sending arbitrary values, at the cost of a sort per coordinate.

use super::{coordinate_wise, AggregationStrategy};
use crate::error::Result;
use crate::params::{ClientUpdate, ParameterVector};

/// Coordinate-wise median across client updates.
///
/// For an even number of updates the two middle values are averaged.
pub fn median(updates: &[ClientUpdate]) -> Result<ParameterVector> {
    coordinate_wise(updates, |values| {
        values.sort_by(f32::total_cmp);
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        }
    })
}

/// [`AggregationStrategy`] wrapper around [`median`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CoordinateMedian;

impl AggregationStrategy for CoordinateMedian {
    fn name(&self) -> &'static str {
        "median"
    }

    fn aggregate(&self, updates: &[ClientUpdate]) -> Result<ParameterVector> {
        median(updates)
    }
}
