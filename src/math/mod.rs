//! Mathematical primitives.
//!
//! - [`norms`] - L2 norm over whole parameter vectors

pub mod norms;

pub use norms::parameters_l2_norm;
