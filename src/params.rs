//! Parameter vectors and client updates, the units of exchange.
//!
//! The coordinator never interprets layer contents. A [`ParameterVector`] is
//! an ordered list of `f32` tensors whose shapes are fixed by the model
//! architecture; a [`ShapeSchema`] captures those shapes so that every update
//! can be checked against the initial model.

use std::fmt;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result, RoundNumber};

/// Identifier a client registers under.
pub type ClientId = String;

/// Ordered model weights, one tensor per layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector {
    layers: Vec<ArrayD<f32>>,
}

impl ParameterVector {
    /// Wrap a list of layer tensors.
    pub fn new(layers: Vec<ArrayD<f32>>) -> Self {
        Self { layers }
    }

    /// Build a vector whose layers all hold `value`, with the given shapes.
    pub fn filled(schema: &ShapeSchema, value: f32) -> Self {
        let layers = schema
            .layers()
            .iter()
            .map(|shape| ArrayD::from_elem(IxDyn(shape), value))
            .collect();
        Self { layers }
    }

    /// Build a vector from flat row-major buffers and their shapes.
    pub fn from_flat(layers: Vec<(Vec<usize>, Vec<f32>)>) -> Result<Self> {
        let layers = layers
            .into_iter()
            .map(|(shape, values)| ArrayD::from_shape_vec(IxDyn(&shape), values))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { layers })
    }

    /// Layer tensors in model order.
    pub fn layers(&self) -> &[ArrayD<f32>] {
        &self.layers
    }

    /// Consume the vector, returning its layers.
    pub fn into_layers(self) -> Vec<ArrayD<f32>> {
        self.layers
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Total number of scalar parameters across all layers.
    pub fn num_params(&self) -> usize {
        self.layers.iter().map(|l| l.len()).sum()
    }

    /// Whether the vector holds no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Shape of each layer.
    pub fn schema(&self) -> ShapeSchema {
        ShapeSchema(self.layers.iter().map(|l| l.shape().to_vec()).collect())
    }

    /// Iterate over every scalar in layer order.
    pub fn values(&self) -> impl Iterator<Item = &f32> {
        self.layers.iter().flat_map(|l| l.iter())
    }

    /// Whether every value is finite (no NaN or infinity).
    pub fn all_finite(&self) -> bool {
        self.values().all(|v| v.is_finite())
    }

    /// Encode as CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| FedError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR produced by [`to_cbor`](Self::to_cbor).
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| FedError::Serialization(e.to_string()))
    }
}

/// Layer shapes of a model, in layer order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeSchema(Vec<Vec<usize>>);

impl ShapeSchema {
    /// Create a schema from explicit layer shapes.
    pub fn new(layers: Vec<Vec<usize>>) -> Self {
        Self(layers)
    }

    /// Shapes in layer order.
    pub fn layers(&self) -> &[Vec<usize>] {
        &self.0
    }

    /// Fail with [`FedError::ShapeMismatch`] unless `params` has exactly these shapes.
    pub fn check(&self, params: &ParameterVector) -> Result<()> {
        if params.num_layers() != self.0.len() {
            return Err(FedError::ShapeMismatch(format!(
                "expected {} layers, got {}",
                self.0.len(),
                params.num_layers()
            )));
        }
        for (idx, (expected, layer)) in self.0.iter().zip(params.layers()).enumerate() {
            if layer.shape() != expected.as_slice() {
                return Err(FedError::ShapeMismatch(format!(
                    "layer {} expected shape {:?}, got {:?}",
                    idx,
                    expected,
                    layer.shape()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ShapeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// A client's locally trained parameters for one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    /// Client that produced the update
    pub client_id: ClientId,
    /// Locally trained parameters
    pub parameters: ParameterVector,
    /// Number of local training examples behind the update
    pub sample_count: u64,
    /// Round the update was trained for
    pub round: RoundNumber,
}

impl ClientUpdate {
    /// Create an update.
    pub fn new(
        client_id: impl Into<ClientId>,
        parameters: ParameterVector,
        sample_count: u64,
        round: RoundNumber,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            parameters,
            sample_count,
            round,
        }
    }
}
