//! The `(numerator, normalizer)` pair returned by every loss.

use burn::tensor::{ElementConversion, Tensor, backend::Backend};

use crate::errors::{Result, SeparationError};

/// Loss numerator and normalizer, both single-element tensors.
///
/// Losses are kept unnormalized so results from several minibatches (or
/// shards) can be summed with [`LossOutput::accumulate`] before the single
/// final division.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// Summed loss over all valid elements.
    pub loss: Tensor<B, 1>,
    /// Number (or fractional weight) of loss-bearing elements.
    pub norm: Tensor<B, 1>,
}

impl<B: Backend> LossOutput<B> {
    pub fn new(loss: Tensor<B, 1>, norm: Tensor<B, 1>) -> Self {
        Self { loss, norm }
    }

    /// Builds a result whose normalizer is a host-side count.
    pub(crate) fn with_count(loss: Tensor<B, 1>, count: f32) -> Self {
        let norm = Tensor::from_floats([count], &loss.device());
        Self { loss, norm }
    }

    /// Sums two results componentwise.
    pub fn accumulate(self, other: Self) -> Self {
        Self {
            loss: self.loss + other.loss,
            norm: self.norm + other.norm,
        }
    }

    /// Reads both components back to the host.
    pub fn to_scalars(&self) -> (f32, f32) {
        let loss: f32 = self.loss.clone().into_scalar().elem();
        let norm: f32 = self.norm.clone().into_scalar().elem();
        (loss, norm)
    }

    /// Mean loss on the host. Fails when nothing in the batch was valid.
    pub fn mean(&self) -> Result<f32> {
        let (loss, norm) = self.to_scalars();
        if norm <= 0.0 {
            return Err(SeparationError::degenerate(
                "loss normalizer is zero, no valid elements in the batch",
            ));
        }
        Ok(loss / norm)
    }

    /// Differentiable `loss / norm`. The caller guarantees a non-zero
    /// normalizer.
    pub fn normalized(self) -> Tensor<B, 1> {
        self.loss / self.norm
    }
}
