//! Loss computer configuration.

use serde::{Deserialize, Serialize};

use super::LossKind;
use crate::errors::{Result, SeparationError};
use crate::ops::ratio::DEFAULT_CLOSEST_EPSILON;
use crate::ops::reconstruction::DC_PIT_ALPHA;

/// Configuration for a [`LossComputer`](super::LossComputer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Loss function to use.
    pub loss_type: LossKind,
    /// Leading dimension every input tensor must have.
    pub batch_size: usize,
    /// Power applied to the dist2mean ratios.
    pub rat_power: f64,
    /// Margin added to the closest competing distance.
    pub epsilon: f64,
    /// Weight of the PIT term in the joint deep clustering loss.
    pub alpha: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_type: LossKind::Deepclustering,
            batch_size: 32,
            rat_power: 1.0,
            epsilon: DEFAULT_CLOSEST_EPSILON,
            alpha: DC_PIT_ALPHA,
        }
    }
}

impl LossConfig {
    /// Creates a new LossConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON object; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the loss function.
    pub fn loss_type(mut self, loss_type: LossKind) -> Self {
        self.loss_type = loss_type;
        self
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn rat_power(mut self, power: f64) -> Self {
        self.rat_power = power;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Rejects values no loss can work with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SeparationError::configuration("batch_size", "must be at least 1"));
        }
        if !self.rat_power.is_finite() || self.rat_power <= 0.0 {
            return Err(SeparationError::configuration(
                "rat_power",
                format!("must be a positive number, got {}", self.rat_power),
            ));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(SeparationError::configuration(
                "epsilon",
                format!("must be a non-negative number, got {}", self.epsilon),
            ));
        }
        if !self.alpha.is_finite() {
            return Err(SeparationError::configuration("alpha", "must be finite"));
        }
        Ok(())
    }
}
