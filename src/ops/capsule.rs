//! Capsule-network helpers: the squash nonlinearity, a stable vector norm
//! and the initializer for vote transformation matrices.

use burn::tensor::{Tensor, TensorData, backend::Backend};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SeparationError};

/// Epsilon inside the square roots of [`squash`] and [`safe_norm`].
pub const CAPSULE_EPSILON: f64 = 1e-7;

/// Truncated normal samples are redrawn beyond this many deviations.
const TRUNCATION: f64 = 2.0;

/// `s * |s|² / (1 + |s|²) / sqrt(|s|² + eps)` along `dim`.
pub fn squash<B: Backend, const D: usize>(s: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let dims = s.dims();
    let squared_norm = s.clone().powf_scalar(2.0).sum_dim(dim);
    let norm = squared_norm.clone().add_scalar(CAPSULE_EPSILON).sqrt();
    let factor = squared_norm.clone() / squared_norm.add_scalar(1.0) / norm;
    s * factor.expand(dims)
}

/// `sqrt(sum(s²) + eps)` along `dim`; the reduced dimension is kept with
/// size 1.
pub fn safe_norm<B: Backend, const D: usize>(s: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    s.powf_scalar(2.0)
        .sum_dim(dim)
        .add_scalar(CAPSULE_EPSILON)
        .sqrt()
}

/// Which fan the initializer scale is divided by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    FanIn,
    FanOut,
    FanAvg,
}

impl FanMode {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "fan_in" => Ok(Self::FanIn),
            "fan_out" => Ok(Self::FanOut),
            "fan_avg" => Ok(Self::FanAvg),
            other => Err(SeparationError::configuration(
                "mode",
                format!("unknown fan mode `{other}`, expected fan_in, fan_out or fan_avg"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitDistribution {
    /// Normal truncated at two standard deviations.
    Normal,
    Uniform,
}

impl InitDistribution {
    /// Case-insensitive.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "uniform" => Ok(Self::Uniform),
            _ => Err(SeparationError::configuration(
                "distribution",
                format!("unknown distribution `{name}`, expected normal or uniform"),
            )),
        }
    }
}

/// Initializer for capsule vote transformation matrices shaped
/// `[caps_in, dim_in, caps_out, dim_out]`.
///
/// The fan-in is `dim_in` and the fan-out `dim_out`. With a seed the draw is
/// reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteTransformInitializer {
    scale: f64,
    mode: FanMode,
    distribution: InitDistribution,
    seed: Option<u64>,
}

impl VoteTransformInitializer {
    pub fn new(
        scale: f64,
        mode: FanMode,
        distribution: InitDistribution,
        seed: Option<u64>,
    ) -> Result<Self> {
        let initializer = Self {
            scale,
            mode,
            distribution,
            seed,
        };
        initializer.validate()?;
        Ok(initializer)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.scale > 0.0) {
            return Err(SeparationError::configuration(
                "scale",
                format!("must be a positive float, got {}", self.scale),
            ));
        }
        Ok(())
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn mode(&self) -> FanMode {
        self.mode
    }

    pub fn distribution(&self) -> InitDistribution {
        self.distribution
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Variance scale after dividing by the selected fan.
    pub fn fan_scale(&self, shape: [usize; 4]) -> f64 {
        let fan_in = shape[1] as f64;
        let fan_out = shape[3] as f64;
        let fan = match self.mode {
            FanMode::FanIn => fan_in,
            FanMode::FanOut => fan_out,
            FanMode::FanAvg => (fan_in + fan_out) / 2.0,
        };
        self.scale / fan.max(1.0)
    }

    /// Host-side samples in row-major order.
    pub fn sample(&self, shape: [usize; 4]) -> Result<Vec<f32>> {
        self.validate()?;
        let count: usize = shape.iter().product();
        let scale = self.fan_scale(shape);
        let mut rng = match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };

        let values = match self.distribution {
            InitDistribution::Normal => {
                let stddev = scale.sqrt();
                (0..count)
                    .map(|_| loop {
                        let value: f64 = rng.sample(StandardNormal);
                        if value.abs() <= TRUNCATION {
                            break (value * stddev) as f32;
                        }
                    })
                    .collect()
            }
            InitDistribution::Uniform => {
                let limit = (3.0 * scale).sqrt();
                (0..count)
                    .map(|_| rng.random_range(-limit..limit) as f32)
                    .collect()
            }
        };
        Ok(values)
    }

    /// Draws a tensor of the given shape.
    pub fn init<B: Backend>(&self, shape: [usize; 4], device: &B::Device) -> Result<Tensor<B, 4>> {
        let values = self.sample(shape)?;
        Ok(Tensor::from_data(TensorData::new(values, shape), device))
    }
}

/// Vote initializer with `fan_avg` scaling and a uniform distribution.
pub fn capsule_initializer(scale: f64, seed: Option<u64>) -> Result<VoteTransformInitializer> {
    VoteTransformInitializer::new(scale, FanMode::FanAvg, InitDistribution::Uniform, seed)
}
