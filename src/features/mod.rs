//! Feature computers turning a 1-D audio signal into a `[frames, dim]`
//! feature matrix.

mod computers;
pub mod sigproc;

use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SeparationError};

pub use computers::{Fbank, Logspec, Magspec, Mfcc, Raw, Spec};

/// Computes features for a whole utterance.
pub trait FeatureComputer: fmt::Debug + Send + Sync {
    /// `signal` holds the samples, `rate` the sampling rate in Hz.
    fn compute(&self, signal: &[f32], rate: u32) -> Result<Array2<f32>>;

    /// Feature dimension, `None` when it depends on the input.
    fn dimension(&self) -> Option<usize>;

    fn kind(&self) -> FeatureKind;
}

/// Supported feature types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Fbank,
    Mfcc,
    Logspec,
    Magspec,
    Spec,
    Raw,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 6] = [
        FeatureKind::Fbank,
        FeatureKind::Mfcc,
        FeatureKind::Logspec,
        FeatureKind::Magspec,
        FeatureKind::Spec,
        FeatureKind::Raw,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::Fbank => "fbank",
            FeatureKind::Mfcc => "mfcc",
            FeatureKind::Logspec => "logspec",
            FeatureKind::Magspec => "magspec",
            FeatureKind::Spec => "spec",
            FeatureKind::Raw => "raw",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        FeatureKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| {
                SeparationError::configuration(
                    "feature",
                    format!("undefined feature type `{name}`"),
                )
            })
    }

    /// Builds the computer for this feature type.
    pub fn computer(&self, config: FeatureConfig) -> Result<Box<dyn FeatureComputer>> {
        config.validate()?;
        log::debug!("{} feature computer: {:?}", self.name(), config);
        Ok(match self {
            FeatureKind::Fbank => Box::new(Fbank::new(config)),
            FeatureKind::Mfcc => Box::new(Mfcc::new(config)),
            FeatureKind::Logspec => Box::new(Logspec::new(config)),
            FeatureKind::Magspec => Box::new(Magspec::new(config)),
            FeatureKind::Spec => Box::new(Spec::new(config)),
            FeatureKind::Raw => Box::new(Raw::new(config)),
        })
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Creates a feature computer from its type name.
pub fn feature_computer(name: &str, config: FeatureConfig) -> Result<Box<dyn FeatureComputer>> {
    FeatureKind::from_name(name)?.computer(config)
}

/// Framing and filterbank parameters shared by all feature computers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Window length in seconds.
    pub winlen: f32,
    /// Window step in seconds.
    pub winstep: f32,
    pub nfft: usize,
    pub nfilt: usize,
    pub numcep: usize,
    pub lowfreq: f32,
    /// Defaults to half the sampling rate.
    pub highfreq: Option<f32>,
    pub preemph: f32,
    pub ceplifter: usize,
    /// Appends the log frame energy to fbank features and replaces the
    /// zeroth cepstral coefficient by it for mfcc.
    pub include_energy: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            winlen: 0.025,
            winstep: 0.01,
            nfft: 512,
            nfilt: 26,
            numcep: 13,
            lowfreq: 0.0,
            highfreq: None,
            preemph: 0.97,
            ceplifter: 22,
            include_energy: true,
        }
    }
}

impl FeatureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn winlen(mut self, seconds: f32) -> Self {
        self.winlen = seconds;
        self
    }

    pub fn winstep(mut self, seconds: f32) -> Self {
        self.winstep = seconds;
        self
    }

    pub fn nfft(mut self, nfft: usize) -> Self {
        self.nfft = nfft;
        self
    }

    pub fn nfilt(mut self, nfilt: usize) -> Self {
        self.nfilt = nfilt;
        self
    }

    pub fn numcep(mut self, numcep: usize) -> Self {
        self.numcep = numcep;
        self
    }

    pub fn include_energy(mut self, include: bool) -> Self {
        self.include_energy = include;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.winlen > 0.0) {
            return Err(SeparationError::configuration("winlen", "must be positive"));
        }
        if !(self.winstep > 0.0) {
            return Err(SeparationError::configuration("winstep", "must be positive"));
        }
        if self.nfft == 0 {
            return Err(SeparationError::configuration("nfft", "must be positive"));
        }
        if self.nfilt == 0 {
            return Err(SeparationError::configuration("nfilt", "must be positive"));
        }
        if self.numcep == 0 || self.numcep > self.nfilt {
            return Err(SeparationError::configuration(
                "numcep",
                format!("must lie in [1, nfilt = {}], got {}", self.nfilt, self.numcep),
            ));
        }
        if !(0.0..1.0).contains(&self.preemph) {
            return Err(SeparationError::configuration(
                "preemph",
                format!("must lie in [0, 1), got {}", self.preemph),
            ));
        }
        Ok(())
    }

    /// Number of bins of the one-sided spectrum.
    pub fn spectrum_bins(&self) -> usize {
        self.nfft / 2 + 1
    }
}
