use ndarray::{Array2, Axis, concatenate, s};

use super::sigproc::{
    complex_spectrum, dct_ortho, floored_log, frame_signal, hamming, lifter, magnitude_spectrum,
    mel_filterbank, power_spectrum, preemphasis, seconds_to_samples, snip,
};
use super::{FeatureComputer, FeatureConfig, FeatureKind};
use crate::errors::{Result, SeparationError};

fn frame_sizes(config: &FeatureConfig, rate: u32) -> Result<(usize, usize)> {
    let frame_len = seconds_to_samples(config.winlen, rate);
    let frame_step = seconds_to_samples(config.winstep, rate);
    if frame_len == 0 || frame_step == 0 {
        return Err(SeparationError::Feature {
            message: format!(
                "window of {}s with step {}s is empty at {rate} Hz",
                config.winlen, config.winstep
            ),
        });
    }
    Ok((frame_len, frame_step))
}

/// Pre-emphasized, Hamming-windowed frames.
fn windowed_frames(config: &FeatureConfig, signal: &[f32], rate: u32) -> Result<Array2<f32>> {
    if signal.is_empty() {
        return Err(SeparationError::Feature {
            message: "empty signal".to_string(),
        });
    }
    let (frame_len, frame_step) = frame_sizes(config, rate)?;
    let emphasized = preemphasis(signal, config.preemph);
    frame_signal(&emphasized, frame_len, frame_step, &hamming(frame_len))
}

/// Log mel filterbank energies and the log frame energy.
fn log_filterbank(
    config: &FeatureConfig,
    signal: &[f32],
    rate: u32,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let frames = windowed_frames(config, signal, rate)?;
    let power = power_spectrum(&frames, config.nfft)?;
    let energy = power.sum_axis(Axis(1)).insert_axis(Axis(1));

    let highfreq = config.highfreq.unwrap_or(rate as f32 / 2.0);
    let filters = mel_filterbank(config.nfilt, config.nfft, rate, config.lowfreq, highfreq)?;
    let energies = power.dot(&filters.t());
    Ok((floored_log(&energies), floored_log(&energy)))
}

/// The signal itself, with the samples after the last complete frame
/// removed, as a `[samples, 1]` matrix.
#[derive(Debug, Clone)]
pub struct Raw {
    config: FeatureConfig,
}

impl Raw {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }
}

impl FeatureComputer for Raw {
    fn compute(&self, signal: &[f32], rate: u32) -> Result<Array2<f32>> {
        let (frame_len, frame_step) = frame_sizes(&self.config, rate)?;
        let snipped = snip(signal, frame_len, frame_step);
        Array2::from_shape_vec((snipped.len(), 1), snipped.to_vec()).map_err(|e| {
            SeparationError::Feature {
                message: e.to_string(),
            }
        })
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn kind(&self) -> FeatureKind {
        FeatureKind::Raw
    }
}

/// Magnitude spectrogram.
#[derive(Debug, Clone)]
pub struct Magspec {
    config: FeatureConfig,
}

impl Magspec {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }
}

impl FeatureComputer for Magspec {
    fn compute(&self, signal: &[f32], rate: u32) -> Result<Array2<f32>> {
        let frames = windowed_frames(&self.config, signal, rate)?;
        magnitude_spectrum(&frames, self.config.nfft)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.config.spectrum_bins())
    }

    fn kind(&self) -> FeatureKind {
        FeatureKind::Magspec
    }
}

/// Log power spectrogram.
#[derive(Debug, Clone)]
pub struct Logspec {
    config: FeatureConfig,
}

impl Logspec {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }
}

impl FeatureComputer for Logspec {
    fn compute(&self, signal: &[f32], rate: u32) -> Result<Array2<f32>> {
        let frames = windowed_frames(&self.config, signal, rate)?;
        Ok(floored_log(&power_spectrum(&frames, self.config.nfft)?))
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.config.spectrum_bins())
    }

    fn kind(&self) -> FeatureKind {
        FeatureKind::Logspec
    }
}

/// Complex spectrogram with the real parts followed by the imaginary parts.
#[derive(Debug, Clone)]
pub struct Spec {
    config: FeatureConfig,
}

impl Spec {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }
}

impl FeatureComputer for Spec {
    fn compute(&self, signal: &[f32], rate: u32) -> Result<Array2<f32>> {
        let frames = windowed_frames(&self.config, signal, rate)?;
        let spectrum = complex_spectrum(&frames, self.config.nfft)?;
        let real = spectrum.mapv(|bin| bin.re);
        let imaginary = spectrum.mapv(|bin| bin.im);
        concatenate(Axis(1), &[real.view(), imaginary.view()]).map_err(|e| {
            SeparationError::Feature {
                message: e.to_string(),
            }
        })
    }

    fn dimension(&self) -> Option<usize> {
        Some(2 * self.config.spectrum_bins())
    }

    fn kind(&self) -> FeatureKind {
        FeatureKind::Spec
    }
}

/// Log mel filterbank energies, followed by the log frame energy when
/// `include_energy` is set.
#[derive(Debug, Clone)]
pub struct Fbank {
    config: FeatureConfig,
}

impl Fbank {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }
}

impl FeatureComputer for Fbank {
    fn compute(&self, signal: &[f32], rate: u32) -> Result<Array2<f32>> {
        let (energies, energy) = log_filterbank(&self.config, signal, rate)?;
        if !self.config.include_energy {
            return Ok(energies);
        }
        concatenate(Axis(1), &[energies.view(), energy.view()]).map_err(|e| {
            SeparationError::Feature {
                message: e.to_string(),
            }
        })
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.config.nfilt + usize::from(self.config.include_energy))
    }

    fn kind(&self) -> FeatureKind {
        FeatureKind::Fbank
    }
}

/// Mel cepstral coefficients.
#[derive(Debug, Clone)]
pub struct Mfcc {
    config: FeatureConfig,
}

impl Mfcc {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }
}

impl FeatureComputer for Mfcc {
    fn compute(&self, signal: &[f32], rate: u32) -> Result<Array2<f32>> {
        let (energies, energy) = log_filterbank(&self.config, signal, rate)?;
        let mut cepstra = dct_ortho(&energies, self.config.numcep);
        lifter(&mut cepstra, self.config.ceplifter);
        if self.config.include_energy {
            cepstra.slice_mut(s![.., 0..1]).assign(&energy);
        }
        Ok(cepstra)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.config.numcep)
    }

    fn kind(&self) -> FeatureKind {
        FeatureKind::Mfcc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::feature_computer;
    use std::f32::consts::PI;

    const RATE: u32 = 8000;

    fn tone(samples: usize, frequency: f32) -> Vec<f32> {
        (0..samples)
            .map(|n| (2.0 * PI * frequency * n as f32 / RATE as f32).sin())
            .collect()
    }

    fn config() -> FeatureConfig {
        // 200-sample frames, 80-sample step at 8 kHz
        FeatureConfig::new().nfft(256)
    }

    #[test]
    fn test_output_dimensions_match() {
        let signal = tone(1000, 440.0);
        for name in ["fbank", "mfcc", "logspec", "magspec", "spec"] {
            let computer = feature_computer(name, config()).unwrap();
            let features = computer.compute(&signal, RATE).unwrap();
            // 1 + ceil((1000 - 200) / 80)
            assert_eq!(features.nrows(), 11, "{name}");
            assert_eq!(Some(features.ncols()), computer.dimension(), "{name}");
            assert!(features.iter().all(|value| value.is_finite()), "{name}");
        }
    }

    #[test]
    fn test_raw_snips_trailing_samples() {
        let signal = tone(1000, 440.0);
        let features = Raw::new(config()).compute(&signal, RATE).unwrap();
        // 200 + 10 * 80
        assert_eq!(features.dim(), (1000, 1));
        let features = Raw::new(config()).compute(&signal[..990], RATE).unwrap();
        assert_eq!(features.dim(), (920, 1));
        assert_eq!(features[[5, 0]], signal[5]);
    }

    #[test]
    fn test_magspec_peaks_at_tone() {
        // 1 kHz lands on bin 32 of a 256-point FFT at 8 kHz
        let signal = tone(1000, 1000.0);
        let features = Magspec::new(config().winlen(0.032).nfft(256))
            .compute(&signal, RATE)
            .unwrap();
        let row = features.row(2);
        let peak = row
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (bin, &value)| {
                if value > best.1 { (bin, value) } else { best }
            })
            .0;
        assert_eq!(peak, 32);
    }

    #[test]
    fn test_mfcc_energy_column() {
        let signal = tone(1000, 440.0);
        let with_energy = Mfcc::new(config()).compute(&signal, RATE).unwrap();
        let without = Mfcc::new(config().include_energy(false))
            .compute(&signal, RATE)
            .unwrap();
        assert_eq!(with_energy.dim(), without.dim());
        for frame in 0..with_energy.nrows() {
            for coefficient in 1..13 {
                let a = with_energy[[frame, coefficient]];
                let b = without[[frame, coefficient]];
                assert!((a - b).abs() < 1e-4);
            }
        }

        let fbank = Fbank::new(config()).compute(&signal, RATE).unwrap();
        for frame in 0..fbank.nrows() {
            assert!((fbank[[frame, 26]] - with_energy[[frame, 0]]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_empty_signal_is_an_error() {
        assert!(matches!(
            Fbank::new(config()).compute(&[], RATE),
            Err(SeparationError::Feature { .. })
        ));
    }
}
