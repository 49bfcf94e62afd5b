//! Framing, windowing and spectral helpers for the feature computers.

use std::f32::consts::PI;

use ndarray::{Array1, Array2, Axis};
use realfft::{RealFftPlanner, num_complex::Complex};

use crate::errors::{Result, SeparationError};

/// Floor applied before taking logarithms.
pub const LOG_FLOOR: f32 = f32::EPSILON;

fn feature_error(message: impl Into<String>) -> SeparationError {
    SeparationError::Feature {
        message: message.into(),
    }
}

/// Converts a duration in seconds to a whole number of samples.
pub fn seconds_to_samples(seconds: f32, rate: u32) -> usize {
    (seconds * rate as f32).round().max(0.0) as usize
}

/// `y[n] = x[n] - coeff * x[n - 1]`, with `y[0] = x[0]`.
pub fn preemphasis(signal: &[f32], coeff: f32) -> Vec<f32> {
    let mut emphasized = Vec::with_capacity(signal.len());
    if let Some(&first) = signal.first() {
        emphasized.push(first);
    }
    emphasized.extend(signal.windows(2).map(|pair| pair[1] - coeff * pair[0]));
    emphasized
}

/// Symmetric Hamming window.
pub fn hamming(len: usize) -> Vec<f32> {
    if len == 1 {
        return vec![1.0];
    }
    let denominator = (len - 1) as f32;
    (0..len)
        .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f32 / denominator).cos())
        .collect()
}

/// Number of frames needed to cover `len` samples; the last frame is
/// zero-padded.
pub fn num_frames(len: usize, frame_len: usize, frame_step: usize) -> usize {
    if len <= frame_len {
        1
    } else {
        1 + (len - frame_len).div_ceil(frame_step)
    }
}

/// Drops the samples after the last complete frame.
pub fn snip(signal: &[f32], frame_len: usize, frame_step: usize) -> &[f32] {
    if signal.len() <= frame_len || frame_step == 0 {
        return signal;
    }
    let complete = 1 + (signal.len() - frame_len) / frame_step;
    &signal[..frame_len + (complete - 1) * frame_step]
}

/// Splits a signal into overlapping windowed frames, `[frames, frame_len]`.
pub fn frame_signal(
    signal: &[f32],
    frame_len: usize,
    frame_step: usize,
    window: &[f32],
) -> Result<Array2<f32>> {
    if frame_len == 0 || frame_step == 0 {
        return Err(feature_error("frame length and step must be at least one sample"));
    }
    if window.len() != frame_len {
        return Err(feature_error(format!(
            "window of {} samples for frames of {frame_len}",
            window.len()
        )));
    }

    let frames = num_frames(signal.len(), frame_len, frame_step);
    let mut framed = Array2::<f32>::zeros((frames, frame_len));
    for (index, mut row) in framed.axis_iter_mut(Axis(0)).enumerate() {
        let start = index * frame_step;
        for (offset, value) in row.iter_mut().enumerate() {
            if let Some(sample) = signal.get(start + offset) {
                *value = sample * window[offset];
            }
        }
    }
    Ok(framed)
}

/// One-sided FFT of every frame, `[frames, nfft / 2 + 1]`.
///
/// Frames longer than `nfft` are truncated, shorter ones zero-padded.
pub fn complex_spectrum(frames: &Array2<f32>, nfft: usize) -> Result<Array2<Complex<f32>>> {
    if nfft == 0 {
        return Err(feature_error("nfft must be positive"));
    }
    let frame_len = frames.ncols();
    if frame_len > nfft {
        log::warn!("frame length {frame_len} is greater than nfft {nfft}, frames are truncated");
    }

    let mut planner = RealFftPlanner::<f32>::new();
    let plan = planner.plan_fft_forward(nfft);
    let mut input = plan.make_input_vec();
    let mut output = plan.make_output_vec();
    let mut scratch = plan.make_scratch_vec();

    let bins = nfft / 2 + 1;
    let mut spectrum = Array2::<Complex<f32>>::zeros((frames.nrows(), bins));
    for (frame, mut row) in frames.axis_iter(Axis(0)).zip(spectrum.axis_iter_mut(Axis(0))) {
        input.iter_mut().for_each(|value| *value = 0.0);
        for (slot, sample) in input.iter_mut().zip(frame.iter()) {
            *slot = *sample;
        }
        plan.process_with_scratch(&mut input, &mut output, &mut scratch)
            .map_err(|e| feature_error(format!("forward FFT failed: {e}")))?;
        for (slot, bin) in row.iter_mut().zip(output.iter()) {
            *slot = *bin;
        }
    }
    Ok(spectrum)
}

pub fn magnitude_spectrum(frames: &Array2<f32>, nfft: usize) -> Result<Array2<f32>> {
    Ok(complex_spectrum(frames, nfft)?.mapv(|bin| bin.norm()))
}

/// `|X|^2 / nfft`.
pub fn power_spectrum(frames: &Array2<f32>, nfft: usize) -> Result<Array2<f32>> {
    let scale = 1.0 / nfft as f32;
    Ok(magnitude_spectrum(frames, nfft)?.mapv(|magnitude| magnitude * magnitude * scale))
}

/// Natural logarithm with values floored at [`LOG_FLOOR`].
pub fn floored_log(values: &Array2<f32>) -> Array2<f32> {
    values.mapv(|value| value.max(LOG_FLOOR).ln())
}

pub fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

pub fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular filters equally spaced on the mel scale,
/// `[nfilt, nfft / 2 + 1]`.
pub fn mel_filterbank(
    nfilt: usize,
    nfft: usize,
    rate: u32,
    lowfreq: f32,
    highfreq: f32,
) -> Result<Array2<f32>> {
    let nyquist = rate as f32 / 2.0;
    if highfreq > nyquist {
        return Err(feature_error(format!(
            "highfreq {highfreq} is greater than the Nyquist frequency {nyquist}"
        )));
    }
    if lowfreq < 0.0 || lowfreq >= highfreq {
        return Err(feature_error(format!(
            "lowfreq {lowfreq} must lie in [0, highfreq {highfreq})"
        )));
    }

    let low_mel = hz_to_mel(lowfreq);
    let high_mel = hz_to_mel(highfreq);
    let points = Array1::linspace(low_mel, high_mel, nfilt + 2);
    let bins: Vec<usize> = points
        .iter()
        .map(|&mel| ((nfft + 1) as f32 * mel_to_hz(mel) / rate as f32).floor() as usize)
        .collect();

    let mut filters = Array2::<f32>::zeros((nfilt, nfft / 2 + 1));
    for (filter, mut row) in filters.axis_iter_mut(Axis(0)).enumerate() {
        let (left, center, right) = (bins[filter], bins[filter + 1], bins[filter + 2]);
        for bin in left..center {
            row[bin] = (bin - left) as f32 / (center - left) as f32;
        }
        for bin in center..right {
            row[bin] = (right - bin) as f32 / (right - center) as f32;
        }
    }
    Ok(filters)
}

/// Orthonormal DCT-II along the feature axis, keeping the first `numcep`
/// coefficients.
pub fn dct_ortho(features: &Array2<f32>, numcep: usize) -> Array2<f32> {
    let n = features.ncols();
    let mut basis = Array2::<f32>::zeros((n, numcep.min(n)));
    for ((sample, coefficient), value) in basis.indexed_iter_mut() {
        let scale = if coefficient == 0 {
            (1.0 / n as f32).sqrt()
        } else {
            (2.0 / n as f32).sqrt()
        };
        *value = scale
            * (PI * coefficient as f32 * (2 * sample + 1) as f32 / (2 * n) as f32).cos();
    }
    features.dot(&basis)
}

/// Sinusoidal liftering, `1 + L/2 sin(pi n / L)`; `L = 0` leaves the
/// cepstra untouched.
pub fn lifter(cepstra: &mut Array2<f32>, ceplifter: usize) {
    if ceplifter == 0 {
        return;
    }
    let half = ceplifter as f32 / 2.0;
    for (n, mut column) in cepstra.axis_iter_mut(Axis(1)).enumerate() {
        let gain = 1.0 + half * (PI * n as f32 / ceplifter as f32).sin();
        column.mapv_inplace(|value| value * gain);
    }
}
