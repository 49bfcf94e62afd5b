//! Mask-based reconstruction losses.
//!
//! The network emits one mask per speaker; masks multiplied with the
//! mixture give per-speaker reconstructions, scored by squared error against
//! the clean sources. Targets are `[batch, time, feat, nrS]` and the mixture
//! `[batch, time, feat]`. Padded frames carry zero weight.

use burn::tensor::{Tensor, activation::softmax, backend::Backend};

use super::clustering::deepclustering_loss;
use super::embedding::{attractor_distance, attractors, check_prefix, values_per_bin};
use super::output::LossOutput;
use super::permutation::{PermutationSearch, squared_error_pairs, summed_min_cost};
use super::sequence::{check_lengths, sequence_mask};
use crate::errors::{Result, SeparationError};

/// Weight of the PIT term in [`dc_pit_loss`].
pub const DC_PIT_ALPHA: f64 = 1.423024812840571e-9;

struct ReconstructionShape {
    batch_size: usize,
    max_time: usize,
    feat_dim: usize,
    num_sources: usize,
}

impl ReconstructionShape {
    /// Validates the mixture and the lengths against the targets.
    fn of<B: Backend>(
        targets: &Tensor<B, 4>,
        mix_to_mask: &Tensor<B, 3>,
        seq_length: &[usize],
    ) -> Result<Self> {
        let [batch_size, max_time, feat_dim, num_sources] = targets.dims();
        if mix_to_mask.dims() != [batch_size, max_time, feat_dim] {
            return Err(SeparationError::shape(
                "mixture to mask",
                format!("{:?}", [batch_size, max_time, feat_dim]),
                format!("{:?}", mix_to_mask.dims()),
            ));
        }
        check_lengths(seq_length, batch_size, max_time)?;
        Ok(Self {
            batch_size,
            max_time,
            feat_dim,
            num_sources,
        })
    }

    /// `sum(lengths) * nrS * feat`
    fn normalizer(&self, seq_length: &[usize]) -> f32 {
        let frames: usize = seq_length.iter().sum();
        (frames * self.num_sources * self.feat_dim) as f32
    }

    /// Sequence mask broadcast over features, `[batch, time, feat]`.
    fn frame_weights<B: Backend>(
        &self,
        seq_length: &[usize],
        device: &B::Device,
    ) -> Result<Tensor<B, 3>> {
        let mask = sequence_mask::<B>(seq_length, self.max_time, device)?;
        Ok(mask
            .reshape([self.batch_size, self.max_time, 1])
            .expand([self.batch_size, self.max_time, self.feat_dim]))
    }

    /// Speaker-major mask logits are `[batch, time, nrS * feat]`.
    fn check_logits(&self, dims: [usize; 3]) -> Result<()> {
        let expected = [self.batch_size, self.max_time, self.feat_dim * self.num_sources];
        if dims != expected {
            return Err(SeparationError::shape(
                "mask logits",
                format!("{expected:?}"),
                format!("{dims:?}"),
            ));
        }
        Ok(())
    }

    fn apply_masks<B: Backend>(&self, masks: Tensor<B, 4>, mix_to_mask: Tensor<B, 3>) -> Tensor<B, 4> {
        let shape = [self.batch_size, self.max_time, self.feat_dim, self.num_sources];
        masks
            * mix_to_mask
                .reshape([self.batch_size, self.max_time, self.feat_dim, 1])
                .expand(shape)
    }
}

/// Softmax masks from speaker-major logits `[batch, time, nrS * feat]`.
fn masks_from_logits<B: Backend>(
    shape: &ReconstructionShape,
    logits: Tensor<B, 3>,
) -> Result<Tensor<B, 4>> {
    shape.check_logits(logits.dims())?;
    let per_speaker = logits
        .reshape([shape.batch_size, shape.max_time, shape.num_sources, shape.feat_dim])
        .swap_dims(2, 3);
    Ok(softmax(per_speaker, 3))
}

fn permutation_invariant<B: Backend>(
    shape: &ReconstructionShape,
    search: &PermutationSearch,
    recs: Tensor<B, 4>,
    targets: Tensor<B, 4>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let weights = shape.frame_weights::<B>(seq_length, &recs.device())?;
    let pairs = squared_error_pairs(recs, targets, weights)?;
    let loss = summed_min_cost(search, pairs)?;
    Ok(LossOutput::with_count(loss, shape.normalizer(seq_length)))
}

/// Squared reconstruction error with targets taken in the given order.
pub fn direct_loss<B: Backend>(
    targets: Tensor<B, 4>,
    logits: Tensor<B, 3>,
    mix_to_mask: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let shape = ReconstructionShape::of(&targets, &mix_to_mask, seq_length)?;
    let recs = shape.apply_masks(masks_from_logits(&shape, logits)?, mix_to_mask);
    let weights = shape
        .frame_weights::<B>(seq_length, &targets.device())?
        .reshape([shape.batch_size, shape.max_time, shape.feat_dim, 1])
        .expand([shape.batch_size, shape.max_time, shape.feat_dim, shape.num_sources]);

    let loss = ((recs - targets).powf_scalar(2.0) * weights).sum();
    Ok(LossOutput::with_count(loss, shape.normalizer(seq_length)))
}

/// Permutation-invariant reconstruction loss: per utterance, the squared
/// error under the best assignment of output channels to sources.
pub fn pit_loss<B: Backend>(
    targets: Tensor<B, 4>,
    logits: Tensor<B, 3>,
    mix_to_mask: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let shape = ReconstructionShape::of(&targets, &mix_to_mask, seq_length)?;
    let search = PermutationSearch::new(shape.num_sources)?;
    let recs = shape.apply_masks(masks_from_logits(&shape, logits)?, mix_to_mask);
    permutation_invariant(&shape, &search, recs, targets, seq_length)
}

/// PIT with masks derived from attractors.
///
/// Each bin's mask over speakers is the softmax of the inverse distance
/// between its normalized embedding (`[batch, time, feat * emb]`) and the
/// normalized speaker embeddings (`[batch, 1, emb * nrS]`).
pub fn pit_l41_loss<B: Backend>(
    targets: Tensor<B, 4>,
    bin_embeddings: Tensor<B, 3>,
    spk_embeddings: Tensor<B, 3>,
    mix_to_mask: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let shape = ReconstructionShape::of(&targets, &mix_to_mask, seq_length)?;
    let search = PermutationSearch::new(shape.num_sources)?;
    check_prefix(
        "bin embeddings",
        &bin_embeddings.dims(),
        shape.batch_size,
        shape.max_time,
    )?;
    let emb_dim = values_per_bin(bin_embeddings.dims()[2], shape.feat_dim, "bin embeddings")?;
    let speakers = attractors(spk_embeddings, shape.batch_size, emb_dim, shape.num_sources)?;

    let bins = shape.max_time * shape.feat_dim;
    let distance = attractor_distance(
        bin_embeddings.reshape([shape.batch_size, bins, emb_dim]),
        speakers,
    );
    let masks = softmax(distance.recip(), 2).reshape([
        shape.batch_size,
        shape.max_time,
        shape.feat_dim,
        shape.num_sources,
    ]);

    let recs = shape.apply_masks(masks, mix_to_mask);
    permutation_invariant(&shape, &search, recs, targets, seq_length)
}

/// Deep clustering plus a scaled PIT term, each divided by its own
/// normalizer; the returned normalizer is 1.
///
/// Superseded by combining [`deepclustering_loss`] and [`pit_loss`] in the
/// caller.
#[deprecated(note = "combine deepclustering_loss and pit_loss instead")]
#[allow(clippy::too_many_arguments)]
pub fn dc_pit_loss<B: Backend>(
    targets_dc: Tensor<B, 3>,
    logits_dc: Tensor<B, 3>,
    targets_pit: Tensor<B, 4>,
    logits_pit: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    mix_to_mask: Tensor<B, 3>,
    seq_length: &[usize],
    alpha: f64,
) -> Result<LossOutput<B>> {
    let shape = ReconstructionShape::of(&targets_pit, &mix_to_mask, seq_length)?;
    PermutationSearch::new(shape.num_sources)?;
    shape.check_logits(logits_pit.dims())?;

    let dc = deepclustering_loss(targets_dc, logits_dc, usedbins, seq_length)?;
    let pit = pit_loss(targets_pit, logits_pit, mix_to_mask, seq_length)?;

    let loss = dc.loss / dc.norm.clamp_min(1.0) + (pit.loss / pit.norm.clamp_min(1.0)).mul_scalar(alpha);
    Ok(LossOutput::with_count(loss, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;
    type Device = <TestBackend as Backend>::Device;

    // One frame, two bins, two speakers. Logits are speaker-major: speaker 0
    // owns bin 0 and speaker 1 owns bin 1. The targets list the sources in
    // the opposite order.
    fn swapped(device: &Device) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 3>, Tensor<TestBackend, 3>) {
        let targets = Tensor::from_floats([[[[0.0, 1.0], [1.0, 0.0]]]], device);
        let logits = Tensor::from_floats([[[20.0, -20.0, -20.0, 20.0]]], device);
        let mix = Tensor::ones([1, 1, 2], device);
        (targets, logits, mix)
    }

    #[test]
    fn test_pit_finds_swapped_sources() {
        let device = Device::default();
        let (targets, logits, mix) = swapped(&device);

        let (pit, norm) = pit_loss(targets.clone(), logits.clone(), mix.clone(), &[1])
            .unwrap()
            .to_scalars();
        let (direct, direct_norm) = direct_loss(targets, logits, mix, &[1]).unwrap().to_scalars();

        assert!(pit.abs() < 1e-5, "pit = {pit}");
        assert!((direct - 4.0).abs() < 1e-4, "direct = {direct}");
        assert_eq!(norm, 4.0);
        assert_eq!(direct_norm, 4.0);
    }

    #[test]
    fn test_pit_invariant_to_speaker_order() {
        let device = Device::default();
        let targets = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.3, 0.7], [0.9, 0.1]], [[0.5, 0.5], [0.2, 0.6]]]],
            &device,
        );
        let logits = Tensor::<TestBackend, 3>::from_floats(
            [[[0.4, -1.0, 2.0, 0.1], [1.5, 0.3, -0.7, 0.0]]],
            &device,
        );
        let mix = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.8], [0.6, 0.9]]], &device);
        // Swap the speaker blocks of the logits.
        let swapped_logits = Tensor::cat(
            vec![
                logits.clone().slice([0..1, 0..2, 2..4]),
                logits.clone().slice([0..1, 0..2, 0..2]),
            ],
            2,
        );

        let (a, _) = pit_loss(targets.clone(), logits.clone(), mix.clone(), &[2])
            .unwrap()
            .to_scalars();
        let (b, _) = pit_loss(targets.clone(), swapped_logits, mix.clone(), &[2])
            .unwrap()
            .to_scalars();
        let (direct, _) = direct_loss(targets, logits, mix, &[2]).unwrap().to_scalars();

        assert!((a - b).abs() < 1e-5);
        assert!(a <= direct + 1e-6);
    }

    #[test]
    fn test_padded_frames_get_no_gradient() {
        type Ad = Autodiff<NdArray>;
        let device = Device::default();

        let targets = Tensor::<Ad, 4>::from_floats(
            [[[[0.3, 0.7], [0.9, 0.1]], [[5.0, -5.0], [7.0, 3.0]]]],
            &device,
        );
        let logits = Tensor::<Ad, 3>::from_floats(
            [[[0.4, -1.0, 2.0, 0.1], [1.5, 0.3, -0.7, 0.0]]],
            &device,
        )
        .require_grad();
        let mix = Tensor::<Ad, 3>::from_floats([[[1.0, 0.8], [0.6, 0.9]]], &device);

        for loss in [
            pit_loss(targets.clone(), logits.clone(), mix.clone(), &[1]).unwrap(),
            direct_loss(targets.clone(), logits.clone(), mix.clone(), &[1]).unwrap(),
        ] {
            let grads = loss.loss.backward();
            let grad: Vec<f32> = logits.grad(&grads).unwrap().to_data().to_vec().unwrap();
            // frame 0 is valid, frame 1 is padding
            assert!(grad[..4].iter().any(|value| value.abs() > 0.0));
            assert!(grad[4..].iter().all(|value| *value == 0.0), "{grad:?}");
        }
    }

    #[test]
    fn test_pit_l41_masks_follow_attractors() {
        let device = Device::default();
        // Bin 0 sits on attractor 1, bin 1 on attractor 0.
        let targets = Tensor::<TestBackend, 4>::from_floats([[[[0.0, 1.0], [1.0, 0.0]]]], &device);
        let bins = Tensor::<TestBackend, 3>::from_floats([[[0.0, 1.0, 1.0, 0.0]]], &device);
        let speakers = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 0.0, 1.0]]], &device);
        let mix = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);

        let (loss, norm) = pit_l41_loss(targets, bins, speakers, mix, &[1])
            .unwrap()
            .to_scalars();
        // inverse distances 1e6 and 1/sqrt(2) saturate the softmax
        assert!(loss.abs() < 1e-5, "loss = {loss}");
        assert_eq!(norm, 4.0);
    }

    #[test]
    #[allow(deprecated)]
    fn test_dc_pit_combines_normalized_terms() {
        let device = Device::default();
        let (targets_pit, logits_pit, mix) = swapped(&device);
        let targets_dc = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 0.0, 1.0]]], &device);
        let logits_dc = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 1.0, 0.0]]], &device);
        let usedbins = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);

        let dc = deepclustering_loss(targets_dc.clone(), logits_dc.clone(), usedbins.clone(), &[1])
            .unwrap()
            .mean()
            .unwrap();
        let (loss, norm) = dc_pit_loss(
            targets_dc,
            logits_dc,
            targets_pit,
            logits_pit,
            usedbins,
            mix,
            &[1],
            DC_PIT_ALPHA,
        )
        .unwrap()
        .to_scalars();

        assert!((loss - dc).abs() < 1e-5);
        assert_eq!(norm, 1.0);
    }

    #[test]
    fn test_rejects_wrong_logit_width() {
        let device = Device::default();
        let (targets, _, mix) = swapped(&device);
        let logits = Tensor::<TestBackend, 3>::ones([1, 1, 3], &device);
        assert!(matches!(
            pit_loss(targets, logits, mix, &[1]),
            Err(SeparationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_source_count_checked_before_logits() {
        let device = Device::default();
        let targets = Tensor::<TestBackend, 4>::zeros([1, 1, 1, 9], &device);
        let mix = Tensor::<TestBackend, 3>::ones([1, 1, 1], &device);
        let logits = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);

        assert!(matches!(
            pit_loss(targets, logits, mix, &[1]),
            Err(SeparationError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_long_sequence_before_logits() {
        let device = Device::default();
        let (targets, _, mix) = swapped(&device);
        let logits = Tensor::<TestBackend, 3>::ones([1, 1, 3], &device);

        for result in [
            pit_loss(targets.clone(), logits.clone(), mix.clone(), &[2]),
            direct_loss(targets, logits, mix, &[2]),
        ] {
            match result {
                Err(SeparationError::ShapeMismatch { context, .. }) => {
                    assert!(context.contains("sequence length"), "{context}")
                }
                other => panic!("expected a length error, got {other:?}"),
            }
        }
    }

    #[test]
    #[allow(deprecated)]
    fn test_dc_pit_checks_pit_inputs_first() {
        let device = Device::default();
        // both the embedding logits and the source count are wrong
        let targets_dc = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 0.0, 1.0]]], &device);
        let logits_dc = Tensor::<TestBackend, 3>::ones([1, 1, 3], &device);
        let targets_pit = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 9], &device);
        let logits_pit = Tensor::<TestBackend, 3>::ones([1, 1, 18], &device);
        let usedbins = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);
        let mix = Tensor::<TestBackend, 3>::ones([1, 1, 2], &device);

        let result = dc_pit_loss(
            targets_dc,
            logits_dc,
            targets_pit,
            logits_pit,
            usedbins,
            mix,
            &[1],
            DC_PIT_ALPHA,
        );
        assert!(matches!(result, Err(SeparationError::Configuration { .. })));
    }

    #[test]
    fn test_batch_without_valid_frames_is_zero() {
        let device = Device::default();
        let (targets, logits, mix) = swapped(&device);

        for output in [
            pit_loss(targets.clone(), logits.clone(), mix.clone(), &[0]).unwrap(),
            direct_loss(targets, logits, mix, &[0]).unwrap(),
        ] {
            assert_eq!(output.to_scalars(), (0.0, 0.0));
        }
    }
}
