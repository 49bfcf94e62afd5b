//! Deep clustering losses (Hershey et al. 2016).
//!
//! The pairwise objective `‖VVᵀ − YYᵀ‖²_F` over all bins is evaluated in its
//! factored form `‖VᵀV‖² − 2‖VᵀY‖² + ‖YᵀY‖²`, so the `bins × bins` affinity
//! matrix is never materialized. `V` holds the L2-normalized embeddings of
//! the valid bins and `Y` their one-hot source assignments; both are zeroed
//! outside `usedbins` and outside each example's length.

use burn::tensor::{Tensor, backend::Backend};

use super::embedding::{check_prefix, l2_normalize, values_per_bin};
use super::output::LossOutput;
use super::sequence::valid_bin_weights;
use crate::errors::{Result, SeparationError};

/// Masked, normalized embeddings and masked assignments for one batch.
struct ClusterInputs<B: Backend> {
    /// `[batch, bins, emb]`
    embeddings: Tensor<B, 3>,
    /// `[batch, bins, nrS]`
    assignments: Tensor<B, 3>,
    /// `[batch, bins]`
    weights: Tensor<B, 2>,
}

impl<B: Backend> ClusterInputs<B> {
    /// `targets` `[b, t, f * nrS]`, `embeddings` `[b, t * f, emb]` (already
    /// flattened over bins), `usedbins` `[b, t, f]`.
    fn new(
        targets: Tensor<B, 3>,
        embeddings: Tensor<B, 3>,
        usedbins: Tensor<B, 3>,
        seq_length: &[usize],
    ) -> Result<Self> {
        let [batch_size, max_time, feat_dim] = usedbins.dims();
        check_prefix("binary targets", &targets.dims(), batch_size, max_time)?;
        let num_sources = values_per_bin(targets.dims()[2], feat_dim, "binary targets")?;
        let bins = max_time * feat_dim;
        let emb_dims = embeddings.dims();
        if emb_dims[0] != batch_size || emb_dims[1] != bins {
            return Err(SeparationError::shape(
                "bin embeddings",
                format!("[{batch_size}, {bins}, emb_dim]"),
                format!("{emb_dims:?}"),
            ));
        }

        let weights = valid_bin_weights(usedbins, seq_length)?.reshape([batch_size, bins]);
        let column = weights.clone().reshape([batch_size, bins, 1]);

        let embeddings =
            l2_normalize(embeddings, 2) * column.clone().expand([batch_size, bins, emb_dims[2]]);
        let assignments = targets.reshape([batch_size, bins, num_sources])
            * column.expand([batch_size, bins, num_sources]);

        Ok(Self {
            embeddings,
            assignments,
            weights,
        })
    }

    /// `sum_b (sum of weights in b)²`
    fn squared_counts(&self) -> Tensor<B, 1> {
        self.weights.clone().sum_dim(1).powf_scalar(2.0).sum()
    }
}

/// Flattens `[b, t, f * emb]` logits to `[b, t * f, emb]`.
fn flatten_bin_logits<B: Backend>(logits: Tensor<B, 3>, feat_dim: usize) -> Result<Tensor<B, 3>> {
    let [batch_size, max_time, output_dim] = logits.dims();
    let emb_dim = values_per_bin(output_dim, feat_dim, "bin embeddings")?;
    Ok(logits.reshape([batch_size, max_time * feat_dim, emb_dim]))
}

fn frobenius_terms<B: Backend>(inputs: ClusterInputs<B>) -> LossOutput<B> {
    let norm = inputs.squared_counts();
    let v = inputs.embeddings;
    let y = inputs.assignments;
    let vt = v.clone().swap_dims(1, 2);

    let vtv = vt.clone().matmul(v).powf_scalar(2.0).sum();
    let vty = vt.matmul(y.clone()).powf_scalar(2.0).sum();
    let yty = y.clone().swap_dims(1, 2).matmul(y).powf_scalar(2.0).sum();

    LossOutput::new(vtv - vty * 2.0 + yty, norm)
}

/// Deep clustering loss with logits `[batch, time, feat * emb]`.
///
/// `targets` are `[batch, time, feat * nrS]` binary assignments,
/// `usedbins` `[batch, time, feat]`. Normalizer: squared valid-bin count per
/// example, summed over the batch.
pub fn deepclustering_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let feat_dim = usedbins.dims()[2];
    check_prefix("bin embeddings", &logits.dims(), usedbins.dims()[0], usedbins.dims()[1])?;
    let embeddings = flatten_bin_logits(logits, feat_dim)?;
    let inputs = ClusterInputs::new(targets, embeddings, usedbins, seq_length)?;
    Ok(frobenius_terms(inputs))
}

/// [`deepclustering_loss`] for logits already shaped
/// `[batch, time, feat, emb]`.
pub fn deepclustering_flat_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 4>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let [batch_size, max_time, feat_dim, emb_dim] = logits.dims();
    if usedbins.dims() != [batch_size, max_time, feat_dim] {
        return Err(SeparationError::shape(
            "usedbins",
            format!("{:?}", [batch_size, max_time, feat_dim]),
            format!("{:?}", usedbins.dims()),
        ));
    }
    let embeddings = logits.reshape([batch_size, max_time * feat_dim, emb_dim]);
    let inputs = ClusterInputs::new(targets, embeddings, usedbins, seq_length)?;
    Ok(frobenius_terms(inputs))
}

/// Deep clustering with absolute-value sums instead of squared Frobenius
/// norms: `Σ|VᵀV| − 2Σ|VᵀY|`. Same normalizer as [`deepclustering_loss`].
pub fn deepclustering_l1_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let feat_dim = usedbins.dims()[2];
    check_prefix("bin embeddings", &logits.dims(), usedbins.dims()[0], usedbins.dims()[1])?;
    let embeddings = flatten_bin_logits(logits, feat_dim)?;
    let inputs = ClusterInputs::new(targets, embeddings, usedbins, seq_length)?;

    let norm = inputs.squared_counts();
    let vt = inputs.embeddings.clone().swap_dims(1, 2);
    let vtv = vt.clone().matmul(inputs.embeddings).abs().sum();
    let vty = vt.matmul(inputs.assignments).abs().sum();

    Ok(LossOutput::new(vtv - vty * 2.0, norm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    // One utterance, 2 frames x 2 bins, 2 sources: bin 0 belongs to source 0
    // and bin 1 to source 1 in both frames.
    fn targets(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 3> {
        Tensor::from_floats([[[1.0, 0.0, 0.0, 1.0], [1.0, 0.0, 0.0, 1.0]]], device)
    }

    #[test]
    fn test_perfect_clustering_is_zero() {
        let device = <TestBackend as Backend>::Device::default();
        // Embeddings equal to the scaled assignments.
        let logits =
            Tensor::<TestBackend, 3>::from_floats([[[3.0, 0.0, 0.0, 2.0], [1.0, 0.0, 0.0, 5.0]]], &device);
        let usedbins = Tensor::ones([1, 2, 2], &device);

        let (loss, norm) = deepclustering_loss(targets(&device), logits, usedbins, &[2])
            .unwrap()
            .to_scalars();
        assert!(loss.abs() < 1e-5, "loss = {loss}");
        assert!((norm - 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_collapsed_embeddings() {
        let device = <TestBackend as Backend>::Device::default();
        // Every embedding points the same way: ‖VVᵀ − YYᵀ‖² counts the 8
        // cross-source pairs.
        let logits =
            Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 1.0, 0.0], [1.0, 0.0, 1.0, 0.0]]], &device);
        let usedbins = Tensor::ones([1, 2, 2], &device);

        let (loss, norm) = deepclustering_loss(targets(&device), logits, usedbins, &[2])
            .unwrap()
            .to_scalars();
        assert!((loss - 8.0).abs() < 1e-5);
        assert!((norm - 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_padding_is_ignored() {
        let device = <TestBackend as Backend>::Device::default();
        let targets = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 0.0, 0.0, 1.0], [1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 1.0, 0.0]]],
            &device,
        );
        let logits = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 0.0, 1.0, 0.0], [1.0, 0.0, 1.0, 0.0], [-7.0, 3.0, 0.5, 9.0]]],
            &device,
        );
        let usedbins = Tensor::ones([1, 3, 2], &device);

        let (loss, norm) = deepclustering_loss(targets, logits, usedbins, &[2])
            .unwrap()
            .to_scalars();
        assert!((loss - 8.0).abs() < 1e-5);
        assert!((norm - 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_flat_layout_matches() {
        let device = <TestBackend as Backend>::Device::default();
        let flat_values = [[[0.3, -1.0, 2.0, 0.5], [1.5, 0.2, -0.4, 0.9]]];
        let logits = Tensor::<TestBackend, 3>::from_floats(flat_values, &device);
        let logits_4d = logits.clone().reshape([1, 2, 2, 2]);
        let usedbins = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0], [1.0, 1.0]]], &device);

        let (a, norm_a) = deepclustering_loss(targets(&device), logits, usedbins.clone(), &[2])
            .unwrap()
            .to_scalars();
        let (b, norm_b) = deepclustering_flat_loss(targets(&device), logits_4d, usedbins, &[2])
            .unwrap()
            .to_scalars();
        assert!((a - b).abs() < 1e-5);
        assert_eq!(norm_a, norm_b);
        assert!((norm_a - 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_l1_variant() {
        let device = <TestBackend as Backend>::Device::default();
        let logits =
            Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 1.0, 0.0], [1.0, 0.0, 1.0, 0.0]]], &device);
        let usedbins = Tensor::ones([1, 2, 2], &device);

        // |VᵀV| sums to 4, |VᵀY| to 4.
        let (loss, norm) = deepclustering_l1_loss(targets(&device), logits, usedbins, &[2])
            .unwrap()
            .to_scalars();
        assert!((loss - (4.0 - 8.0)).abs() < 1e-5);
        assert!((norm - 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_misaligned_logits() {
        let device = <TestBackend as Backend>::Device::default();
        let logits = Tensor::<TestBackend, 3>::ones([1, 2, 5], &device);
        let usedbins = Tensor::ones([1, 2, 2], &device);
        assert!(matches!(
            deepclustering_loss(targets(&device), logits, usedbins, &[2]),
            Err(SeparationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_batch_without_valid_frames_is_zero() {
        let device = <TestBackend as Backend>::Device::default();
        let logits =
            Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0, 1.0, 0.0], [0.2, 0.8, 0.0, 0.0]]], &device);
        let usedbins = Tensor::<TestBackend, 3>::ones([1, 2, 2], &device);

        for output in [
            deepclustering_loss(targets(&device), logits.clone(), usedbins.clone(), &[0]).unwrap(),
            deepclustering_l1_loss(targets(&device), logits, usedbins, &[0]).unwrap(),
        ] {
            let (loss, norm) = output.to_scalars();
            assert_eq!((loss, norm), (0.0, 0.0));
            assert!(output.mean().is_err());
        }
    }
}
