//! Shared helpers for per-bin embedding and assignment tensors.

use burn::tensor::{Tensor, backend::Backend};

use crate::errors::{Result, SeparationError};

/// Epsilon for L2 normalization and count denominators.
pub const NORM_EPSILON: f64 = 1e-12;

/// `x / sqrt(max(sum(x²), 1e-12))` along `dim`.
pub fn l2_normalize<B: Backend, const D: usize>(tensor: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let dims = tensor.dims();
    let inverse = tensor
        .clone()
        .powf_scalar(2.0)
        .sum_dim(dim)
        .clamp_min(NORM_EPSILON)
        .sqrt()
        .recip();
    tensor * inverse.expand(dims)
}

/// Number of values per feature bin in a `[batch, time, feat * k]` tensor.
pub fn values_per_bin(total: usize, feat_dim: usize, what: &str) -> Result<usize> {
    if feat_dim == 0 || total % feat_dim != 0 || total == 0 {
        return Err(SeparationError::shape(
            format!("{what} last dimension"),
            format!("a non-zero multiple of feature_dim {feat_dim}"),
            total,
        ));
    }
    Ok(total / feat_dim)
}

/// Checks that a tensor shares the `[batch, time]` prefix of the bin mask.
pub fn check_prefix(what: &str, dims: &[usize], batch_size: usize, max_time: usize) -> Result<()> {
    if dims.len() < 2 || dims[0] != batch_size || dims[1] != max_time {
        return Err(SeparationError::shape(
            what.to_string(),
            format!("[{batch_size}, {max_time}, ..]"),
            format!("{dims:?}"),
        ));
    }
    Ok(())
}

/// Speaker attractors `[batch, 1, emb * nrS]` as `[batch, nrS, emb]`
/// (speaker-major).
pub fn attractors<B: Backend>(
    spk_embeddings: Tensor<B, 3>,
    batch_size: usize,
    emb_dim: usize,
    num_sources: usize,
) -> Result<Tensor<B, 3>> {
    let dims = spk_embeddings.dims();
    if dims != [batch_size, 1, emb_dim * num_sources] {
        return Err(SeparationError::shape(
            "speaker embeddings",
            format!("{:?}", [batch_size, 1, emb_dim * num_sources]),
            format!("{dims:?}"),
        ));
    }
    Ok(spk_embeddings.reshape([batch_size, num_sources, emb_dim]))
}

/// Cosine similarity between every bin embedding and every attractor.
///
/// `bin_embeddings` is `[batch, bins, emb]`, `attractors` `[batch, nrS, emb]`;
/// returns `[batch, bins, nrS]`.
pub fn attractor_similarity<B: Backend>(
    bin_embeddings: Tensor<B, 3>,
    attractors: Tensor<B, 3>,
) -> Tensor<B, 3> {
    let bins = l2_normalize(bin_embeddings, 2);
    let attractors = l2_normalize(attractors, 2);
    bins.matmul(attractors.swap_dims(1, 2))
}

/// Euclidean distance between every normalized bin embedding and every
/// normalized attractor, `[batch, bins, nrS]`.
pub fn attractor_distance<B: Backend>(
    bin_embeddings: Tensor<B, 3>,
    attractors: Tensor<B, 3>,
) -> Tensor<B, 3> {
    let [batch_size, bins, emb_dim] = bin_embeddings.dims();
    let num_sources = attractors.dims()[1];
    let shape = [batch_size, bins, num_sources, emb_dim];

    let bins_norm = l2_normalize(bin_embeddings, 2)
        .reshape([batch_size, bins, 1, emb_dim])
        .expand(shape);
    let attractors_norm = l2_normalize(attractors, 2)
        .reshape([batch_size, 1, num_sources, emb_dim])
        .expand(shape);

    (bins_norm - attractors_norm)
        .powf_scalar(2.0)
        .sum_dim(3)
        .clamp_min(NORM_EPSILON)
        .sqrt()
        .reshape([batch_size, bins, num_sources])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_l2_normalize_rows() {
        let device = <TestBackend as Backend>::Device::default();
        let input = Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0], [0.0, 0.0]], &device);
        let values: Vec<f32> = l2_normalize(input, 1).to_data().to_vec().unwrap();
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);
        // zero rows stay zero
        assert_eq!(values[2], 0.0);
        assert_eq!(values[3], 0.0);
    }

    #[test]
    fn test_values_per_bin() {
        assert_eq!(values_per_bin(12, 3, "logits").unwrap(), 4);
        assert!(values_per_bin(10, 3, "logits").is_err());
        assert!(values_per_bin(0, 3, "logits").is_err());
    }

    #[test]
    fn test_attractor_similarity_is_cosine() {
        let device = <TestBackend as Backend>::Device::default();
        let bins = Tensor::<TestBackend, 3>::from_floats([[[2.0, 0.0], [1.0, 1.0]]], &device);
        let attractors = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0], [0.0, 3.0]]], &device);
        let values: Vec<f32> = attractor_similarity(bins, attractors)
            .to_data()
            .to_vec()
            .unwrap();
        let half_sqrt2 = 0.5f32.sqrt();
        assert!((values[0] - 1.0).abs() < 1e-6);
        assert!(values[1].abs() < 1e-6);
        assert!((values[2] - half_sqrt2).abs() < 1e-6);
        assert!((values[3] - half_sqrt2).abs() < 1e-6);
    }
}
