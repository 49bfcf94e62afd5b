//! Attractor-network loss (source-contrastive estimation, Stephenson et al.).

use burn::tensor::{Tensor, activation::log_sigmoid, backend::Backend};

use super::embedding::{attractor_similarity, attractors, check_prefix, values_per_bin};
use super::output::LossOutput;
use super::sequence::valid_bin_weights;
use crate::errors::Result;

/// L41 loss: `-log σ(Y · cos(v_bin, v_speaker))` for every valid bin and
/// every speaker, with `Y = +1` for the bin's own speaker and `-1` otherwise.
///
/// `targets` `[batch, time, feat * nrS]`, `bin_embeddings`
/// `[batch, time, feat * emb]`, `spk_embeddings` `[batch, 1, emb * nrS]`.
/// Normalizer: `sum(usedbins) * nrS` over valid frames.
pub fn l41_loss<B: Backend>(
    targets: Tensor<B, 3>,
    bin_embeddings: Tensor<B, 3>,
    spk_embeddings: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let [batch_size, max_time, feat_dim] = usedbins.dims();
    check_prefix("binary targets", &targets.dims(), batch_size, max_time)?;
    check_prefix("bin embeddings", &bin_embeddings.dims(), batch_size, max_time)?;
    let num_sources = values_per_bin(targets.dims()[2], feat_dim, "binary targets")?;
    let emb_dim = values_per_bin(bin_embeddings.dims()[2], feat_dim, "bin embeddings")?;
    let speakers = attractors(spk_embeddings, batch_size, emb_dim, num_sources)?;

    let bins = max_time * feat_dim;
    let shape = [batch_size, bins, num_sources];
    let weights = valid_bin_weights(usedbins, seq_length)?.reshape([batch_size, bins, 1]);

    let similarity =
        attractor_similarity(bin_embeddings.reshape([batch_size, bins, emb_dim]), speakers);
    let signs = targets.reshape(shape).sub_scalar(0.5).mul_scalar(2.0);
    let cost = log_sigmoid(signs * similarity).neg();

    let loss = (cost * weights.clone().expand(shape)).sum();
    let norm = weights.sum().mul_scalar(num_sources as f32);
    Ok(LossOutput::new(loss, norm))
}
