//! Embedding losses built on per-source cluster means.
//!
//! Every bin embedding is L2-normalized and assigned to a source; the mean
//! of each source's embeddings is its cluster center. The losses compare the
//! spread inside clusters with the spread between them.

use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};

use super::embedding::{NORM_EPSILON, check_prefix, l2_normalize, values_per_bin};
use super::output::LossOutput;
use super::sequence::valid_bin_weights;
use crate::errors::{Result, SeparationError};

/// Added to competitor distances in the closest-mean ratios when no
/// epsilon is configured.
pub const DEFAULT_CLOSEST_EPSILON: f64 = 0.2;

/// Utterances whose smallest cluster holds fewer members than this score 1.0.
const MIN_CLUSTER_MEMBERS: f64 = 1.1;

/// Mask value that removes a bin's own cluster from a min over clusters.
const OWN_CLUSTER_OFFSET: f64 = 1e20;

/// What a bin's distance to its own mean is divided by.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitorDistance {
    /// Sum of the distances to every other cluster mean.
    AllOthers,
    /// Distance to the closest other cluster mean.
    Closest,
    /// Distance to the closest other mean plus a fixed margin.
    EpsilonClosest { epsilon: f64 },
}

/// Masked embeddings, masked assignments and cluster means.
struct Clusters<B: Backend> {
    /// `[batch, bins, emb]`, unit rows for valid bins, zero elsewhere.
    embeddings: Tensor<B, 3>,
    /// `[batch, bins, nrS]`
    assignments: Tensor<B, 3>,
    /// `[batch, bins]`
    weights: Tensor<B, 2>,
    /// `[batch, nrS, 1]`, member count plus epsilon.
    counts: Tensor<B, 3>,
    /// `[batch, nrS, emb]`
    means: Tensor<B, 3>,
}

impl<B: Backend> Clusters<B> {
    fn new(
        targets: Tensor<B, 3>,
        logits: Tensor<B, 3>,
        usedbins: Tensor<B, 3>,
        seq_length: &[usize],
        binarize: bool,
    ) -> Result<Self> {
        let [batch_size, max_time, feat_dim] = usedbins.dims();
        check_prefix("binary targets", &targets.dims(), batch_size, max_time)?;
        check_prefix("embedding logits", &logits.dims(), batch_size, max_time)?;
        let num_sources = values_per_bin(targets.dims()[2], feat_dim, "binary targets")?;
        let emb_dim = values_per_bin(logits.dims()[2], feat_dim, "embedding logits")?;
        let bins = max_time * feat_dim;

        let mut weights = valid_bin_weights(usedbins, seq_length)?.reshape([batch_size, bins]);
        if binarize {
            weights = weights.greater_elem(0.0).float();
        }
        let present = weights
            .clone()
            .greater_elem(0.0)
            .float()
            .reshape([batch_size, bins, 1]);

        let embeddings = l2_normalize(logits.reshape([batch_size, bins, emb_dim]), 2)
            * present.expand([batch_size, bins, emb_dim]);
        let assignments = targets.reshape([batch_size, bins, num_sources])
            * weights
                .clone()
                .reshape([batch_size, bins, 1])
                .expand([batch_size, bins, num_sources]);

        let counts = assignments
            .clone()
            .sum_dim(1)
            .reshape([batch_size, num_sources, 1])
            .add_scalar(NORM_EPSILON);
        let means = assignments.clone().swap_dims(1, 2).matmul(embeddings.clone())
            / counts.clone().expand([batch_size, num_sources, emb_dim]);

        Ok(Self {
            embeddings,
            assignments,
            weights,
            counts,
            means,
        })
    }

    /// Squared distance of every bin embedding to every cluster mean,
    /// `[batch, bins, nrS]`.
    fn mean_distances(&self) -> Tensor<B, 3> {
        let [batch_size, bins, emb_dim] = self.embeddings.dims();
        let num_sources = self.means.dims()[1];
        let shape = [batch_size, bins, num_sources, emb_dim];

        let embeddings = self
            .embeddings
            .clone()
            .reshape([batch_size, bins, 1, emb_dim])
            .expand(shape);
        let means = self
            .means
            .clone()
            .reshape([batch_size, 1, num_sources, emb_dim])
            .expand(shape);

        (embeddings - means)
            .powf_scalar(2.0)
            .sum_dim(3)
            .reshape([batch_size, bins, num_sources])
    }
}

/// Mean intra-cluster variance over the variance between cluster means.
///
/// One value per utterance; an utterance in which some source has at most
/// one valid bin scores exactly `1.0`. Utterances without any valid bin are
/// left out of both the loss and the normalizer, which counts the remaining
/// utterances.
pub fn intravar2centervar_rat_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
) -> Result<LossOutput<B>> {
    let clusters = Clusters::new(targets, logits, usedbins, seq_length, true)?;
    let [batch_size, bins, emb_dim] = clusters.embeddings.dims();
    let num_sources = clusters.means.dims()[1];

    let own_mean = clusters.assignments.clone().matmul(clusters.means.clone());
    let deviation = (clusters.embeddings.clone() - own_mean)
        .powf_scalar(2.0)
        .sum_dim(2);
    let intra = (clusters.assignments.clone().swap_dims(1, 2).matmul(deviation)
        / clusters.counts.clone())
    .mean_dim(1)
    .reshape([batch_size]);

    let center = clusters.means.clone().mean_dim(1);
    let inter = (clusters.means.clone() - center.expand([batch_size, num_sources, emb_dim]))
        .powf_scalar(2.0)
        .mean_dim(1)
        .sum_dim(2)
        .reshape([batch_size])
        .add_scalar(NORM_EPSILON);

    let smallest = clusters.counts.min_dim(1).reshape([batch_size]);
    let ratio = (intra / inter).mask_fill(smallest.lower_elem(MIN_CLUSTER_MEMBERS), 1.0);

    let active = clusters
        .weights
        .sum_dim(1)
        .reshape([batch_size])
        .greater_elem(0.0)
        .float();
    log::trace!("intravar2centervar over {batch_size} utterances of {bins} bins");

    Ok(LossOutput::new((ratio * active.clone()).sum(), active.sum()))
}

/// Ratio of each bin's squared distance to its own cluster mean over its
/// distance to the competing means, summed over valid bins.
///
/// `rat_power` raises every ratio to that power. With `fracbins`
/// `[batch, time, feat]` each ratio is weighted by it and the normalizer is
/// `sum(fracbins * usedbins)`; otherwise it is `sum(usedbins)` over valid
/// frames.
pub fn dist2mean_ratio_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
    competitor: CompetitorDistance,
    rat_power: f64,
    fracbins: Option<Tensor<B, 3>>,
) -> Result<LossOutput<B>> {
    let bin_dims = usedbins.dims();
    if let Some(fracbins) = &fracbins {
        if fracbins.dims() != bin_dims {
            return Err(SeparationError::shape(
                "fracbins",
                format!("{bin_dims:?}"),
                format!("{:?}", fracbins.dims()),
            ));
        }
    }

    let clusters = Clusters::new(targets, logits, usedbins, seq_length, false)?;
    let [batch_size, bins, _] = clusters.embeddings.dims();
    let distances = clusters.mean_distances();
    let assignments = clusters.assignments;

    let own = (distances.clone() * assignments.clone()).sum_dim(2);
    let others = match competitor {
        CompetitorDistance::AllOthers => (distances * assignments.neg().add_scalar(1.0))
            .sum_dim(2)
            .add_scalar(NORM_EPSILON),
        CompetitorDistance::Closest => (distances + assignments * OWN_CLUSTER_OFFSET)
            .min_dim(2)
            .add_scalar(NORM_EPSILON),
        CompetitorDistance::EpsilonClosest { epsilon } => (distances
            + assignments * OWN_CLUSTER_OFFSET)
            .min_dim(2)
            .add_scalar(epsilon),
    };

    let weights = clusters.weights;
    let mut ratio = (own / others).reshape([batch_size, bins]);
    if rat_power != 1.0 {
        // zero ratios (padding, lone cluster members) have no finite
        // derivative under a fractional power
        ratio = ratio.clamp_min(NORM_EPSILON).powf_scalar(rat_power);
    }
    let ratio = ratio * weights.clone();

    let (loss, norm) = match fracbins {
        Some(fracbins) => {
            let active = fracbins.reshape([batch_size, bins]) * weights;
            ((ratio * active.clone()).sum(), active.sum())
        }
        None => (ratio.sum(), weights.sum()),
    };
    Ok(LossOutput::new(loss, norm))
}

/// [`dist2mean_ratio_loss`] against the sum of distances to all other means.
pub fn dist2mean_rat_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
    rat_power: f64,
    fracbins: Option<Tensor<B, 3>>,
) -> Result<LossOutput<B>> {
    dist2mean_ratio_loss(
        targets,
        logits,
        usedbins,
        seq_length,
        CompetitorDistance::AllOthers,
        rat_power,
        fracbins,
    )
}

/// [`dist2mean_ratio_loss`] against the closest other mean.
pub fn dist2mean_closest_rat_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
    rat_power: f64,
    fracbins: Option<Tensor<B, 3>>,
) -> Result<LossOutput<B>> {
    dist2mean_ratio_loss(
        targets,
        logits,
        usedbins,
        seq_length,
        CompetitorDistance::Closest,
        rat_power,
        fracbins,
    )
}

/// [`dist2mean_ratio_loss`] against the closest other mean plus `epsilon`.
pub fn dist2mean_epsilon_closest_rat_loss<B: Backend>(
    targets: Tensor<B, 3>,
    logits: Tensor<B, 3>,
    usedbins: Tensor<B, 3>,
    seq_length: &[usize],
    rat_power: f64,
    fracbins: Option<Tensor<B, 3>>,
    epsilon: f64,
) -> Result<LossOutput<B>> {
    dist2mean_ratio_loss(
        targets,
        logits,
        usedbins,
        seq_length,
        CompetitorDistance::EpsilonClosest { epsilon },
        rat_power,
        fracbins,
    )
}
