//! Dispatch from a configured loss type to the loss functions.

use burn::tensor::backend::Backend;

use super::inputs::{float3, float4, labels};
use super::{LossConfig, LossInputs, LossKind};
use crate::errors::{Result, SeparationError};
use crate::ops::{self, CompetitorDistance, LossOutput};

const BINARY_TARGETS: &str = "binary_targets";
const USEDBINS: &str = "usedbins";
const FRACBINS: &str = "fracbins";
const MULTI_TARGETS: &str = "multi_targets";
const MIX_TO_MASK: &str = "mix_to_mask";
const LABELS: &str = "labels";
const BIN_EMB: &str = "bin_emb";
const SPK_EMB: &str = "spk_emb";
const BIN_EST: &str = "bin_est";
const LOGITS: &str = "logits";

/// Computes the configured loss from named inputs.
#[derive(Debug, Clone)]
pub struct LossComputer {
    config: LossConfig,
}

impl LossComputer {
    /// Validates the configuration.
    pub fn new(config: LossConfig) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "loss computer `{}` for batches of {}{}",
            config.loss_type,
            config.batch_size,
            if config.loss_type.is_permutation_invariant() {
                ", searching source permutations"
            } else {
                ""
            }
        );
        if config.loss_type == LossKind::DcPit {
            log::warn!("loss type `dc_pit` is obsolete, combine deepclustering and pit instead");
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn kind(&self) -> LossKind {
        self.config.loss_type
    }

    /// Every tensor and length vector must have `batch_size` entries.
    fn check_batch<B: Backend>(&self, inputs: &LossInputs<B>) -> Result<()> {
        let expected = self.config.batch_size;
        for (role, name, tensor) in inputs.tensors() {
            if tensor.batch_size() != expected {
                return Err(SeparationError::shape(
                    format!("batch dimension of {role} `{name}`"),
                    expected,
                    tensor.batch_size(),
                ));
            }
        }
        for (name, lengths) in inputs.length_vectors() {
            if lengths.len() != expected {
                return Err(SeparationError::shape(
                    format!("sequence lengths `{name}`"),
                    format!("{expected} entries"),
                    lengths.len(),
                ));
            }
        }
        Ok(())
    }

    /// Returns the loss and its normalizer.
    pub fn compute<B: Backend>(&self, inputs: &LossInputs<B>) -> Result<LossOutput<B>> {
        self.check_batch(inputs)?;
        let target3 = |name: &str| inputs.target(name).and_then(|tensor| float3(name, tensor));
        let logits3 = |name: &str| inputs.logit(name).and_then(|tensor| float3(name, tensor));
        let fracbins = || -> Result<Option<_>> {
            if inputs.has_target(FRACBINS) {
                Ok(Some(target3(FRACBINS)?))
            } else {
                Ok(None)
            }
        };

        let kind = self.kind();
        log::trace!("computing `{kind}` loss");
        match kind {
            LossKind::Deepclustering => ops::deepclustering_loss(
                target3(BINARY_TARGETS)?,
                logits3(BIN_EMB)?,
                target3(USEDBINS)?,
                inputs.lengths(BIN_EMB)?,
            ),
            LossKind::DeepclusteringFlat => ops::deepclustering_flat_loss(
                target3(BINARY_TARGETS)?,
                float4(BIN_EMB, inputs.logit(BIN_EMB)?)?,
                target3(USEDBINS)?,
                inputs.lengths(BIN_EMB)?,
            ),
            LossKind::DeepclusteringL1 => ops::deepclustering_l1_loss(
                target3(BINARY_TARGETS)?,
                logits3(BIN_EMB)?,
                target3(USEDBINS)?,
                inputs.lengths(BIN_EMB)?,
            ),
            LossKind::L41 => ops::l41_loss(
                target3(BINARY_TARGETS)?,
                logits3(BIN_EMB)?,
                logits3(SPK_EMB)?,
                target3(USEDBINS)?,
                inputs.lengths(BIN_EMB)?,
            ),
            LossKind::Intravar2centervar => ops::intravar2centervar_rat_loss(
                target3(BINARY_TARGETS)?,
                logits3(BIN_EMB)?,
                target3(USEDBINS)?,
                inputs.lengths(BIN_EMB)?,
            ),
            LossKind::Dist2mean | LossKind::Dist2meanClosest | LossKind::Dist2meanEpsilonClosest => {
                let competitor = match kind {
                    LossKind::Dist2mean => CompetitorDistance::AllOthers,
                    LossKind::Dist2meanClosest => CompetitorDistance::Closest,
                    _ => CompetitorDistance::EpsilonClosest {
                        epsilon: self.config.epsilon,
                    },
                };
                ops::dist2mean_ratio_loss(
                    target3(BINARY_TARGETS)?,
                    logits3(BIN_EMB)?,
                    target3(USEDBINS)?,
                    inputs.lengths(BIN_EMB)?,
                    competitor,
                    self.config.rat_power,
                    fracbins()?,
                )
            }
            LossKind::Direct => ops::direct_loss(
                float4(MULTI_TARGETS, inputs.target(MULTI_TARGETS)?)?,
                logits3(BIN_EST)?,
                target3(MIX_TO_MASK)?,
                inputs.lengths(BIN_EST)?,
            ),
            LossKind::Pit => ops::pit_loss(
                float4(MULTI_TARGETS, inputs.target(MULTI_TARGETS)?)?,
                logits3(BIN_EST)?,
                target3(MIX_TO_MASK)?,
                inputs.lengths(BIN_EST)?,
            ),
            LossKind::PitL41 => ops::pit_l41_loss(
                float4(MULTI_TARGETS, inputs.target(MULTI_TARGETS)?)?,
                logits3(BIN_EMB)?,
                logits3(SPK_EMB)?,
                target3(MIX_TO_MASK)?,
                inputs.lengths(BIN_EMB)?,
            ),
            #[allow(deprecated)]
            LossKind::DcPit => ops::dc_pit_loss(
                target3(BINARY_TARGETS)?,
                logits3(BIN_EMB)?,
                float4(MULTI_TARGETS, inputs.target(MULTI_TARGETS)?)?,
                logits3(BIN_EST)?,
                target3(USEDBINS)?,
                target3(MIX_TO_MASK)?,
                inputs.lengths(BIN_EMB)?,
                self.config.alpha,
            ),
            LossKind::CrossentropyMulti => ops::crossentropy_multi_loss(
                labels(LABELS, inputs.target(LABELS)?)?,
                logits3(LOGITS)?,
            ),
        }
    }
}
