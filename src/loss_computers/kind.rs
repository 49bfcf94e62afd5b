//! The closed set of loss computers.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SeparationError};

/// Supported loss computers, named as in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossKind {
    /// Deep clustering on `[batch, time, feat * emb]` embeddings.
    #[default]
    Deepclustering,
    /// Deep clustering on `[batch, time, feat, emb]` embeddings.
    DeepclusteringFlat,
    /// Deep clustering with L1 norms.
    DeepclusteringL1,
    /// Attractor loss against speaker embeddings.
    L41,
    Intravar2centervar,
    Dist2mean,
    Dist2meanClosest,
    Dist2meanEpsilonClosest,
    /// Mask reconstruction, sources in given order.
    Direct,
    /// Permutation-invariant mask reconstruction.
    Pit,
    /// Permutation-invariant reconstruction with attractor masks.
    PitL41,
    /// Obsolete joint deep clustering and PIT.
    DcPit,
    /// Permutation-invariant cross-entropy over label channels.
    CrossentropyMulti,
}

impl LossKind {
    pub const ALL: [LossKind; 13] = [
        LossKind::Deepclustering,
        LossKind::DeepclusteringFlat,
        LossKind::DeepclusteringL1,
        LossKind::L41,
        LossKind::Intravar2centervar,
        LossKind::Dist2mean,
        LossKind::Dist2meanClosest,
        LossKind::Dist2meanEpsilonClosest,
        LossKind::Direct,
        LossKind::Pit,
        LossKind::PitL41,
        LossKind::DcPit,
        LossKind::CrossentropyMulti,
    ];

    /// The configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Deepclustering => "deepclustering",
            LossKind::DeepclusteringFlat => "deepclustering_flat",
            LossKind::DeepclusteringL1 => "deepclustering_l1",
            LossKind::L41 => "l41",
            LossKind::Intravar2centervar => "intravar2centervar",
            LossKind::Dist2mean => "dist2mean",
            LossKind::Dist2meanClosest => "dist2mean_closest",
            LossKind::Dist2meanEpsilonClosest => "dist2mean_epsilon_closest",
            LossKind::Direct => "direct",
            LossKind::Pit => "pit",
            LossKind::PitL41 => "pit_l41",
            LossKind::DcPit => "dc_pit",
            LossKind::CrossentropyMulti => "crossentropy_multi",
        }
    }

    /// Parses a configuration name, case-insensitively.
    pub fn from_name(name: &str) -> Result<Self> {
        let lowered = name.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == lowered)
            .ok_or_else(|| {
                SeparationError::configuration("loss_type", format!("unknown loss type `{name}`"))
            })
    }

    /// Whether the loss searches over source permutations.
    pub fn is_permutation_invariant(&self) -> bool {
        matches!(
            self,
            LossKind::Pit | LossKind::PitL41 | LossKind::DcPit | LossKind::CrossentropyMulti
        )
    }
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for LossKind {
    type Error = SeparationError;

    fn try_from(name: String) -> Result<Self> {
        Self::from_name(&name)
    }
}

impl From<LossKind> for String {
    fn from(kind: LossKind) -> Self {
        kind.name().to_string()
    }
}
