//! Loss functions and tensor operations for separation training.
//!
//! Every loss returns a [`LossOutput`] holding the unnormalized loss and its
//! normalizer.

pub mod attractor;
pub mod capsule;
pub mod classification;
pub mod clustering;
pub mod embedding;
pub mod output;
pub mod permutation;
pub mod ratio;
pub mod reconstruction;
pub mod sequence;

pub use attractor::l41_loss;
pub use capsule::{
    FanMode, InitDistribution, VoteTransformInitializer, capsule_initializer, safe_norm, squash,
};
pub use classification::{cross_entropy_eos_loss, crossentropy_multi_loss};
pub use clustering::{deepclustering_flat_loss, deepclustering_l1_loss, deepclustering_loss};
pub use output::LossOutput;
pub use permutation::{PermutationSearch, permutations, squared_error_pairs};
pub use ratio::{
    CompetitorDistance, dist2mean_closest_rat_loss, dist2mean_epsilon_closest_rat_loss,
    dist2mean_rat_loss, dist2mean_ratio_loss, intravar2centervar_rat_loss,
};
#[allow(deprecated)]
pub use reconstruction::dc_pit_loss;
pub use reconstruction::{direct_loss, pit_l41_loss, pit_loss};
pub use sequence::{
    SparseSequence, dense_sequence_to_sparse, extract_valid, extract_valid_labels,
    reverse_sequences, sequence_mask, valid_indices,
};
