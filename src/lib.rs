//! # sepnet
//!
//! Training losses, recurrent layers and data preparation for neural
//! speech separation.
//!
//! Models emit either per-bin embeddings that are clustered into sources, or
//! per-source masks on the mixture spectrogram. This library scores both
//! kinds of output against reference sources on padded batches, with every
//! loss returning an unnormalized sum and its normalizer.
//!
//! ## Features
//!
//! - **Burn Backend**: Losses and layers are generic over Burn backends, so
//!   they run on WGPU for training and on NdArray on the CPU.
//! - **Padding-aware**: Frames past each sequence length never contribute to
//!   a loss or its gradient.
//! - **Permutation invariance**: Source-order-free losses search every
//!   output-to-reference assignment.
//! - **Data preparation**: Feature computers and a simple array record
//!   format for storing features and targets.
//!
//! ## Example
//!
//! ```
//! use sepnet::prelude::*;
//! use burn::backend::NdArray;
//! use burn::tensor::Tensor;
//!
//! type Backend = NdArray;
//!
//! let device = <Backend as burn::tensor::backend::Backend>::Device::default();
//!
//! // One frame, two bins, two sources; each bin belongs to one source.
//! let inputs = LossInputs::<Backend>::new()
//!     .with_target("binary_targets", Tensor::<Backend, 3>::from_floats([[[1.0, 0.0, 0.0, 1.0]]], &device))
//!     .with_target("usedbins", Tensor::<Backend, 3>::ones([1, 1, 2], &device))
//!     .with_logits("bin_emb", Tensor::<Backend, 3>::from_floats([[[1.0, 0.0, 0.0, 1.0]]], &device))
//!     .with_seq_length("bin_emb", vec![1]);
//!
//! let computer = LossComputer::new(LossConfig::new().batch_size(1)).expect("valid config");
//! let output = computer.compute(&inputs).expect("Failed to compute loss");
//! assert!(output.mean().unwrap().abs() < 1e-5);
//! ```

pub mod errors;
pub mod features;
pub mod layers;
pub mod loss_computers;
pub mod ops;
pub mod writers;

// Re-exports for convenience
pub use errors::{Result, SeparationError};
pub use layers::activation::Activation;
pub use loss_computers::{LossComputer, LossConfig, LossInputs, LossKind};
pub use ops::LossOutput;

/// Backend type alias for WGPU with autodiff support.
pub type Backend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// Backend type for inference (no autodiff).
pub type InferenceBackend = burn::backend::Wgpu;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::errors::{Result, SeparationError};
    pub use crate::features::{FeatureComputer, FeatureConfig, FeatureKind, feature_computer};
    pub use crate::layers::{Activation, DbResetLstm, DbResetLstmConfig};
    pub use crate::loss_computers::{BatchTensor, LossComputer, LossConfig, LossInputs, LossKind};
    pub use crate::ops::{LossOutput, PermutationSearch};
    pub use crate::writers::{ArrayRecord, ArrayRecordReader, ArrayRecordWriter};
    pub use crate::{Backend, InferenceBackend};
}
