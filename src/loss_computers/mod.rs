//! Loss computers: configured selection of a loss function over named
//! targets, logits and sequence lengths.

mod computer;
mod config;
mod inputs;
mod kind;

pub use computer::LossComputer;
pub use config::LossConfig;
pub use inputs::{BatchTensor, LossInputs};
pub use kind::LossKind;
