//! Neural network layers for separation models.
//!
//! This module contains the activation functions and the reset LSTM family
//! of recurrent layers.

pub mod activation;
pub mod reset_lstm;

pub use activation::Activation;
pub use reset_lstm::{
    BResetLstm, DbResetLstm, DbResetLstmConfig, ResetLstm, ResetLstmConfig,
    longest_history_schedule,
};
