//! LSTM layers whose state is periodically reset.
//!
//! A reset LSTM runs `t_reset / group_size` replicas of the same cell side by
//! side. Replica `r` clears its state every `t_reset` steps, offset by
//! `r * group_size`, so at any step some replica has a history of at least
//! `t_reset - group_size` frames. The layer output at each step is the
//! replica with the longest history. Replica outputs are kept as a
//! "multistate" tensor `[batch, time, replicas, units]` so stacked layers
//! can feed every replica its own input.

use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    tensor::{Distribution, Tensor, TensorData, activation::sigmoid, backend::Backend},
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SeparationError};
use crate::layers::Activation;
use crate::ops::sequence::{check_lengths, reverse_sequences, sequence_mask};

/// Added to the forget gate pre-activation.
pub const FORGET_BIAS: f64 = 1.0;

fn check_keep_probability(option: &str, keep: f64) -> Result<()> {
    if !(keep > 0.0 && keep <= 1.0) {
        return Err(SeparationError::configuration(
            option,
            format!("keep probability must lie in (0, 1], got {keep}"),
        ));
    }
    Ok(())
}

fn check_reset_schedule(t_reset: usize, group_size: usize) -> Result<()> {
    if t_reset == 0 {
        return Err(SeparationError::configuration("t_reset", "must be at least 1"));
    }
    if group_size == 0 {
        return Err(SeparationError::configuration("group_size", "must be at least 1"));
    }
    if t_reset % group_size != 0 {
        return Err(SeparationError::configuration(
            "t_reset",
            format!("t_reset ({t_reset}) should be a multiple of group_size ({group_size})"),
        ));
    }
    Ok(())
}

/// Configuration for a single-direction [`ResetLstm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetLstmConfig {
    pub input_size: usize,
    pub num_units: usize,
    pub t_reset: usize,
    pub group_size: usize,
    pub layer_norm: bool,
    /// Keep probability of the dropout on the candidate cell input.
    pub recurrent_dropout: f64,
    pub activation: Activation,
}

impl ResetLstmConfig {
    pub fn new(input_size: usize, num_units: usize, t_reset: usize) -> Self {
        Self {
            input_size,
            num_units,
            t_reset,
            group_size: 1,
            layer_norm: false,
            recurrent_dropout: 1.0,
            activation: Activation::Tanh,
        }
    }

    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    pub fn with_layer_norm(mut self, layer_norm: bool) -> Self {
        self.layer_norm = layer_norm;
        self
    }

    pub fn with_recurrent_dropout(mut self, keep: f64) -> Self {
        self.recurrent_dropout = keep;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn num_replicas(&self) -> usize {
        self.t_reset / self.group_size.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        check_reset_schedule(self.t_reset, self.group_size)?;
        if self.num_units == 0 || self.input_size == 0 {
            return Err(SeparationError::configuration(
                "num_units",
                "input and state sizes must be at least 1",
            ));
        }
        check_keep_probability("recurrent_dropout", self.recurrent_dropout)
    }

    /// Initializes the layer with the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResetLstm<B>> {
        self.validate()?;
        let gates = 4 * self.num_units;
        let (gate_norms, cell_norm) = if self.layer_norm {
            let gate_norms = (0..4)
                .map(|_| LayerNormConfig::new(self.num_units).init(device))
                .collect();
            (gate_norms, Some(LayerNormConfig::new(self.num_units).init(device)))
        } else {
            (Vec::new(), None)
        };

        Ok(ResetLstm {
            input: LinearConfig::new(self.input_size, gates).init(device),
            recurrent: LinearConfig::new(self.num_units, gates)
                .with_bias(false)
                .init(device),
            gate_norms,
            cell_norm,
            recurrent_dropout: DropoutConfig::new(1.0 - self.recurrent_dropout).init(),
            input_size: self.input_size,
            num_units: self.num_units,
            t_reset: self.t_reset,
            group_size: self.group_size,
            activation_id: self.activation.to_id(),
        })
    }
}

/// Number of frames replica `replica` has seen at `step`, counting the
/// current one.
fn replica_history(step: usize, replica: usize, t_reset: usize, group_size: usize) -> usize {
    let offset = replica * group_size;
    if step < offset {
        step + 1
    } else {
        (step - offset) % t_reset + 1
    }
}

/// For every step, the replica with the longest history; the lowest index
/// wins ties.
pub fn longest_history_schedule(max_time: usize, t_reset: usize, group_size: usize) -> Vec<usize> {
    let replicas = t_reset / group_size.max(1);
    (0..max_time)
        .map(|step| {
            let mut best = 0;
            for replica in 1..replicas {
                if replica_history(step, replica, t_reset, group_size)
                    > replica_history(step, best, t_reset, group_size)
                {
                    best = replica;
                }
            }
            best
        })
        .collect()
}

/// Single-direction reset LSTM.
#[derive(Module, Debug)]
pub struct ResetLstm<B: Backend> {
    /// Input projection to the four gates (i, j, f, o).
    input: Linear<B>,
    /// Recurrent projection, no bias.
    recurrent: Linear<B>,
    /// Per-gate layer norms; empty without layer norm.
    gate_norms: Vec<LayerNorm<B>>,
    cell_norm: Option<LayerNorm<B>>,
    recurrent_dropout: Dropout,
    input_size: usize,
    num_units: usize,
    t_reset: usize,
    group_size: usize,
    activation_id: u8,
}

impl<B: Backend> ResetLstm<B> {
    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn num_replicas(&self) -> usize {
        self.t_reset / self.group_size
    }

    pub fn activation(&self) -> Activation {
        Activation::from_id(self.activation_id)
    }

    fn gate(&self, gates: &Tensor<B, 3>, index: usize) -> Tensor<B, 3> {
        let [batch_size, replicas, _] = gates.dims();
        let units = self.num_units;
        let gate = gates
            .clone()
            .slice([0..batch_size, 0..replicas, index * units..(index + 1) * units]);
        match self.gate_norms.get(index) {
            Some(norm) => norm.forward(gate),
            None => gate,
        }
    }

    /// `[1, replicas, 1]` with 0 for replicas whose state resets at `step`.
    fn keep_mask(&self, step: usize, device: &B::Device) -> Tensor<B, 3> {
        let replicas = self.num_replicas();
        let keep: Vec<f32> = (0..replicas)
            .map(|replica| {
                let offset = replica * self.group_size;
                if step >= offset && (step - offset) % self.t_reset == 0 {
                    0.0
                } else {
                    1.0
                }
            })
            .collect();
        Tensor::from_data(TensorData::new(keep, [1, replicas, 1]), device)
    }

    /// One-hot `[1, time, replicas, 1]` selection of the longest history.
    fn selection(&self, max_time: usize, device: &B::Device) -> Tensor<B, 4> {
        let replicas = self.num_replicas();
        let mut data = vec![0.0f32; max_time * replicas];
        for (step, replica) in longest_history_schedule(max_time, self.t_reset, self.group_size)
            .into_iter()
            .enumerate()
        {
            data[step * replicas + replica] = 1.0;
        }
        Tensor::from_data(TensorData::new(data, [1, max_time, replicas, 1]), device)
    }

    /// Runs the layer over a multistate input `[batch, time, replicas, in]`.
    ///
    /// Returns the selected output `[batch, time, units]` and every
    /// replica's output `[batch, time, replicas, units]`, both zero at padded
    /// frames.
    pub fn forward(
        &self,
        inputs: Tensor<B, 4>,
        seq_length: &[usize],
    ) -> Result<(Tensor<B, 3>, Tensor<B, 4>)> {
        let [batch_size, max_time, replicas, input_size] = inputs.dims();
        if replicas != self.num_replicas() || input_size != self.input_size {
            return Err(SeparationError::shape(
                "reset LSTM input",
                format!("[batch, time, {}, {}]", self.num_replicas(), self.input_size),
                format!("{:?}", inputs.dims()),
            ));
        }
        check_lengths(seq_length, batch_size, max_time)?;
        let device = inputs.device();
        let units = self.num_units;
        if max_time == 0 {
            return Ok((
                Tensor::zeros([batch_size, 0, units], &device),
                Tensor::zeros([batch_size, 0, replicas, units], &device),
            ));
        }

        let activation = self.activation();
        let state_shape = [batch_size, replicas, units];
        let projected = self.input.forward(inputs);
        let mut hidden = Tensor::<B, 3>::zeros(state_shape, &device);
        let mut cell = Tensor::<B, 3>::zeros(state_shape, &device);
        let mut outputs = Vec::with_capacity(max_time);

        for step in 0..max_time {
            let keep = self.keep_mask(step, &device).expand(state_shape);
            hidden = hidden * keep.clone();
            cell = cell * keep;

            let gates = projected
                .clone()
                .slice([0..batch_size, step..step + 1, 0..replicas, 0..4 * units])
                .reshape([batch_size, replicas, 4 * units])
                + self.recurrent.forward(hidden);

            let input_gate = sigmoid(self.gate(&gates, 0));
            let candidate = self
                .recurrent_dropout
                .forward(activation.apply(self.gate(&gates, 1)));
            let forget_gate = sigmoid(self.gate(&gates, 2).add_scalar(FORGET_BIAS));
            let output_gate = sigmoid(self.gate(&gates, 3));

            cell = cell * forget_gate + input_gate * candidate;
            if let Some(norm) = &self.cell_norm {
                cell = norm.forward(cell);
            }
            hidden = activation.apply(cell.clone()) * output_gate;
            outputs.push(hidden.clone());
        }

        let shape = [batch_size, max_time, replicas, units];
        let mask = sequence_mask::<B>(seq_length, max_time, &device)?
            .reshape([batch_size, max_time, 1, 1])
            .expand(shape);
        let states = Tensor::stack::<4>(outputs, 1) * mask;

        let selected = (states.clone() * self.selection(max_time, &device).expand(shape))
            .sum_dim(2)
            .reshape([batch_size, max_time, units]);
        Ok((selected, states))
    }
}

/// Reverses a multistate tensor along time inside each sequence.
fn reverse_multistate<B: Backend>(states: Tensor<B, 4>, seq_length: &[usize]) -> Result<Tensor<B, 4>> {
    let [batch_size, max_time, replicas, features] = states.dims();
    let flat = states.reshape([batch_size, max_time, replicas * features]);
    Ok(reverse_sequences(flat, seq_length)?.reshape([batch_size, max_time, replicas, features]))
}

/// Bidirectional reset LSTM: a forward layer and a layer over the
/// length-aware time reversal, concatenated on the feature axis.
#[derive(Module, Debug)]
pub struct BResetLstm<B: Backend> {
    forward_layer: ResetLstm<B>,
    backward_layer: ResetLstm<B>,
}

impl<B: Backend> BResetLstm<B> {
    pub fn init(config: &ResetLstmConfig, device: &B::Device) -> Result<Self> {
        Ok(Self {
            forward_layer: config.init(device)?,
            backward_layer: config.init(device)?,
        })
    }

    /// Returns `[batch, time, 2 * units]` and the multistate
    /// `[batch, time, replicas, 2 * units]` for the next layer.
    pub fn forward(
        &self,
        inputs: Tensor<B, 4>,
        seq_length: &[usize],
    ) -> Result<(Tensor<B, 3>, Tensor<B, 4>)> {
        let (forward_out, forward_states) = self.forward_layer.forward(inputs.clone(), seq_length)?;

        let reversed = reverse_multistate(inputs, seq_length)?;
        let (backward_out, backward_states) = self.backward_layer.forward(reversed, seq_length)?;
        let backward_out = reverse_sequences(backward_out, seq_length)?;
        let backward_states = reverse_multistate(backward_states, seq_length)?;

        Ok((
            Tensor::cat(vec![forward_out, backward_out], 2),
            Tensor::cat(vec![forward_states, backward_states], 3),
        ))
    }
}

/// Configuration for a [`DbResetLstm`] stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbResetLstmConfig {
    pub input_size: usize,
    pub num_units: usize,
    pub num_layers: usize,
    pub t_reset: usize,
    pub group_size: usize,
    pub layer_norm: bool,
    /// Keep probability inside the cells.
    pub recurrent_dropout: f64,
    pub activation_fn: String,
    /// Standard deviation of the Gaussian noise added to the inputs while
    /// training.
    pub input_noise: f64,
    /// Keep probability of the dropout on every layer output while training.
    pub dropout: f64,
}

impl Default for DbResetLstmConfig {
    fn default() -> Self {
        Self {
            input_size: 1,
            num_units: 1,
            num_layers: 1,
            t_reset: 1,
            group_size: 1,
            layer_norm: false,
            recurrent_dropout: 1.0,
            activation_fn: "tanh".to_string(),
            input_noise: 0.0,
            dropout: 1.0,
        }
    }
}

impl DbResetLstmConfig {
    pub fn new(input_size: usize, num_units: usize, num_layers: usize, t_reset: usize) -> Self {
        Self {
            input_size,
            num_units,
            num_layers,
            t_reset,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation_fn = activation.name().to_string();
        self
    }

    pub fn with_layer_norm(mut self, layer_norm: bool) -> Self {
        self.layer_norm = layer_norm;
        self
    }

    pub fn with_input_noise(mut self, stddev: f64) -> Self {
        self.input_noise = stddev;
        self
    }

    pub fn with_dropout(mut self, keep: f64) -> Self {
        self.dropout = keep;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(SeparationError::configuration("num_layers", "must be at least 1"));
        }
        if !(self.input_noise >= 0.0 && self.input_noise.is_finite()) {
            return Err(SeparationError::configuration(
                "input_noise",
                format!("must be a non-negative number, got {}", self.input_noise),
            ));
        }
        check_keep_probability("dropout", self.dropout)?;
        self.layer_config(self.input_size)?.validate()
    }

    fn layer_config(&self, input_size: usize) -> Result<ResetLstmConfig> {
        Ok(ResetLstmConfig::new(input_size, self.num_units, self.t_reset)
            .with_group_size(self.group_size)
            .with_layer_norm(self.layer_norm)
            .with_recurrent_dropout(self.recurrent_dropout)
            .with_activation(Activation::from_name(&self.activation_fn)?))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DbResetLstm<B>> {
        self.validate()?;
        let mut layers = Vec::with_capacity(self.num_layers);
        let mut input_size = self.input_size;
        for _ in 0..self.num_layers {
            layers.push(BResetLstm::init(&self.layer_config(input_size)?, device)?);
            input_size = 2 * self.num_units;
        }
        let num_replicas = self.t_reset / self.group_size;
        log::debug!(
            "DbResetLstm: {} layers of {} units, {} replicas",
            self.num_layers,
            self.num_units,
            num_replicas
        );

        Ok(DbResetLstm {
            layers,
            dropout: DropoutConfig::new(1.0 - self.dropout).init(),
            input_noise: self.input_noise,
            num_replicas,
        })
    }
}

/// Deep bidirectional reset LSTM.
///
/// Input noise and dropout only apply on autodiff backends.
#[derive(Module, Debug)]
pub struct DbResetLstm<B: Backend> {
    layers: Vec<BResetLstm<B>>,
    dropout: Dropout,
    input_noise: f64,
    num_replicas: usize,
}

impl<B: Backend> DbResetLstm<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// `[batch, time, in]` to `[batch, time, 2 * units]`.
    pub fn forward(&self, inputs: Tensor<B, 3>, seq_length: &[usize]) -> Result<Tensor<B, 3>> {
        let [batch_size, max_time, input_size] = inputs.dims();
        check_lengths(seq_length, batch_size, max_time)?;

        let inputs = if B::ad_enabled() && self.input_noise > 0.0 {
            let noise = Tensor::random(
                inputs.shape(),
                Distribution::Normal(0.0, self.input_noise),
                &inputs.device(),
            );
            inputs + noise
        } else {
            inputs
        };

        let mut states = inputs
            .reshape([batch_size, max_time, 1, input_size])
            .expand([batch_size, max_time, self.num_replicas, input_size]);
        let mut outputs = None;
        for layer in &self.layers {
            let (layer_outputs, layer_states) = layer.forward(states, seq_length)?;
            outputs = Some(self.dropout.forward(layer_outputs));
            states = self.dropout.forward(layer_states);
        }

        outputs.ok_or_else(|| SeparationError::configuration("num_layers", "must be at least 1"))
    }
}
