//! Named tensors handed to a loss computer.

use std::collections::HashMap;

use burn::tensor::{Int, Tensor, backend::Backend};

use crate::errors::{Result, SeparationError};

/// A batch-major tensor of one of the ranks the losses consume.
#[derive(Debug, Clone)]
pub enum BatchTensor<B: Backend> {
    Float3(Tensor<B, 3>),
    Float4(Tensor<B, 4>),
    Labels(Tensor<B, 2, Int>),
}

impl<B: Backend> BatchTensor<B> {
    pub fn batch_size(&self) -> usize {
        match self {
            BatchTensor::Float3(tensor) => tensor.dims()[0],
            BatchTensor::Float4(tensor) => tensor.dims()[0],
            BatchTensor::Labels(tensor) => tensor.dims()[0],
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            BatchTensor::Float3(_) => "rank-3 float tensor",
            BatchTensor::Float4(_) => "rank-4 float tensor",
            BatchTensor::Labels(_) => "rank-2 integer tensor",
        }
    }
}

impl<B: Backend> From<Tensor<B, 3>> for BatchTensor<B> {
    fn from(tensor: Tensor<B, 3>) -> Self {
        BatchTensor::Float3(tensor)
    }
}

impl<B: Backend> From<Tensor<B, 4>> for BatchTensor<B> {
    fn from(tensor: Tensor<B, 4>) -> Self {
        BatchTensor::Float4(tensor)
    }
}

impl<B: Backend> From<Tensor<B, 2, Int>> for BatchTensor<B> {
    fn from(tensor: Tensor<B, 2, Int>) -> Self {
        BatchTensor::Labels(tensor)
    }
}

/// Targets, logits and sequence lengths, each keyed by name.
///
/// Typical names are `binary_targets`, `usedbins`, `fracbins`,
/// `multi_targets`, `mix_to_mask` and `labels` for targets, and `bin_emb`,
/// `spk_emb`, `bin_est` and `logits` for logits. Sequence lengths are keyed
/// by the logits they describe.
#[derive(Debug, Clone)]
pub struct LossInputs<B: Backend> {
    targets: HashMap<String, BatchTensor<B>>,
    logits: HashMap<String, BatchTensor<B>>,
    seq_length: HashMap<String, Vec<usize>>,
}

impl<B: Backend> Default for LossInputs<B> {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
            logits: HashMap::new(),
            seq_length: HashMap::new(),
        }
    }
}

impl<B: Backend> LossInputs<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, name: impl Into<String>, tensor: impl Into<BatchTensor<B>>) -> Self {
        self.targets.insert(name.into(), tensor.into());
        self
    }

    pub fn with_logits(mut self, name: impl Into<String>, tensor: impl Into<BatchTensor<B>>) -> Self {
        self.logits.insert(name.into(), tensor.into());
        self
    }

    pub fn with_seq_length(mut self, name: impl Into<String>, lengths: Vec<usize>) -> Self {
        self.seq_length.insert(name.into(), lengths);
        self
    }

    /// Every tensor with its role and name, for batch checks.
    pub(crate) fn tensors(&self) -> impl Iterator<Item = (&'static str, &str, &BatchTensor<B>)> {
        let targets = self
            .targets
            .iter()
            .map(|(name, tensor)| ("target", name.as_str(), tensor));
        let logits = self
            .logits
            .iter()
            .map(|(name, tensor)| ("logits", name.as_str(), tensor));
        targets.chain(logits)
    }

    pub(crate) fn length_vectors(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.seq_length
            .iter()
            .map(|(name, lengths)| (name.as_str(), lengths.as_slice()))
    }

    pub(crate) fn has_target(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub(crate) fn target(&self, name: &str) -> Result<&BatchTensor<B>> {
        self.targets.get(name).ok_or_else(|| SeparationError::MissingTensor {
            role: "target",
            name: name.to_string(),
        })
    }

    pub(crate) fn logit(&self, name: &str) -> Result<&BatchTensor<B>> {
        self.logits.get(name).ok_or_else(|| SeparationError::MissingTensor {
            role: "logits",
            name: name.to_string(),
        })
    }

    pub(crate) fn lengths(&self, name: &str) -> Result<&[usize]> {
        self.seq_length
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| SeparationError::MissingTensor {
                role: "sequence length",
                name: name.to_string(),
            })
    }
}

fn wrong_rank<B: Backend>(name: &str, expected: &str, found: &BatchTensor<B>) -> SeparationError {
    SeparationError::shape(format!("tensor `{name}`"), expected, found.describe())
}

pub(crate) fn float3<B: Backend>(name: &str, tensor: &BatchTensor<B>) -> Result<Tensor<B, 3>> {
    match tensor {
        BatchTensor::Float3(tensor) => Ok(tensor.clone()),
        other => Err(wrong_rank(name, "rank-3 float tensor", other)),
    }
}

pub(crate) fn float4<B: Backend>(name: &str, tensor: &BatchTensor<B>) -> Result<Tensor<B, 4>> {
    match tensor {
        BatchTensor::Float4(tensor) => Ok(tensor.clone()),
        other => Err(wrong_rank(name, "rank-4 float tensor", other)),
    }
}

pub(crate) fn labels<B: Backend>(name: &str, tensor: &BatchTensor<B>) -> Result<Tensor<B, 2, Int>> {
    match tensor {
        BatchTensor::Labels(tensor) => Ok(tensor.clone()),
        other => Err(wrong_rank(name, "rank-2 integer tensor", other)),
    }
}
