//! Activation functions for recurrent layers.

use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SeparationError};

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Hyperbolic tangent: f(x) = tanh(x)
    #[default]
    Tanh,
    /// Rectified Linear Unit: f(x) = max(0, x)
    Relu,
    /// Sigmoid: f(x) = 1 / (1 + exp(-x))
    Sigmoid,
    /// Constant one, whatever the input.
    Unit,
    /// No activation (identity function).
    None,
}

impl Activation {
    /// Applies the activation function to a tensor.
    pub fn apply<B: Backend, const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Tanh => burn::tensor::activation::tanh(tensor),
            Activation::Relu => burn::tensor::activation::relu(tensor),
            Activation::Sigmoid => burn::tensor::activation::sigmoid(tensor),
            Activation::Unit => tensor.ones_like(),
            Activation::None => tensor,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Unit => "unit",
            Activation::None => "none",
        }
    }

    /// Creates an Activation from a configuration name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "unit" => Ok(Activation::Unit),
            "none" => Ok(Activation::None),
            _ => Err(SeparationError::configuration(
                "activation_fn",
                format!("undefined activation function `{name}`"),
            )),
        }
    }

    /// Converts activation to a numeric ID for storage in Module.
    pub fn to_id(&self) -> u8 {
        match self {
            Activation::Tanh => 0,
            Activation::Relu => 1,
            Activation::Sigmoid => 2,
            Activation::Unit => 3,
            Activation::None => 4,
        }
    }

    /// Creates an Activation from a numeric ID.
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => Activation::Relu,
            2 => Activation::Sigmoid,
            3 => Activation::Unit,
            4 => Activation::None,
            _ => Activation::Tanh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_activation_from_name() {
        assert_eq!(Activation::from_name("relu").unwrap(), Activation::Relu);
        assert_eq!(Activation::from_name("SIGMOID").unwrap(), Activation::Sigmoid);
        assert_eq!(Activation::from_name("tanh").unwrap(), Activation::Tanh);
        assert_eq!(Activation::from_name("unit").unwrap(), Activation::Unit);
        assert!(matches!(
            Activation::from_name("elu"),
            Err(SeparationError::Configuration { ref option, .. }) if option == "activation_fn"
        ));
    }

    #[test]
    fn test_activation_id_roundtrip() {
        let activations = [
            Activation::Tanh,
            Activation::Relu,
            Activation::Sigmoid,
            Activation::Unit,
            Activation::None,
        ];
        for act in activations {
            assert_eq!(Activation::from_id(act.to_id()), act);
            assert_eq!(Activation::from_name(act.name()).unwrap(), act);
        }
    }

    #[test]
    fn test_unit_activation() {
        use burn::tensor::backend::Backend;
        let device = <TestBackend as Backend>::Device::default();
        let input = Tensor::<TestBackend, 1>::from_floats([4.0, -9.0, 0.0], &device);
        let result: Vec<f32> = Activation::Unit.apply(input).to_data().to_vec().unwrap();
        assert_eq!(result, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_relu_and_tanh() {
        use burn::tensor::backend::Backend;
        let device = <TestBackend as Backend>::Device::default();
        let input = Tensor::<TestBackend, 1>::from_floats([-1.0, 0.5], &device);

        let relu: Vec<f32> = Activation::Relu.apply(input.clone()).to_data().to_vec().unwrap();
        assert_eq!(relu, vec![0.0, 0.5]);

        let tanh: Vec<f32> = Activation::Tanh.apply(input).to_data().to_vec().unwrap();
        assert!((tanh[0] - (-1.0f32).tanh()).abs() < 1e-5);
        assert!((tanh[1] - 0.5f32.tanh()).abs() < 1e-5);
    }
}
