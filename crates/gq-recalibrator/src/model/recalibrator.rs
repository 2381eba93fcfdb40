use std::fmt;
use std::str::FromStr;

use burn::module::{Ignored, ParamId};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation;

/// Activation applied after every hidden layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nonlinearity {
    #[default]
    Silu,
    Relu,
    Gelu,
    Tanh,
    Sigmoid,
}

impl Nonlinearity {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::Silu => activation::silu(x),
            Self::Relu => activation::relu(x),
            Self::Gelu => activation::gelu(x),
            Self::Tanh => activation::tanh(x),
            Self::Sigmoid => activation::sigmoid(x),
        }
    }
}

impl fmt::Display for Nonlinearity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Silu => "silu",
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
        };
        f.write_str(name)
    }
}

impl FromStr for Nonlinearity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silu" | "swish" => Ok(Self::Silu),
            "relu" => Ok(Self::Relu),
            "gelu" => Ok(Self::Gelu),
            "tanh" => Ok(Self::Tanh),
            "sigmoid" => Ok(Self::Sigmoid),
            other => Err(format!("unknown nonlinearity: {other}")),
        }
    }
}

/// Configuration for the GQ recalibrator MLP.
///
/// Every hidden layer has width `round(num_input_properties * layer_expansion_factor)`.
///
/// ```text
/// (variants, samples, properties)
///   → reshape (variants*samples, properties)
///   → [Linear → nonlinearity] × num_hidden_layers
///   → Linear(→1) → sigmoid
///   → (variants, samples) probability that each genotype call is good
/// ```
#[derive(Config, Debug)]
pub struct GqRecalibratorConfig {
    /// Length of each genotype's property vector.
    pub num_input_properties: usize,
    #[config(default = 3)]
    pub num_hidden_layers: usize,
    #[config(default = 2.0)]
    pub layer_expansion_factor: f64,
    #[config(default = true)]
    pub bias: bool,
    #[config(default = "Nonlinearity::Silu")]
    pub hidden_nonlinearity: Nonlinearity,
}

impl GqRecalibratorConfig {
    pub fn hidden_width(&self) -> usize {
        ((self.num_input_properties as f64 * self.layer_expansion_factor).round() as usize).max(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> GqRecalibratorNet<B> {
        let width = self.hidden_width();
        let mut hidden = Vec::with_capacity(self.num_hidden_layers);
        let mut d_in = self.num_input_properties;
        for _ in 0..self.num_hidden_layers {
            hidden.push(LinearConfig::new(d_in, width).with_bias(self.bias).init(device));
            d_in = width;
        }
        GqRecalibratorNet {
            hidden,
            output: LinearConfig::new(d_in, 1).with_bias(self.bias).init(device),
            activation: Ignored(self.hidden_nonlinearity),
        }
    }
}

/// Maps per-genotype property vectors to the probability the call is good.
#[derive(Module, Debug)]
pub struct GqRecalibratorNet<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    activation: Ignored<Nonlinearity>,
}

impl<B: Backend> GqRecalibratorNet<B> {
    /// Input shape: `(variants, samples, properties)`. Output: `(variants, samples)`.
    pub fn forward(&self, properties: Tensor<B, 3>) -> Tensor<B, 2> {
        let [v, s, p] = properties.dims();
        let mut x = properties.reshape([v * s, p]);
        for layer in &self.hidden {
            x = self.activation.0.apply(layer.forward(x));
        }
        activation::sigmoid(self.output.forward(x)).reshape([v, s])
    }

    pub fn num_hidden_layers(&self) -> usize {
        self.hidden.len()
    }

    /// Ids of every trainable parameter, split by tensor rank.
    pub fn parameter_ids(&self) -> ParameterIds {
        let layers = self.hidden.iter().chain(std::iter::once(&self.output));
        let mut ids = ParameterIds::default();
        for layer in layers {
            ids.weights.push(layer.weight.id);
            if let Some(bias) = &layer.bias {
                ids.biases.push(bias.id);
            }
        }
        ids
    }
}

/// Parameter ids of a [`GqRecalibratorNet`]: rank-2 weights and rank-1 biases.
#[derive(Debug, Clone, Default)]
pub struct ParameterIds {
    pub weights: Vec<ParamId>,
    pub biases: Vec<ParamId>,
}
