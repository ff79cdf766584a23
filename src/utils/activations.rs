//! Activation functions applied by convolutional layers
//!
//! Each activation is applied by the forward kernel to the pre-activation sum,
//! and its derivative is recovered during backprop from the stored OUTPUT value
//! rather than the input, so layers never keep pre-activation sums around.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{self, Error};

const SCALED_TANH_OUTER: f32 = 1.7159;
const SCALED_TANH_INNER: f32 = 0.66667;

/// Activation function applied elementwise to a layer's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Tanh,
    /// LeCun's scaled tanh: 1.7159 * tanh(0.66667 * x)
    ScaledTanh,
    Sigmoid,
}

impl Activation {
    /// Every activation, in the order they are documented.
    pub const ALL: [Activation; 5] = [
        Activation::Linear,
        Activation::Relu,
        Activation::Tanh,
        Activation::ScaledTanh,
        Activation::Sigmoid,
    ];

    /// Applies the activation to a pre-activation sum.
    pub fn calc(self, x: f32) -> f32 {
        match self {
            Activation::Linear => x,
            Activation::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            Activation::Tanh => x.tanh(),
            Activation::ScaledTanh => SCALED_TANH_OUTER * (SCALED_TANH_INNER * x).tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// Derivative of the activation, given its output `y = calc(x)`.
    pub fn calc_derivative(self, output: f32) -> f32 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if output > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => 1.0 - output * output,
            Activation::ScaledTanh => {
                SCALED_TANH_INNER * (SCALED_TANH_OUTER - output * output / SCALED_TANH_OUTER)
            }
            Activation::Sigmoid => output * (1.0 - output),
        }
    }

    /// Preprocessor define selecting this activation in device kernel source.
    pub fn define_name(self) -> &'static str {
        match self {
            Activation::Linear => "LINEAR",
            Activation::Relu => "RELU",
            Activation::Tanh => "TANH",
            Activation::ScaledTanh => "SCALEDTANH",
            Activation::Sigmoid => "SIGMOID",
        }
    }

    /// Name used in JSON configuration.
    pub fn name(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::ScaledTanh => "scaled_tanh",
            Activation::Sigmoid => "sigmoid",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        Activation::ALL
            .into_iter()
            .find(|a| a.name() == lowered)
            .ok_or_else(|| {
                let names: Vec<&str> = Activation::ALL.iter().map(|a| a.name()).collect();
                error::config(format!(
                    "Invalid activation function '{}'. Must be one of: {}",
                    s,
                    names.join(", ")
                ))
            })
    }
}
