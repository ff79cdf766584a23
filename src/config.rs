//! Configuration structures for convolutional networks
//!
//! Networks are described in JSON: the input planes and board size, the batch
//! size and learning rate, and one entry per convolutional layer.
//!
//! # Example
//!
//! ```json
//! {
//!   "input_planes": 1,
//!   "input_board_size": 28,
//!   "batch_size": 128,
//!   "learning_rate": 0.002,
//!   "layers": [
//!     { "num_filters": 8, "filter_size": 5, "pad_zeros": true, "biased": true, "activation": "relu" },
//!     { "num_filters": 16, "filter_size": 5, "pad_zeros": true, "biased": true, "activation": "relu" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{self, Result};
use crate::utils::Activation;

/// Configuration of one convolutional layer.
///
/// Can be built by chaining, in the same order one would describe the layer:
///
/// ```
/// use rust_conv_layers::config::ConvolutionalConfig;
/// use rust_conv_layers::utils::Activation;
///
/// let config = ConvolutionalConfig::new()
///     .num_filters(8)
///     .filter_size(5)
///     .relu()
///     .biased()
///     .pad_zeros();
/// assert_eq!(config.activation, Activation::Relu);
/// assert!(config.validate(0).is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvolutionalConfig {
    /// Number of filters, i.e. output planes
    pub num_filters: usize,

    /// Side of the square filter; must be odd
    pub filter_size: usize,

    /// Keep the board size by treating reads outside the upstream board as zero
    #[serde(default)]
    pub pad_zeros: bool,

    /// Add one learned bias per output plane
    #[serde(default)]
    pub biased: bool,

    #[serde(default)]
    pub activation: Activation,
}

impl Default for ConvolutionalConfig {
    fn default() -> Self {
        Self {
            num_filters: 1,
            filter_size: 1,
            pad_zeros: false,
            biased: false,
            activation: Activation::Linear,
        }
    }
}

impl ConvolutionalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_filters(mut self, num_filters: usize) -> Self {
        self.num_filters = num_filters;
        self
    }

    pub fn filter_size(mut self, filter_size: usize) -> Self {
        self.filter_size = filter_size;
        self
    }

    pub fn pad_zeros(mut self) -> Self {
        self.pad_zeros = true;
        self
    }

    pub fn biased(mut self) -> Self {
        self.biased = true;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn linear(self) -> Self {
        self.activation(Activation::Linear)
    }

    pub fn relu(self) -> Self {
        self.activation(Activation::Relu)
    }

    pub fn tanh(self) -> Self {
        self.activation(Activation::Tanh)
    }

    pub fn scaled_tanh(self) -> Self {
        self.activation(Activation::ScaledTanh)
    }

    pub fn sigmoid(self) -> Self {
        self.activation(Activation::Sigmoid)
    }

    /// Checks the layer in isolation. `index` only labels error messages.
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.num_filters == 0 {
            return Err(error::config(format!(
                "Layer {}: num_filters must be greater than 0",
                index
            )));
        }
        if self.filter_size == 0 {
            return Err(error::config(format!(
                "Layer {}: filter_size must be greater than 0",
                index
            )));
        }
        if self.filter_size % 2 == 0 {
            return Err(error::config(format!(
                "Layer {}: filter_size must be odd, got {}",
                index, self.filter_size
            )));
        }
        Ok(())
    }
}

/// Configuration of a whole network: an input layer followed by convolutional layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_planes: usize,
    pub input_board_size: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    pub layers: Vec<ConvolutionalConfig>,
}

fn default_batch_size() -> usize {
    1
}

fn default_learning_rate() -> f32 {
    0.002
}

impl NetworkConfig {
    /// Board size seen by each layer, input first, following the convolution arithmetic.
    pub fn board_sizes(&self) -> Result<Vec<usize>> {
        let mut sizes = vec![self.input_board_size];
        let mut board_size = self.input_board_size;
        for (i, layer) in self.layers.iter().enumerate() {
            if !layer.pad_zeros {
                if layer.filter_size > board_size {
                    return Err(error::config(format!(
                        "Layer {}: filter_size {} exceeds upstream board size {}",
                        i, layer.filter_size, board_size
                    )));
                }
                board_size = board_size + 1 - layer.filter_size;
            }
            sizes.push(board_size);
        }
        Ok(sizes)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_planes == 0 {
            return Err(error::config("input_planes must be greater than 0"));
        }
        if self.input_board_size == 0 {
            return Err(error::config("input_board_size must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(error::config("batch_size must be greater than 0"));
        }
        if self.learning_rate.is_nan() || self.learning_rate < 0.0 {
            return Err(error::config("learning_rate must be non-negative"));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            layer.validate(i)?;
        }
        self.board_sizes()?;
        Ok(())
    }
}

/// Loads a network configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it into a [`NetworkConfig`] and validates it.
///
/// ```no_run
/// use rust_conv_layers::config::load_config;
///
/// let cfg = load_config("config/mnist_conv.json").unwrap();
/// assert!(!cfg.layers.is_empty());
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<NetworkConfig> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parses and validates a network configuration from JSON text.
pub fn parse_config(json: &str) -> Result<NetworkConfig> {
    let config: NetworkConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}
