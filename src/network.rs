//! Ordered layer stack
//!
//! A [`Network`] is an input layer followed by any number of layers, each fed
//! by the one before it. The forward pass walks the stack front to back; the
//! backward pass walks it back to front and stops as soon as a layer has no
//! errors to hand upstream.

use std::rc::Rc;

use tracing::debug;

use crate::accel::SharedAccelerator;
use crate::config::{ConvolutionalConfig, NetworkConfig};
use crate::error::{self, Result};
use crate::layers::{output_errors, ConvolutionalLayer, InputLayer, Layer};
use crate::utils::{SharedTimingSink, SimpleRng};

/// Input layer plus a sequence of layers sharing one accelerator.
///
/// # Example
///
/// ```
/// use rust_conv_layers::accel::{shared, CpuAccelerator};
/// use rust_conv_layers::config::ConvolutionalConfig;
/// use rust_conv_layers::network::Network;
///
/// let mut net = Network::new(1, 8, shared(CpuAccelerator::new()));
/// net.set_batch_size(2);
/// net.add_convolutional(&ConvolutionalConfig::new().num_filters(4).filter_size(3).relu())
///     .unwrap();
/// net.propagate(&vec![0.5; 2 * 8 * 8]).unwrap();
/// assert_eq!(net.results().len(), 2 * 4 * 6 * 6);
/// ```
pub struct Network {
    accelerator: SharedAccelerator,
    input: InputLayer,
    layers: Vec<Box<dyn Layer>>,
    learning_rate: f32,
    timer: Option<SharedTimingSink>,
}

impl Network {
    /// Creates a network holding only an input layer, with a batch size of 1.
    pub fn new(input_planes: usize, input_board_size: usize, accelerator: SharedAccelerator) -> Self {
        let mut input = InputLayer::new(input_planes, input_board_size);
        input.set_batch_size(1);
        Self {
            accelerator,
            input,
            layers: Vec::new(),
            learning_rate: 0.0,
            timer: None,
        }
    }

    /// Builds a network from configuration with randomly initialized weights.
    pub fn from_config(
        config: &NetworkConfig,
        accelerator: SharedAccelerator,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        config.validate()?;
        let mut network = Self::new(config.input_planes, config.input_board_size, accelerator);
        network.learning_rate = config.learning_rate;
        network.set_batch_size(config.batch_size);
        for layer_config in &config.layers {
            let mut layer = network.build_convolutional(layer_config)?;
            layer.randomize_weights(rng);
            network.layers.push(Box::new(layer));
        }
        debug!(
            layers = network.layers.len(),
            batch_size = config.batch_size,
            "built network from config"
        );
        Ok(network)
    }

    /// Attaches a timing sink to every convolutional layer added from now on.
    pub fn with_timer(mut self, timer: SharedTimingSink) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn accelerator(&self) -> SharedAccelerator {
        Rc::clone(&self.accelerator)
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn build_convolutional(&self, config: &ConvolutionalConfig) -> Result<ConvolutionalLayer> {
        let layer_index = self.layers.len() + 1;
        let layer =
            ConvolutionalLayer::new(layer_index, self.last_layer(), config, self.accelerator())?;
        Ok(match &self.timer {
            Some(timer) => layer.with_timer(Rc::clone(timer)),
            None => layer,
        })
    }

    /// Appends a convolutional layer with zeroed weights, fed by the current last layer.
    pub fn add_convolutional(&mut self, config: &ConvolutionalConfig) -> Result<()> {
        let layer = self.build_convolutional(config)?;
        debug!(layer_index = layer.layer_index(), "{}", layer);
        self.layers.push(Box::new(layer));
        Ok(())
    }

    /// Appends an already built layer.
    ///
    /// The layer must have been built against the current last layer.
    pub fn add_layer(&mut self, layer: Box<dyn Layer>) -> Result<()> {
        let batch_size = self.batch_size();
        if layer.batch_size() != batch_size {
            return Err(error::shape(format!(
                "{} layer has batch size {}, network has {}",
                layer.name(),
                layer.batch_size(),
                batch_size
            )));
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Number of layers, input layer included.
    pub fn num_layers(&self) -> usize {
        self.layers.len() + 1
    }

    /// Layer `index`, where index 0 is the input layer.
    pub fn layer(&self, index: usize) -> Option<&dyn Layer> {
        match index {
            0 => Some(&self.input as &dyn Layer),
            i => self.layers.get(i - 1).map(|layer| layer.as_ref()),
        }
    }

    pub fn last_layer(&self) -> &dyn Layer {
        match self.layers.last() {
            Some(layer) => layer.as_ref(),
            None => &self.input,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input.batch_size()
    }

    /// Resizes every layer's results for a new batch size.
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.input.set_batch_size(batch_size);
        for layer in self.layers.iter_mut() {
            layer.set_batch_size(batch_size);
        }
    }

    /// Output of the last layer.
    pub fn results(&self) -> &[f32] {
        self.last_layer().results()
    }

    /// Forward pass over one batch laid out `[n][plane][row][col]`.
    pub fn propagate(&mut self, input: &[f32]) -> Result<()> {
        self.input.set_input(input)?;
        for i in 0..self.layers.len() {
            let (before, rest) = self.layers.split_at_mut(i);
            let upstream: &dyn Layer = match before.last() {
                Some(layer) => layer.as_ref(),
                None => &self.input,
            };
            rest[0].propagate(upstream)?;
        }
        Ok(())
    }

    /// Backward pass from errors on the last layer's results.
    ///
    /// Each layer updates its weights and hands errors to its upstream
    /// neighbor; the walk ends at the first layer that hands back none.
    pub fn back_prop_errors(&mut self, learning_rate: f32, errors: &[f32]) -> Result<()> {
        let mut pending: Option<Vec<f32>> = None;
        for i in (0..self.layers.len()).rev() {
            let (before, rest) = self.layers.split_at_mut(i);
            let upstream: &dyn Layer = match before.last() {
                Some(layer) => layer.as_ref(),
                None => &self.input,
            };
            let layer_errors = pending.as_deref().unwrap_or(errors);
            match rest[0].back_prop_errors(learning_rate, layer_errors, upstream)? {
                Some(upstream_errors) => pending = Some(upstream_errors),
                None => {
                    debug!(stopped_at = i + 1, "backprop chain ended");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Backward pass from target values for the last layer.
    pub fn back_prop_expected(&mut self, learning_rate: f32, expected: &[f32]) -> Result<()> {
        let errors = output_errors(self.results(), expected)?;
        self.back_prop_errors(learning_rate, &errors)
    }

    /// One training step at the configured learning rate: forward, then backward from `expected`.
    pub fn learn_batch(&mut self, input: &[f32], expected: &[f32]) -> Result<()> {
        self.propagate(input)?;
        self.back_prop_expected(self.learning_rate, expected)
    }
}
