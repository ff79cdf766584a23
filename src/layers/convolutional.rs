//! Convolutional layer with accelerator-backed forward and backward passes
//!
//! Forward convolution, weight gradients and upstream errors each run as one
//! kernel launch on the shared accelerator. Bias gradients are accumulated on
//! the host: there is only one per output plane.
//!
//! Weight updates follow a pre-negated, pre-scaled convention: every change
//! computed here is simply added to its weight (`weight += change`).

use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::accel::{Dispatch, KernelArgs, KernelId, KernelKind, KernelOptions, SharedAccelerator};
use crate::config::ConvolutionalConfig;
use crate::error::{self, Result};
use crate::layers::Layer;
use crate::layout::{output_board_size, ConvGeometry};
use crate::utils::{Activation, SharedTimingSink, SimpleRng};

/// 2D convolutional layer over square boards.
///
/// # Example
///
/// ```
/// use rust_conv_layers::accel::{shared, CpuAccelerator};
/// use rust_conv_layers::config::ConvolutionalConfig;
/// use rust_conv_layers::layers::{ConvolutionalLayer, InputLayer, Layer};
///
/// let accelerator = shared(CpuAccelerator::new());
/// let input = InputLayer::new(1, 28);
/// let config = ConvolutionalConfig::new().num_filters(8).filter_size(5).relu().biased().pad_zeros();
/// let layer = ConvolutionalLayer::new(1, &input, &config, accelerator).unwrap();
/// assert_eq!(layer.board_size(), 28);
/// assert_eq!(layer.weights_size(), 8 * 1 * 5 * 5);
/// ```
pub struct ConvolutionalLayer {
    layer_index: usize,
    accelerator: SharedAccelerator,
    kernel_convolve: KernelId,
    kernel_backprop_weights: KernelId,
    kernel_backprop_errors: KernelId,

    upstream_planes: usize,
    upstream_board_size: usize,
    num_planes: usize,
    board_size: usize,
    filter_size: usize,
    pad_zeros: bool,
    biased: bool,
    activation: Activation,

    batch_size: usize,
    weights: Vec<f32>,      // [outPlane][upstreamPlane][filterRow][filterCol]
    bias_weights: Vec<f32>, // [outPlane], empty when unbiased
    results: Vec<f32>,      // [n][outPlane][row][col]

    timer: Option<SharedTimingSink>,
}

impl ConvolutionalLayer {
    /// Creates a layer fed by `upstream` and builds its three kernels.
    ///
    /// Weights start at zero; call [`randomize_weights`](Self::randomize_weights)
    /// or [`set_weights`](Self::set_weights). The batch size is taken from `upstream`.
    ///
    /// # Errors
    ///
    /// - `Error::Config` for an even or zero filter size, zero filters, or a
    ///   filter wider than an unpadded upstream board
    /// - `Error::Device` if a kernel fails to build
    pub fn new(
        layer_index: usize,
        upstream: &dyn Layer,
        config: &ConvolutionalConfig,
        accelerator: SharedAccelerator,
    ) -> Result<Self> {
        config.validate(layer_index)?;
        let upstream_board_size = upstream.board_size();
        if !config.pad_zeros && config.filter_size > upstream_board_size {
            return Err(error::config(format!(
                "Layer {}: filter_size {} exceeds upstream board size {}",
                layer_index, config.filter_size, upstream_board_size
            )));
        }

        let options = KernelOptions {
            activation: config.activation,
            biased: config.biased,
        };
        let (kernel_convolve, kernel_backprop_weights, kernel_backprop_errors) = {
            let mut accel = accelerator.borrow_mut();
            (
                accel.build_kernel(KernelKind::Convolve, &options)?,
                accel.build_kernel(KernelKind::BackpropWeights, &options)?,
                accel.build_kernel(KernelKind::BackpropErrors, &options)?,
            )
        };

        let upstream_planes = upstream.num_planes();
        let num_planes = config.num_filters;
        let board_size = output_board_size(upstream_board_size, config.filter_size, config.pad_zeros);
        let weight_count = num_planes * upstream_planes * config.filter_size * config.filter_size;
        debug!(
            layer_index,
            num_planes,
            filter_size = config.filter_size,
            board_size,
            options = %options.compiler_options(),
            "created convolutional layer"
        );

        let mut layer = Self {
            layer_index,
            accelerator,
            kernel_convolve,
            kernel_backprop_weights,
            kernel_backprop_errors,
            upstream_planes,
            upstream_board_size,
            num_planes,
            board_size,
            filter_size: config.filter_size,
            pad_zeros: config.pad_zeros,
            biased: config.biased,
            activation: config.activation,
            batch_size: 0,
            weights: vec![0.0; weight_count],
            bias_weights: vec![0.0; if config.biased { num_planes } else { 0 }],
            results: Vec::new(),
            timer: None,
        };
        layer.set_batch_size(upstream.batch_size());
        Ok(layer)
    }

    /// Attaches a timing sink that receives a checkpoint after each stage.
    pub fn with_timer(mut self, timer: SharedTimingSink) -> Self {
        self.timer = Some(timer);
        self
    }

    fn time_check(&self, stage: &str) {
        if let Some(timer) = &self.timer {
            let label = format!("layer {} {}", self.layer_index, stage);
            timer.borrow_mut().time_check(&label);
        }
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn filter_size(&self) -> usize {
        self.filter_size
    }

    pub fn pad_zeros(&self) -> bool {
        self.pad_zeros
    }

    pub fn biased(&self) -> bool {
        self.biased
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn upstream_planes(&self) -> usize {
        self.upstream_planes
    }

    pub fn upstream_board_size(&self) -> usize {
        self.upstream_board_size
    }

    /// Coordinate offset between output and upstream boards.
    pub fn margin(&self) -> usize {
        self.geometry().margin()
    }

    pub fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            batch_size: self.batch_size,
            upstream_planes: self.upstream_planes,
            upstream_board_size: self.upstream_board_size,
            planes: self.num_planes,
            filter_size: self.filter_size,
            pad_zeros: self.pad_zeros,
        }
    }

    pub fn weight_index(
        &self,
        out_plane: usize,
        upstream_plane: usize,
        filter_row: usize,
        filter_col: usize,
    ) -> usize {
        self.geometry()
            .weight_index(out_plane, upstream_plane, filter_row, filter_col)
    }

    pub fn weight(
        &self,
        out_plane: usize,
        upstream_plane: usize,
        filter_row: usize,
        filter_col: usize,
    ) -> f32 {
        self.weights[self.weight_index(out_plane, upstream_plane, filter_row, filter_col)]
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn bias_weights(&self) -> &[f32] {
        &self.bias_weights
    }

    pub fn set_weights(&mut self, weights: &[f32]) -> Result<()> {
        if weights.len() != self.weights.len() {
            return Err(error::shape(format!(
                "layer {}: {} weights given, {} expected",
                self.layer_index,
                weights.len(),
                self.weights.len()
            )));
        }
        self.weights.copy_from_slice(weights);
        Ok(())
    }

    pub fn set_bias_weights(&mut self, bias_weights: &[f32]) -> Result<()> {
        if bias_weights.len() != self.bias_weights.len() {
            return Err(error::shape(format!(
                "layer {}: {} bias weights given, {} expected",
                self.layer_index,
                bias_weights.len(),
                self.bias_weights.len()
            )));
        }
        self.bias_weights.copy_from_slice(bias_weights);
        Ok(())
    }

    /// Fan-in scaled random initialization, fan-in = `upstream_planes * filter_size²`.
    pub fn randomize_weights(&mut self, rng: &mut SimpleRng) {
        let fan_in = self.upstream_planes * self.filter_size * self.filter_size;
        for weight in self.weights.iter_mut() {
            *weight = rng.generate_weight(fan_in);
        }
        for bias in self.bias_weights.iter_mut() {
            *bias = rng.generate_weight(fan_in);
        }
    }

    /// `learning_rate / batch_size / sqrt(board_size²)`.
    ///
    /// An empty batch or board has no gradient to scale.
    fn learning_multiplier(&self, learning_rate: f32) -> Result<f32> {
        if self.batch_size == 0 || self.board_size == 0 {
            return Err(error::shape(format!(
                "layer {}: cannot learn from batch size {} with board size {}",
                self.layer_index, self.batch_size, self.board_size
            )));
        }
        let board_area = (self.board_size * self.board_size) as f32;
        Ok(learning_rate / self.batch_size as f32 / board_area.sqrt())
    }

    fn check_upstream(&self, upstream: &dyn Layer) -> Result<()> {
        let expected = self.geometry().upstream_results_size();
        if upstream.batch_size() != self.batch_size || upstream.results().len() != expected {
            return Err(error::shape(format!(
                "layer {}: upstream batch {} with {} results, expected batch {} with {}",
                self.layer_index,
                upstream.batch_size(),
                upstream.results().len(),
                self.batch_size,
                expected
            )));
        }
        Ok(())
    }

    fn check_errors(&self, errors: &[f32]) -> Result<()> {
        if errors.len() != self.results.len() {
            return Err(error::shape(format!(
                "layer {}: {} errors for {} results",
                self.layer_index,
                errors.len(),
                self.results.len()
            )));
        }
        Ok(())
    }

    /// Changes to add to every filter weight, computed on the accelerator.
    ///
    /// Each change is `-learning_multiplier * sum` where the sum runs over
    /// `(n, outRow, outCol)` of `upstream * activation'(result) * error`.
    pub fn weight_changes(
        &self,
        learning_rate: f32,
        errors: &[f32],
        upstream: &dyn Layer,
    ) -> Result<Vec<f32>> {
        self.check_upstream(upstream)?;
        self.check_errors(errors)?;
        let learning_multiplier = self.learning_multiplier(learning_rate)?;
        let mut weight_changes = vec![0.0; self.weights.len()];

        let accelerator = Rc::clone(&self.accelerator);
        let mut accel = accelerator.borrow_mut();
        let mut dispatch = Dispatch::new(&mut *accel, "backprop weights");
        let upstream_buffer = dispatch.input(upstream.results())?;
        let results_buffer = dispatch.input(&self.results)?;
        let errors_buffer = dispatch.input(errors)?;
        let changes_buffer = dispatch.output(weight_changes.len())?;

        let args = KernelArgs::new()
            .float(learning_multiplier)
            .int(self.batch_size)
            .int(self.upstream_planes)
            .int(self.num_planes)
            .int(self.upstream_board_size)
            .int(self.filter_size)
            .int(self.board_size)
            .flag(self.pad_zeros)
            .input(upstream_buffer)
            .input(results_buffer)
            .input(errors_buffer)
            .output(changes_buffer);
        dispatch.launch(self.kernel_backprop_weights, &args, weight_changes.len())?;
        dispatch.read(changes_buffer, &mut weight_changes)?;
        Ok(weight_changes)
    }

    /// Changes to add to the bias weights, accumulated on the host.
    ///
    /// Empty when the layer is unbiased.
    pub fn bias_weight_changes(&self, learning_rate: f32, errors: &[f32]) -> Result<Vec<f32>> {
        if !self.biased {
            return Ok(Vec::new());
        }
        self.check_errors(errors)?;
        let learning_multiplier = self.learning_multiplier(learning_rate)?;
        let geometry = self.geometry();

        let mut changes = vec![0.0f32; self.num_planes];
        for (out_plane, change) in changes.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for n in 0..self.batch_size {
                for out_row in 0..self.board_size {
                    for out_col in 0..self.board_size {
                        let index = geometry.result_index(n, out_plane, out_row, out_col);
                        let derivative = self.activation.calc_derivative(self.results[index]);
                        sum += errors[index] * derivative;
                    }
                }
            }
            *change = -learning_multiplier * sum;
        }
        Ok(changes)
    }

    /// Errors for the upstream layer: the output errors convolved with the
    /// spatially flipped filters, computed on the accelerator.
    pub fn calc_errors_for_upstream(&self, errors: &[f32]) -> Result<Vec<f32>> {
        self.check_errors(errors)?;
        let mut upstream_errors = vec![0.0; self.geometry().upstream_results_size()];

        let accelerator = Rc::clone(&self.accelerator);
        let mut accel = accelerator.borrow_mut();
        let mut dispatch = Dispatch::new(&mut *accel, "backprop errors");
        let weights_buffer = dispatch.input(&self.weights)?;
        self.time_check("errors for upstream, copied weights to device");
        let errors_buffer = dispatch.input(errors)?;
        self.time_check("errors for upstream, copied errors to device");
        let upstream_errors_buffer = dispatch.output(upstream_errors.len())?;

        let args = KernelArgs::new()
            .int(self.batch_size)
            .int(self.upstream_planes)
            .int(self.upstream_board_size)
            .int(self.filter_size)
            .int(self.num_planes)
            .int(self.board_size)
            .flag(self.pad_zeros)
            .input(weights_buffer)
            .input(errors_buffer)
            .output(upstream_errors_buffer);
        dispatch.launch(self.kernel_backprop_errors, &args, upstream_errors.len())?;
        dispatch.finish()?;
        self.time_check("errors for upstream, finished kernel");
        dispatch.read(upstream_errors_buffer, &mut upstream_errors)?;
        self.time_check("errors for upstream, copied results to host");
        Ok(upstream_errors)
    }
}

impl Layer for ConvolutionalLayer {
    fn name(&self) -> &'static str {
        "convolutional"
    }

    fn num_planes(&self) -> usize {
        self.num_planes
    }

    fn board_size(&self) -> usize {
        self.board_size
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
        self.results = vec![0.0; self.results_size()];
    }

    fn results(&self) -> &[f32] {
        &self.results
    }

    fn need_errors_backprop(&self) -> bool {
        true
    }

    fn propagate(&mut self, upstream: &dyn Layer) -> Result<()> {
        self.check_upstream(upstream)?;
        self.time_check("propagate, START");

        let accelerator = Rc::clone(&self.accelerator);
        let mut accel = accelerator.borrow_mut();
        let mut dispatch = Dispatch::new(&mut *accel, "propagate");
        let upstream_buffer = dispatch.input(upstream.results())?;
        let weights_buffer = dispatch.input(&self.weights)?;
        let bias_buffer = if self.biased {
            Some(dispatch.input(&self.bias_weights)?)
        } else {
            None
        };
        self.time_check("propagate, copied to device");
        let results_buffer = dispatch.output(self.results.len())?;

        let mut args = KernelArgs::new()
            .int(self.batch_size)
            .int(self.upstream_planes)
            .int(self.num_planes)
            .int(self.upstream_board_size)
            .int(self.filter_size)
            .flag(self.pad_zeros)
            .input(upstream_buffer)
            .input(weights_buffer);
        if let Some(bias_buffer) = bias_buffer {
            args = args.input(bias_buffer);
        }
        let args = args.output(results_buffer);

        dispatch.launch(self.kernel_convolve, &args, self.results.len())?;
        self.time_check("propagate, after kernel enqueue");
        dispatch.read(results_buffer, &mut self.results)?;
        self.time_check("propagate, after copy to host");
        Ok(())
    }

    fn back_prop_errors(
        &mut self,
        learning_rate: f32,
        errors: &[f32],
        upstream: &dyn Layer,
    ) -> Result<Option<Vec<f32>>> {
        self.time_check("backprop, START");
        let weight_changes = self.weight_changes(learning_rate, errors, upstream)?;
        self.time_check("backprop, done weights");
        let bias_weight_changes = self.bias_weight_changes(learning_rate, errors)?;
        self.time_check("backprop, done bias weights");

        // upstream errors use the weights from the forward pass, so update after
        let upstream_errors = if upstream.need_errors_backprop() {
            let upstream_errors = self.calc_errors_for_upstream(errors)?;
            self.time_check("backprop, calced errors for upstream");
            Some(upstream_errors)
        } else {
            None
        };

        for (weight, change) in self.weights.iter_mut().zip(&weight_changes) {
            *weight += change;
        }
        for (bias, change) in self.bias_weights.iter_mut().zip(&bias_weight_changes) {
            *bias += change;
        }
        Ok(upstream_errors)
    }

    fn weights_size(&self) -> usize {
        self.weights.len()
    }

    fn bias_weights_size(&self) -> usize {
        self.bias_weights.len()
    }
}

impl fmt::Display for ConvolutionalLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConvolutionalLayer numFilters {} filterSize {} padZeros {} biased {} activation {} outputBoardSize {}",
            self.num_planes,
            self.filter_size,
            self.pad_zeros,
            self.biased,
            self.activation,
            self.board_size
        )
    }
}
