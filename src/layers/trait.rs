//! Layer trait definition
//!
//! This is the contract a layer exposes to its neighbors in a stack. A layer
//! reads its upstream neighbor's results during the forward pass and hands
//! errors back to it during the backward pass.

use crate::error::{self, Result};
use crate::layout;

/// Core trait for layers in a convolutional network.
///
/// Every layer owns a feature-map batch (`results`) laid out as
/// `[n][plane][row][col]`, sized `batch_size * num_planes * board_size²`.
pub trait Layer {
    fn name(&self) -> &'static str;

    fn num_planes(&self) -> usize;

    fn board_size(&self) -> usize;

    fn batch_size(&self) -> usize;

    /// Reallocates the results buffer for a new batch size.
    ///
    /// Results from a previous batch are discarded, never reused.
    fn set_batch_size(&mut self, batch_size: usize);

    /// This layer's output batch.
    fn results(&self) -> &[f32];

    fn results_size(&self) -> usize {
        let board_size = self.board_size();
        self.batch_size() * self.num_planes() * board_size * board_size
    }

    fn result_index(&self, n: usize, plane: usize, row: usize, col: usize) -> usize {
        layout::result_index(self.num_planes(), self.board_size(), n, plane, row, col)
    }

    fn result(&self, n: usize, plane: usize, row: usize, col: usize) -> f32 {
        self.results()[self.result_index(n, plane, row, col)]
    }

    /// Whether this layer wants errors computed for it during backprop.
    ///
    /// A layer answering `false` ends the backward pass: nothing upstream of it
    /// is visited and its downstream neighbor skips the upstream-error work.
    fn need_errors_backprop(&self) -> bool;

    /// Forward pass: reads `upstream.results()`, overwrites `self.results()`.
    fn propagate(&mut self, upstream: &dyn Layer) -> Result<()>;

    /// Backward pass for this layer.
    ///
    /// `errors` has the shape of `self.results()`. Updates this layer's weights
    /// and returns the errors for `upstream`, or `None` when `upstream` does not
    /// need them.
    fn back_prop_errors(
        &mut self,
        learning_rate: f32,
        errors: &[f32],
        upstream: &dyn Layer,
    ) -> Result<Option<Vec<f32>>>;

    /// Backward pass from target values: `errors = results - expected`.
    fn back_prop_expected(
        &mut self,
        learning_rate: f32,
        expected: &[f32],
        upstream: &dyn Layer,
    ) -> Result<Option<Vec<f32>>> {
        let errors = output_errors(self.results(), expected)?;
        self.back_prop_errors(learning_rate, &errors, upstream)
    }

    fn weights_size(&self) -> usize {
        0
    }

    fn bias_weights_size(&self) -> usize {
        0
    }
}

/// Elementwise `results - expected`.
pub fn output_errors(results: &[f32], expected: &[f32]) -> Result<Vec<f32>> {
    if results.len() != expected.len() {
        return Err(error::shape(format!(
            "expected values have {} elements, results have {}",
            expected.len(),
            results.len()
        )));
    }
    Ok(results
        .iter()
        .zip(expected)
        .map(|(result, expected)| result - expected)
        .collect())
}
