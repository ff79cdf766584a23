//! Input layer: holds the batch fed into a network.

use crate::error::{self, Result};
use crate::layers::Layer;

/// First layer of every network. It has no weights and never wants errors.
pub struct InputLayer {
    num_planes: usize,
    board_size: usize,
    batch_size: usize,
    results: Vec<f32>,
}

impl InputLayer {
    pub fn new(num_planes: usize, board_size: usize) -> Self {
        Self {
            num_planes,
            board_size,
            batch_size: 0,
            results: Vec::new(),
        }
    }

    /// Copies one batch of input into the layer.
    pub fn set_input(&mut self, input: &[f32]) -> Result<()> {
        if input.len() != self.results.len() {
            return Err(error::shape(format!(
                "input has {} elements, batch of {} needs {}",
                input.len(),
                self.batch_size,
                self.results.len()
            )));
        }
        self.results.copy_from_slice(input);
        Ok(())
    }
}

impl Layer for InputLayer {
    fn name(&self) -> &'static str {
        "input"
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
        false
    }

    fn propagate(&mut self, _upstream: &dyn Layer) -> Result<()> {
        Ok(())
    }

    fn back_prop_errors(
        &mut self,
        _learning_rate: f32,
        _errors: &[f32],
        _upstream: &dyn Layer,
    ) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }
}
