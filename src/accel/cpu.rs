//! Host reference backend.
//!
//! Executes each kernel once per work item in `0..global_size`, in index
//! order. Work items past the logical element count do nothing, exactly as the
//! device kernels guard against the padded tail of a rounded-up launch.

use std::collections::HashMap;

use tracing::debug;

use super::{Accelerator, BufferId, KernelArgs, KernelId, KernelKind, KernelOptions};
use crate::error::{self, Result};
use crate::layout::ConvGeometry;
use crate::utils::Activation;

const DEFAULT_WORKGROUP_SIZE: usize = 64;

#[derive(Debug, Clone, Copy)]
struct CpuKernel {
    kind: KernelKind,
    options: KernelOptions,
}

/// Reference accelerator running the kernels on the calling thread.
pub struct CpuAccelerator {
    workgroup_size: usize,
    kernels: Vec<CpuKernel>,
    buffers: HashMap<usize, Vec<f32>>,
    next_buffer: usize,
}

impl CpuAccelerator {
    pub fn new() -> Self {
        Self::with_workgroup_size(DEFAULT_WORKGROUP_SIZE)
    }

    pub fn with_workgroup_size(workgroup_size: usize) -> Self {
        Self {
            workgroup_size: workgroup_size.max(1),
            kernels: Vec::new(),
            buffers: HashMap::new(),
            next_buffer: 0,
        }
    }

    /// Number of buffers created and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, id: BufferId) -> Result<&[f32]> {
        self.buffers
            .get(&id.0)
            .map(Vec::as_slice)
            .ok_or_else(|| error::device(format!("unknown buffer {:?}", id)))
    }

    fn take_buffer(&mut self, id: BufferId) -> Result<Vec<f32>> {
        self.buffers
            .remove(&id.0)
            .ok_or_else(|| error::device(format!("unknown buffer {:?}", id)))
    }

    fn run_convolve(
        &mut self,
        options: KernelOptions,
        args: &KernelArgs,
        global_size: usize,
    ) -> Result<()> {
        let mut reader = args.reader(KernelKind::Convolve);
        let geometry = ConvGeometry {
            batch_size: reader.int()?,
            upstream_planes: reader.int()?,
            planes: reader.int()?,
            upstream_board_size: reader.int()?,
            filter_size: reader.int()?,
            pad_zeros: reader.flag()?,
        };
        let upstream_id = reader.input()?;
        let weights_id = reader.input()?;
        let bias_id = if options.biased {
            Some(reader.input()?)
        } else {
            None
        };
        let results_id = reader.output()?;
        reader.finish()?;

        let mut results = self.take_buffer(results_id)?;
        let outcome = (|| -> Result<()> {
            let upstream = self.buffer(upstream_id)?;
            let weights = self.buffer(weights_id)?;
            let bias = bias_id.map(|id| self.buffer(id)).transpose()?;
            let count = geometry.results_size().min(results.len());
            for (id, out) in results.iter_mut().enumerate().take(global_size.min(count)) {
                *out = convolve_item(&geometry, options.activation, upstream, weights, bias, id);
            }
            Ok(())
        })();
        self.buffers.insert(results_id.0, results);
        outcome
    }

    fn run_backprop_weights(
        &mut self,
        options: KernelOptions,
        args: &KernelArgs,
        global_size: usize,
    ) -> Result<()> {
        let mut reader = args.reader(KernelKind::BackpropWeights);
        let learning_multiplier = reader.float()?;
        let batch_size = reader.int()?;
        let upstream_planes = reader.int()?;
        let planes = reader.int()?;
        let upstream_board_size = reader.int()?;
        let filter_size = reader.int()?;
        let board_size = reader.int()?;
        let geometry = ConvGeometry {
            batch_size,
            upstream_planes,
            upstream_board_size,
            planes,
            filter_size,
            pad_zeros: reader.flag()?,
        };
        if board_size != geometry.board_size() {
            return Err(error::shape(format!(
                "{}: board size {} does not match geometry {}",
                KernelKind::BackpropWeights,
                board_size,
                geometry.board_size()
            )));
        }
        let upstream_id = reader.input()?;
        let results_id = reader.input()?;
        let errors_id = reader.input()?;
        let changes_id = reader.output()?;
        reader.finish()?;

        let mut changes = self.take_buffer(changes_id)?;
        let outcome = (|| -> Result<()> {
            let upstream = self.buffer(upstream_id)?;
            let results = self.buffer(results_id)?;
            let errors = self.buffer(errors_id)?;
            let count = geometry.weights_size().min(changes.len());
            for (id, out) in changes.iter_mut().enumerate().take(global_size.min(count)) {
                let sum = weight_gradient_item(
                    &geometry,
                    options.activation,
                    upstream,
                    results,
                    errors,
                    id,
                );
                *out = -learning_multiplier * sum;
            }
            Ok(())
        })();
        self.buffers.insert(changes_id.0, changes);
        outcome
    }

    fn run_backprop_errors(&mut self, args: &KernelArgs, global_size: usize) -> Result<()> {
        let mut reader = args.reader(KernelKind::BackpropErrors);
        let batch_size = reader.int()?;
        let upstream_planes = reader.int()?;
        let upstream_board_size = reader.int()?;
        let filter_size = reader.int()?;
        let planes = reader.int()?;
        let board_size = reader.int()?;
        let geometry = ConvGeometry {
            batch_size,
            upstream_planes,
            upstream_board_size,
            planes,
            filter_size,
            pad_zeros: reader.flag()?,
        };
        if board_size != geometry.board_size() {
            return Err(error::shape(format!(
                "{}: board size {} does not match geometry {}",
                KernelKind::BackpropErrors,
                board_size,
                geometry.board_size()
            )));
        }
        let weights_id = reader.input()?;
        let errors_id = reader.input()?;
        let upstream_errors_id = reader.output()?;
        reader.finish()?;

        let mut upstream_errors = self.take_buffer(upstream_errors_id)?;
        let outcome = (|| -> Result<()> {
            let weights = self.buffer(weights_id)?;
            let errors = self.buffer(errors_id)?;
            let count = geometry.upstream_results_size().min(upstream_errors.len());
            for (id, out) in upstream_errors
                .iter_mut()
                .enumerate()
                .take(global_size.min(count))
            {
                *out = upstream_error_item(&geometry, weights, errors, id);
            }
            Ok(())
        })();
        self.buffers.insert(upstream_errors_id.0, upstream_errors);
        outcome
    }
}

impl Default for CpuAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator for CpuAccelerator {
    fn name(&self) -> &str {
        "cpu"
    }

    fn max_workgroup_size(&self) -> usize {
        self.workgroup_size
    }

    fn build_kernel(&mut self, kind: KernelKind, options: &KernelOptions) -> Result<KernelId> {
        debug!(%kind, options = %options.compiler_options(), "building cpu kernel");
        self.kernels.push(CpuKernel {
            kind,
            options: *options,
        });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn create_buffer(&mut self, len: usize) -> Result<BufferId> {
        let id = self.next_buffer;
        self.next_buffer += 1;
        self.buffers.insert(id, vec![0.0; len]);
        Ok(BufferId(id))
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[f32]) -> Result<()> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| error::device(format!("unknown buffer {:?}", buffer)))?;
        if target.len() != data.len() {
            return Err(error::device(format!(
                "write of {} floats into buffer of {}",
                data.len(),
                target.len()
            )));
        }
        target.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, data: &mut [f32]) -> Result<()> {
        let source = self.buffer(buffer)?;
        if source.len() != data.len() {
            return Err(error::device(format!(
                "read of {} floats from buffer of {}",
                data.len(),
                source.len()
            )));
        }
        data.copy_from_slice(source);
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn launch_1d(
        &mut self,
        kernel: KernelId,
        args: &KernelArgs,
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<()> {
        let CpuKernel { kind, options } = *self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| error::device(format!("unknown kernel {:?}", kernel)))?;
        if workgroup_size == 0 || global_size % workgroup_size != 0 {
            return Err(error::device(format!(
                "global size {} is not a multiple of work-group size {}",
                global_size, workgroup_size
            )));
        }
        match kind {
            KernelKind::Convolve => self.run_convolve(options, args, global_size),
            KernelKind::BackpropWeights => self.run_backprop_weights(options, args, global_size),
            KernelKind::BackpropErrors => self.run_backprop_errors(args, global_size),
        }
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Activated output element `id` of the forward convolution.
pub fn convolve_item(
    geometry: &ConvGeometry,
    activation: Activation,
    upstream: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    id: usize,
) -> f32 {
    let board_size = geometry.board_size();
    let (n, out_plane, out_row, out_col) =
        ConvGeometry::split_result_index(geometry.planes, board_size, id);
    let margin = geometry.margin() as isize;
    let upstream_board_size = geometry.upstream_board_size as isize;

    let mut sum = 0.0f32;
    for upstream_plane in 0..geometry.upstream_planes {
        for filter_row in 0..geometry.filter_size {
            let in_row = out_row as isize + filter_row as isize - margin;
            if in_row < 0 || in_row >= upstream_board_size {
                continue;
            }
            for filter_col in 0..geometry.filter_size {
                let in_col = out_col as isize + filter_col as isize - margin;
                if in_col < 0 || in_col >= upstream_board_size {
                    continue;
                }
                let w = weights[geometry.weight_index(out_plane, upstream_plane, filter_row, filter_col)];
                let x = upstream[geometry.upstream_index(
                    n,
                    upstream_plane,
                    in_row as usize,
                    in_col as usize,
                )];
                sum += w * x;
            }
        }
    }
    if let Some(bias) = bias {
        sum += bias[out_plane];
    }
    activation.calc(sum)
}

/// Unscaled gradient sum for weight `id`, accumulated over `(outRow, outCol, n)`.
pub fn weight_gradient_item(
    geometry: &ConvGeometry,
    activation: Activation,
    upstream: &[f32],
    results: &[f32],
    errors: &[f32],
    id: usize,
) -> f32 {
    let board_size = geometry.board_size();
    let (out_plane, upstream_plane, filter_row, filter_col) = geometry.split_weight_index(id);
    let margin = geometry.margin() as isize;
    let upstream_board_size = geometry.upstream_board_size as isize;

    let mut sum = 0.0f32;
    for out_row in 0..board_size {
        let upstream_row = out_row as isize - margin + filter_row as isize;
        if upstream_row < 0 || upstream_row >= upstream_board_size {
            continue;
        }
        for out_col in 0..board_size {
            let upstream_col = out_col as isize - margin + filter_col as isize;
            if upstream_col < 0 || upstream_col >= upstream_board_size {
                continue;
            }
            for n in 0..geometry.batch_size {
                let result_index = geometry.result_index(n, out_plane, out_row, out_col);
                let derivative = activation.calc_derivative(results[result_index]);
                let x = upstream[geometry.upstream_index(
                    n,
                    upstream_plane,
                    upstream_row as usize,
                    upstream_col as usize,
                )];
                sum += x * derivative * errors[result_index];
            }
        }
    }
    sum
}

/// Error for upstream element `id`: the output errors convolved with the flipped filters.
pub fn upstream_error_item(
    geometry: &ConvGeometry,
    weights: &[f32],
    errors: &[f32],
    id: usize,
) -> f32 {
    let board_size = geometry.board_size() as isize;
    let (n, upstream_plane, upstream_row, upstream_col) = ConvGeometry::split_result_index(
        geometry.upstream_planes,
        geometry.upstream_board_size,
        id,
    );
    let margin = geometry.margin() as isize;
    let filter_size = geometry.filter_size as isize;

    // filterRow = upstreamRow + margin - outRow must lie in [0, filterSize)
    let row_base = upstream_row as isize + margin;
    let col_base = upstream_col as isize + margin;
    let min_out_row = (row_base - filter_size + 1).max(0);
    let max_out_row = row_base.min(board_size - 1);
    let min_out_col = (col_base - filter_size + 1).max(0);
    let max_out_col = col_base.min(board_size - 1);

    let mut sum = 0.0f32;
    for out_plane in 0..geometry.planes {
        for out_row in min_out_row..=max_out_row {
            let filter_row = (row_base - out_row) as usize;
            for out_col in min_out_col..=max_out_col {
                let filter_col = (col_base - out_col) as usize;
                let w = weights[geometry.weight_index(out_plane, upstream_plane, filter_row, filter_col)];
                let e = errors[geometry.result_index(n, out_plane, out_row as usize, out_col as usize)];
                sum += w * e;
            }
        }
    }
    sum
}
