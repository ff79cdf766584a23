//! One-call-scoped kernel dispatch.
//!
//! A [`Dispatch`] owns every buffer it wraps and releases all of them when it
//! goes out of scope, whether the launch succeeded or not. Buffers never
//! outlive the layer operation that created them.

use tracing::{debug, trace};

use super::{Accelerator, BufferId, KernelArgs, KernelId};
use crate::error::Result;

/// Smallest multiple of `workgroup_size` that is at least `element_count`.
pub fn launch_size(element_count: usize, workgroup_size: usize) -> usize {
    let workgroup_size = workgroup_size.max(1);
    ((element_count + workgroup_size - 1) / workgroup_size) * workgroup_size
}

pub struct Dispatch<'a> {
    accelerator: &'a mut dyn Accelerator,
    label: &'static str,
    buffers: Vec<BufferId>,
}

impl<'a> Dispatch<'a> {
    pub fn new(accelerator: &'a mut dyn Accelerator, label: &'static str) -> Self {
        Self {
            accelerator,
            label,
            buffers: Vec::new(),
        }
    }

    fn wrap(&mut self, len: usize) -> Result<BufferId> {
        let buffer = self.accelerator.create_buffer(len)?;
        self.buffers.push(buffer);
        trace!(label = self.label, ?buffer, len, "wrapped buffer");
        Ok(buffer)
    }

    /// Wraps `host` as a device buffer and copies it to the device.
    pub fn input(&mut self, host: &[f32]) -> Result<BufferId> {
        let buffer = self.wrap(host.len())?;
        self.accelerator.write_buffer(buffer, host)?;
        Ok(buffer)
    }

    /// Wraps a device buffer of `len` floats that a kernel will write.
    pub fn output(&mut self, len: usize) -> Result<BufferId> {
        self.wrap(len)
    }

    /// Launches `kernel` over `element_count` work items, rounded up to the
    /// accelerator's work-group size. Returns the global size used.
    pub fn launch(
        &mut self,
        kernel: KernelId,
        args: &KernelArgs,
        element_count: usize,
    ) -> Result<usize> {
        let workgroup_size = self.accelerator.max_workgroup_size();
        let global_size = launch_size(element_count, workgroup_size);
        debug!(
            label = self.label,
            accelerator = self.accelerator.name(),
            element_count,
            global_size,
            workgroup_size,
            "launching kernel"
        );
        self.accelerator
            .launch_1d(kernel, args, global_size, workgroup_size)?;
        Ok(global_size)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.accelerator.finish()
    }

    /// Copies a device buffer back into `host`.
    pub fn read(&mut self, buffer: BufferId, host: &mut [f32]) -> Result<()> {
        self.accelerator.read_buffer(buffer, host)
    }
}

impl Drop for Dispatch<'_> {
    fn drop(&mut self) {
        for buffer in self.buffers.drain(..) {
            self.accelerator.release_buffer(buffer);
        }
        trace!(label = self.label, "released buffers");
    }
}
