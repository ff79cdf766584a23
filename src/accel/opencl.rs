//! OpenCL backend built on the `ocl` crate.

use std::collections::HashMap;

use ocl::{flags, Buffer, Context, Device, Kernel, Platform, Program, Queue};
use tracing::debug;

use super::{
    device_int, Accelerator, BufferId, KernelArg, KernelArgs, KernelId, KernelKind, KernelOptions,
    KERNEL_SOURCE,
};
use crate::error::{self, Error, Result};

fn cl_error(err: ocl::Error) -> Error {
    error::device(err.to_string())
}

struct ClKernel {
    kind: KernelKind,
    program: Program,
}

/// Accelerator backed by the first device of the default OpenCL platform.
pub struct OpenClAccelerator {
    context: Context,
    device: Device,
    queue: Queue,
    max_workgroup_size: usize,
    kernels: Vec<ClKernel>,
    buffers: HashMap<usize, Buffer<f32>>,
    next_buffer: usize,
}

impl OpenClAccelerator {
    pub fn new() -> Result<Self> {
        let platform = Platform::default();
        let device = Device::first(platform).map_err(cl_error)?;
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(cl_error)?;
        let queue = Queue::new(&context, device, None).map_err(cl_error)?;
        let max_workgroup_size = device.max_wg_size().map_err(cl_error)?;
        debug!(
            device = %device.name().unwrap_or_default(),
            max_workgroup_size,
            "opened OpenCL device"
        );
        Ok(Self {
            context,
            device,
            queue,
            max_workgroup_size,
            kernels: Vec::new(),
            buffers: HashMap::new(),
            next_buffer: 0,
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&Buffer<f32>> {
        self.buffers
            .get(&id.0)
            .ok_or_else(|| error::device(format!("unknown buffer {:?}", id)))
    }
}

impl Accelerator for OpenClAccelerator {
    fn name(&self) -> &str {
        "opencl"
    }

    fn max_workgroup_size(&self) -> usize {
        self.max_workgroup_size
    }

    fn build_kernel(&mut self, kind: KernelKind, options: &KernelOptions) -> Result<KernelId> {
        debug!(%kind, options = %options.compiler_options(), "building OpenCL kernel");
        let mut builder = Program::builder();
        builder
            .src(KERNEL_SOURCE)
            .devices(self.device)
            .cmplr_def(options.activation.define_name(), 1);
        if options.biased {
            builder.cmplr_def("BIASED", 1);
        }
        let program = builder.build(&self.context).map_err(cl_error)?;
        self.kernels.push(ClKernel { kind, program });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn create_buffer(&mut self, len: usize) -> Result<BufferId> {
        let buffer = Buffer::<f32>::builder()
            .queue(self.queue.clone())
            .flags(flags::MEM_READ_WRITE)
            .len(len.max(1))
            .fill_val(0.0f32)
            .build()
            .map_err(cl_error)?;
        let id = self.next_buffer;
        self.next_buffer += 1;
        self.buffers.insert(id, buffer);
        Ok(BufferId(id))
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[f32]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.buffer(buffer)?.write(data).enq().map_err(cl_error)
    }

    fn read_buffer(&mut self, buffer: BufferId, data: &mut [f32]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.buffer(buffer)?.read(data).enq().map_err(cl_error)
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
        if global_size == 0 {
            return Ok(());
        }
        let ClKernel { kind, program } = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| error::device(format!("unknown kernel {:?}", kernel)))?;

        let mut builder = Kernel::builder();
        builder
            .program(program)
            .name(kind.entry_point())
            .queue(self.queue.clone())
            .global_work_size(global_size)
            .local_work_size(workgroup_size);
        for arg in args.as_slice() {
            match *arg {
                KernelArg::Int(value) => {
                    builder.arg(device_int(value)?);
                }
                KernelArg::Float(value) => {
                    builder.arg(value);
                }
                KernelArg::Input(id) | KernelArg::Output(id) => {
                    builder.arg(self.buffer(id)?);
                }
            }
        }
        let kernel = builder.build().map_err(cl_error)?;
        // Arguments were bound in declaration order against the kernel's own source.
        unsafe { kernel.enq().map_err(cl_error) }
    }

    fn finish(&mut self) -> Result<()> {
        self.queue.finish().map_err(cl_error)
    }
}
