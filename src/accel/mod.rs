//! Accelerator runtime abstraction
//!
//! Layers never talk to a device API directly. They build the three math
//! kernels once, then for every call wrap host arrays as device buffers, bind
//! arguments (scalars first, then buffers, inputs before outputs) and launch
//! over a 1-D index space. [`Dispatch`] packages that sequence.
//!
//! Backends:
//! - [`CpuAccelerator`]: reference backend, runs each kernel once per work item on the host
//! - `OpenClAccelerator` (feature `opencl`): compiles the bundled OpenCL C source

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::utils::Activation;

pub use cpu::CpuAccelerator;
pub use dispatch::{launch_size, Dispatch};
#[cfg(feature = "opencl")]
pub use opencl::OpenClAccelerator;

/// OpenCL C source of the three convolution kernels.
pub const KERNEL_SOURCE: &str = include_str!("kernels.cl");

/// Handle to a kernel built by an [`Accelerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub usize);

/// Handle to a device buffer owned by an [`Accelerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub usize);

/// The three kernels a convolutional layer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// One work item per output element.
    Convolve,
    /// One work item per filter weight.
    BackpropWeights,
    /// One work item per upstream element.
    BackpropErrors,
}

impl KernelKind {
    /// Entry point name in [`KERNEL_SOURCE`].
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelKind::Convolve => "convolve_imagecubes",
            KernelKind::BackpropWeights => "backprop_weights",
            KernelKind::BackpropErrors => "calc_errors_for_upstream",
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Compile-time options of a kernel build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelOptions {
    pub activation: Activation,
    pub biased: bool,
}

impl KernelOptions {
    /// Compiler options string, e.g. `-D RELU -D BIASED`.
    pub fn compiler_options(&self) -> String {
        let mut options = format!("-D {}", self.activation.define_name());
        if self.biased {
            options.push_str(" -D BIASED");
        }
        options
    }
}

/// One bound kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// Bound as a 32-bit device int; values above `i32::MAX` fail when read.
    Int(usize),
    Float(f32),
    Input(BufferId),
    Output(BufferId),
}

/// Ordered kernel arguments, built by chaining.
///
/// ```
/// use rust_conv_layers::accel::{BufferId, KernelArgs};
///
/// let args = KernelArgs::new().int(3).flag(true).input(BufferId(0)).output(BufferId(1));
/// assert_eq!(args.len(), 4);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(mut self, value: usize) -> Self {
        self.args.push(KernelArg::Int(value));
        self
    }

    pub fn flag(self, value: bool) -> Self {
        self.int(usize::from(value))
    }

    pub fn float(mut self, value: f32) -> Self {
        self.args.push(KernelArg::Float(value));
        self
    }

    pub fn input(mut self, buffer: BufferId) -> Self {
        self.args.push(KernelArg::Input(buffer));
        self
    }

    pub fn output(mut self, buffer: BufferId) -> Self {
        self.args.push(KernelArg::Output(buffer));
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn as_slice(&self) -> &[KernelArg] {
        &self.args
    }

    /// Sequential reader used by backends to unpack arguments in binding order.
    pub fn reader(&self, kind: KernelKind) -> ArgReader<'_> {
        ArgReader {
            kind,
            args: &self.args,
            pos: 0,
        }
    }
}

/// Converts an int argument to the device's 32-bit int.
pub fn device_int(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        Error::KernelArgs(format!("int argument {} does not fit a device int", value))
    })
}

/// Cursor over [`KernelArgs`] that checks each argument's kind.
pub struct ArgReader<'a> {
    kind: KernelKind,
    args: &'a [KernelArg],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    fn next(&mut self, expected: &str) -> Result<KernelArg> {
        let arg = self.args.get(self.pos).copied().ok_or_else(|| {
            Error::KernelArgs(format!(
                "{}: missing argument {} (expected {})",
                self.kind, self.pos, expected
            ))
        })?;
        self.pos += 1;
        Ok(arg)
    }

    fn mismatch(&self, expected: &str, got: KernelArg) -> Error {
        Error::KernelArgs(format!(
            "{}: argument {} should be {}, got {:?}",
            self.kind,
            self.pos - 1,
            expected,
            got
        ))
    }

    pub fn int(&mut self) -> Result<usize> {
        match self.next("int")? {
            KernelArg::Int(v) => device_int(v).map(|_| v),
            other => Err(self.mismatch("int", other)),
        }
    }

    pub fn flag(&mut self) -> Result<bool> {
        Ok(self.int()? != 0)
    }

    pub fn float(&mut self) -> Result<f32> {
        match self.next("float")? {
            KernelArg::Float(v) => Ok(v),
            other => Err(self.mismatch("float", other)),
        }
    }

    pub fn input(&mut self) -> Result<BufferId> {
        match self.next("input buffer")? {
            KernelArg::Input(id) => Ok(id),
            other => Err(self.mismatch("input buffer", other)),
        }
    }

    pub fn output(&mut self) -> Result<BufferId> {
        match self.next("output buffer")? {
            KernelArg::Output(id) => Ok(id),
            other => Err(self.mismatch("output buffer", other)),
        }
    }

    /// Fails if arguments remain unread.
    pub fn finish(self) -> Result<()> {
        if self.pos == self.args.len() {
            Ok(())
        } else {
            Err(Error::KernelArgs(format!(
                "{}: {} arguments bound, {} expected",
                self.kind,
                self.args.len(),
                self.pos
            )))
        }
    }
}

/// An accelerator runtime: kernel builds, device buffers and 1-D launches.
///
/// Every call is blocking from the host's point of view except `launch_1d`,
/// which may return before the device completes; reads and [`finish`](Self::finish)
/// wait for it.
pub trait Accelerator {
    fn name(&self) -> &str;

    /// Preferred work-group size; launch sizes are rounded up to a multiple of it.
    fn max_workgroup_size(&self) -> usize;

    fn build_kernel(&mut self, kind: KernelKind, options: &KernelOptions) -> Result<KernelId>;

    /// Allocates a zeroed device buffer of `len` floats.
    fn create_buffer(&mut self, len: usize) -> Result<BufferId>;

    /// Host to device copy.
    fn write_buffer(&mut self, buffer: BufferId, data: &[f32]) -> Result<()>;

    /// Device to host copy.
    fn read_buffer(&mut self, buffer: BufferId, data: &mut [f32]) -> Result<()>;

    fn release_buffer(&mut self, buffer: BufferId);

    fn launch_1d(
        &mut self,
        kernel: KernelId,
        args: &KernelArgs,
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<()>;

    /// Device-wide completion barrier.
    fn finish(&mut self) -> Result<()>;
}

/// Accelerator shared by every layer of a network. Not owned by any one layer.
pub type SharedAccelerator = Rc<RefCell<dyn Accelerator>>;

/// Wraps a concrete accelerator for sharing between layers.
pub fn shared<A: Accelerator + 'static>(accelerator: A) -> SharedAccelerator {
    Rc::new(RefCell::new(accelerator))
}
