//! Error type shared by every part of the engine.
//!
//! Nothing in the engine recovers from these locally. Accelerator failures in
//! particular are terminal for the training run: callers propagate them with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid layer or network configuration (e.g. an even filter size).
    #[error("config error: {0}")]
    Config(String),

    /// Kernel build, buffer allocation, launch or readback failed.
    #[error("device error: {0}")]
    Device(String),

    /// Batch or buffer sizes disagree across a layer boundary.
    #[error("shape error: {0}")]
    Shape(String),

    /// Arguments bound to a kernel do not match its signature.
    #[error("kernel argument error: {0}")]
    KernelArgs(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub fn config(msg: impl Into<String>) -> Error {
    Error::Config(msg.into())
}

pub fn device(msg: impl Into<String>) -> Error {
    Error::Device(msg.into())
}

pub fn shape(msg: impl Into<String>) -> Error {
    Error::Shape(msg.into())
}
