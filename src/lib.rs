//! Rust Convolutional Layers Library
//!
//! This library provides the training engine for stacks of 2D convolutional
//! layers whose math runs as kernels on a pluggable accelerator.
//!
//! # Modules
//!
//! - `layers`: Layer trait and implementations (Input, Convolutional)
//! - `network`: Ordered layer stack with forward and backward passes
//! - `accel`: Accelerator trait, kernel dispatch, CPU and OpenCL backends
//! - `layout`: Index arithmetic for feature maps and filter weights
//! - `config`: Layer and network configuration structures
//! - `utils`: Shared utilities (RNG, activation functions, timing)
//! - `error`: Crate-wide error type

pub mod accel;
pub mod config;
pub mod error;
pub mod layers;
pub mod layout;
pub mod network;
pub mod utils;

pub use error::{Error, Result};
