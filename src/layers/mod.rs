//! Layer abstractions for convolutional networks
//!
//! This module provides the Layer trait, the input layer that feeds a network,
//! and the accelerator-backed convolutional layer.

mod r#trait;
pub mod convolutional;
pub mod input;

// Re-export the Layer trait for convenience
pub use convolutional::ConvolutionalLayer;
pub use input::InputLayer;
pub use r#trait::{output_errors, Layer};
