//! Shared utilities: activation functions, deterministic RNG and timing sinks.

pub mod activations;
pub mod rng;
pub mod timer;

pub use activations::Activation;
pub use rng::SimpleRng;
pub use timer::{SharedTimingSink, StatefulTimer, TimingSink};
