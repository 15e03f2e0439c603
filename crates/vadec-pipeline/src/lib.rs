#![doc = include_str!("../README.md")]

pub mod accelerator;
pub mod config;
mod decode_thread;
mod messages;
pub mod metrics;
mod picture;
pub mod state;
mod surface_pool;
pub mod synthetic;

pub use accelerator::{Collaborators, EngineFactory, VaapiVideoDecodeAccelerator};
pub use config::AcceleratorConfig;
pub use metrics::{DecoderMetrics, MetricsSnapshot};
pub use state::State;
