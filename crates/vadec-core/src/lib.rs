#![doc = include_str!("../README.md")]

pub mod client;
pub mod codec_traits;
pub mod error;
pub mod shm;
pub mod surface;
pub mod types;
