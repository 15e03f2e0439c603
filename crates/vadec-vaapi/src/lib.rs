#![doc = include_str!("../README.md")]

pub mod context;
pub mod driver;
pub mod memory_driver;

#[cfg(vadec_vaapi_stub)]
#[path = "libva_stub.rs"]
pub mod libva;
#[cfg(not(vadec_vaapi_stub))]
pub mod libva;

pub mod sys;
