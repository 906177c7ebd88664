//! Common types for the clmem device memory and dispatch layer.
//!
//! This crate provides the foundations shared by the memory-virtualization
//! core and the reshape kernels: numeric element types, the error taxonomy,
//! dispatch configuration, and small integer math helpers.

pub mod config;
pub mod elem;
pub mod error;
pub mod math;

pub use config::{DispatchConfig, OptLevel};
pub use elem::{Elem, Numeric, from_bytes, to_bytes};
pub use error::{Error, Result};
pub use math::{ceil_div, round_up};
