//! im2col/col2im reshape kernels over the clmem runtime.
//!
//! [`cpu`] holds the reference implementations, [`sources`] the OpenCL C
//! device code, [`reshape`] the dispatch layer, and [`registry`] wires the
//! CPU implementations into a host backend so everything runs without a
//! device driver.

pub mod cpu;
pub mod registry;
pub mod reshape;
pub mod sources;

pub use registry::{host_runtime, register_host_kernels};
pub use reshape::ConvParams;

/// Builds a runtime over an OpenCL device with the reshape kernel sources
/// installed. Kernels compile lazily on first dispatch.
#[cfg(feature = "opencl")]
pub fn opencl_runtime(
    config: clmem_common::DispatchConfig,
) -> clmem_common::Result<clmem_core::Runtime> {
    use std::sync::Arc;

    let backend = clmem_core::OpenClBackend::new(
        &config,
        Box::new(|key: &clmem_core::KernelKey| sources::source_for(key)),
    )?;
    Ok(clmem_core::Runtime::new(
        Arc::new(backend) as Arc<dyn clmem_core::ComputeBackend>,
        config,
    ))
}
