//! Device-memory virtualization and kernel dispatch.
//!
//! Device buffers are opaque objects, so this crate layers a virtual
//! address space over them: allocations hand out tagged 64-bit pointers
//! that support byte-offset arithmetic, resolve to `(buffer, offset)`
//! pairs, and bind to kernels as transient sub-buffer views. The
//! [`host::HostBackend`] reference backend runs everything against host
//! memory; the OpenCL backend is compiled in with the `opencl` feature.

pub mod alloc;
pub mod backend;
pub mod binder;
pub mod host;
pub mod launch;
pub mod runtime;
pub mod vmem;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use alloc::{BufferAllocator, CopyDirection, CopyDst, CopySrc};
pub use backend::{BoundArg, BufferHandle, ComputeBackend, KernelHandle, KernelKey, ScalarArg};
pub use binder::{CallScope, KernelArg, KernelBinder};
pub use host::{HostBackend, HostCall, HostKernelFn};
pub use launch::LaunchGeometry;
pub use runtime::Runtime;
pub use vmem::{Resolved, VirtualMemoryTable, VirtualPtr};

#[cfg(feature = "opencl")]
pub use opencl::OpenClBackend;
