//! Backend abstraction over a compute device.
//!
//! Everything above this layer talks in opaque handles: the virtual-memory
//! table, the allocator and the argument binder never see a raw `cl_mem` or
//! a host pointer. A backend owns the device buffers, hands out handles, and
//! executes named kernels against them. [`crate::host::HostBackend`] is the
//! always-available reference implementation; the OpenCL backend lives
//! behind the `opencl` feature.

use clmem_common::{Elem, Result};

use crate::launch::LaunchGeometry;

/// Opaque handle to a device buffer owned by a backend.
///
/// Handles are never reused within a backend's lifetime, so a stale handle
/// fails lookup instead of aliasing a newer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

impl BufferHandle {
    /// Raw handle value, for logging.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque handle to a compiled kernel inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub(crate) u64);

/// Identifies one kernel specialization: a base name plus the element type
/// it operates on. The backend resolves this to `"{base}_{suffix}"`, e.g.
/// `im2col_f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub base: &'static str,
    pub elem: Elem,
}

impl KernelKey {
    pub fn new(base: &'static str, elem: Elem) -> Self {
        Self { base, elem }
    }

    /// Full kernel name as it appears in the program source.
    pub fn name(&self) -> String {
        format!("{}_{}", self.base, self.elem.suffix())
    }
}

impl std::fmt::Display for KernelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.base, self.elem.suffix())
    }
}

/// A scalar kernel argument, passed by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArg {
    I32(i32),
    U32(u32),
    F32(f32),
    F64(f64),
}

/// One bound kernel argument, after pointer resolution.
#[derive(Debug, Clone, Copy)]
pub enum BoundArg {
    Scalar(ScalarArg),
    Buffer(BufferHandle),
}

/// Compute-device surface used by the allocator and the binder.
///
/// All buffer operations take byte offsets and byte lengths; element typing
/// happens above this trait. Transfers are blocking: when `write`/`read`
/// return, the host slice has been fully consumed/filled.
pub trait ComputeBackend: Send + Sync {
    /// Human-readable device name, for logs.
    fn device_name(&self) -> String;

    /// Allocates a root buffer of `bytes` bytes.
    fn create_buffer(&self, bytes: usize) -> Result<BufferHandle>;

    /// Releases a root buffer. Outstanding sub-buffers over it must already
    /// have been released.
    fn release_buffer(&self, buffer: BufferHandle) -> Result<()>;

    /// Creates a sub-buffer view covering `parent[offset .. offset + bytes]`.
    /// The view shares storage with the parent.
    fn create_sub_buffer(
        &self,
        parent: BufferHandle,
        offset: usize,
        bytes: usize,
    ) -> Result<BufferHandle>;

    /// Releases a sub-buffer view. The parent buffer is unaffected.
    fn release_sub_buffer(&self, view: BufferHandle) -> Result<()>;

    /// Copies `data` into `buffer` starting at byte `offset`.
    fn write(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()>;

    /// Copies `out.len()` bytes out of `buffer` starting at byte `offset`.
    fn read(&self, buffer: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Device-to-device copy of `bytes` bytes.
    fn copy(
        &self,
        src: BufferHandle,
        src_offset: usize,
        dst: BufferHandle,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()>;

    /// Fills `bytes` bytes of `buffer` from `offset` with the repeating
    /// `pattern`.
    fn fill(&self, buffer: BufferHandle, offset: usize, bytes: usize, pattern: &[u8])
        -> Result<()>;

    /// Looks up a kernel by key. Returns `None` when the backend has no
    /// kernel under that name; callers decide whether that is fatal.
    fn kernel(&self, key: &KernelKey) -> Option<KernelHandle>;

    /// Enqueues `kernel` with the given geometry and bound arguments and
    /// waits for completion.
    fn enqueue(
        &self,
        kernel: KernelHandle,
        geometry: &LaunchGeometry,
        args: &[BoundArg],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_key_name_appends_suffix() {
        let key = KernelKey::new("im2col", Elem::F32);
        assert_eq!(key.name(), "im2col_f32");
        assert_eq!(KernelKey::new("col2im", Elem::F64).name(), "col2im_f64");
    }

    #[test]
    fn kernel_key_display_matches_name() {
        let key = KernelKey::new("im2col_batched", Elem::I32);
        assert_eq!(format!("{key}"), key.name());
    }
}
