//! Buffer allocator and host/device transfer operations.
//!
//! Allocation returns a [`VirtualPtr`] rather than a buffer: the pointer
//! resolves through the [`VirtualMemoryTable`] and supports byte-offset
//! arithmetic via [`BufferAllocator::slice`]. Freed buffers are kept and
//! reused for later allocations of exactly the same size, which matches
//! the steady-state allocation pattern of layered workloads where the same
//! shapes recur every iteration.

use std::sync::{Arc, Mutex};

use clmem_common::{Elem, Error, Numeric, Result};
use tracing::{debug, trace};

use crate::backend::{BufferHandle, ComputeBackend};
use crate::vmem::{Resolved, VirtualMemoryTable, VirtualPtr};

struct BufferRecord {
    handle: BufferHandle,
    size: usize,
    available: bool,
}

/// Source of a copy.
pub enum CopySrc<'a> {
    Host(&'a [u8]),
    Device(VirtualPtr),
}

/// Destination of a copy.
pub enum CopyDst<'a> {
    Host(&'a mut [u8]),
    Device(VirtualPtr),
}

/// Explicit direction for [`BufferAllocator::memcpy`]. `Auto` derives the
/// direction from the source and destination variants; naming a direction
/// that contradicts the operands is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    Auto,
}

/// Owns the device buffers and the pointer table.
pub struct BufferAllocator {
    backend: Arc<dyn ComputeBackend>,
    table: VirtualMemoryTable,
    buffers: Mutex<Vec<BufferRecord>>,
}

impl BufferAllocator {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            table: VirtualMemoryTable::new(),
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    pub fn table(&self) -> &VirtualMemoryTable {
        &self.table
    }

    /// Allocates `bytes` bytes, reusing a previously freed buffer of
    /// exactly that size when one exists.
    pub fn alloc_bytes(&self, bytes: usize) -> Result<VirtualPtr> {
        if bytes == 0 {
            return Err(Error::Allocation {
                bytes,
                device: self.backend.device_name(),
                reason: "zero-sized allocation".into(),
            });
        }
        let mut buffers = self.lock_buffers();
        let reused = buffers
            .iter_mut()
            .find(|r| r.available && r.size == bytes)
            .map(|r| {
                r.available = false;
                r.handle
            });
        let handle = match reused {
            Some(handle) => {
                trace!(buffer = handle.raw(), bytes, "reusing freed buffer");
                handle
            }
            None => {
                let handle = self.backend.create_buffer(bytes).map_err(|e| match e {
                    Error::Driver { detail, .. } => Error::Allocation {
                        bytes,
                        device: self.backend.device_name(),
                        reason: detail,
                    },
                    other => other,
                })?;
                buffers.push(BufferRecord {
                    handle,
                    size: bytes,
                    available: false,
                });
                debug!(buffer = handle.raw(), bytes, "allocated buffer");
                handle
            }
        };
        Ok(self.table.register(handle, 0, bytes, true))
    }

    /// Allocates storage for `len` elements of `T`.
    pub fn alloc<T: Numeric>(&self, len: usize) -> Result<VirtualPtr> {
        self.alloc_bytes(len * T::ELEM.size_of())
    }

    /// Derives a pointer `byte_offset` bytes into the allocation behind
    /// `ptr`. The derived pointer shares the backing buffer and cannot be
    /// freed on its own.
    pub fn slice(&self, ptr: VirtualPtr, byte_offset: usize) -> Result<VirtualPtr> {
        let r = self.table.resolve(ptr)?;
        if byte_offset > r.size {
            return Err(Error::InvalidArguments {
                reason: format!(
                    "offset {byte_offset} exceeds the {} reachable bytes of {ptr}",
                    r.size
                ),
            });
        }
        Ok(self
            .table
            .register(r.buffer, r.offset + byte_offset, r.size - byte_offset, false))
    }

    /// Resolves a pointer without consuming it.
    pub fn resolve(&self, ptr: VirtualPtr) -> Result<Resolved> {
        self.table.resolve(ptr)
    }

    /// Frees the allocation behind an origin pointer. Every derived slice
    /// pointer over the same buffer is retired with it; the buffer itself
    /// is marked available for exact-size reuse.
    pub fn free(&self, ptr: VirtualPtr) -> Result<()> {
        // The buffer mutex is held for the whole resolve/unregister/
        // mark-available sequence. `alloc_bytes` holds it too, so a racing
        // allocation cannot reuse the buffer mid-free, and of two racing
        // frees the loser resolves a retired pointer.
        let mut buffers = self.lock_buffers();
        let r = match self.table.resolve(ptr) {
            Ok(r) => r,
            Err(Error::UnknownPointer { ptr: raw }) => {
                if self.table.is_retired(ptr) {
                    return Err(Error::DoubleFree { ptr: raw });
                }
                return Err(Error::UnknownPointer { ptr: raw });
            }
            Err(e) => return Err(e),
        };
        if !r.origin || r.offset != 0 {
            return Err(Error::InvalidFree {
                ptr: ptr.raw(),
                offset: r.offset,
            });
        }
        for derived in self.table.entries_for_buffer(r.buffer) {
            self.table.unregister(derived)?;
        }
        if let Some(record) = buffers.iter_mut().find(|b| b.handle == r.buffer) {
            record.available = true;
        }
        debug!(buffer = r.buffer.raw(), size = r.size, "freed buffer");
        Ok(())
    }

    /// Fills `len` elements starting at `ptr` with `value`.
    pub fn memset<T: Numeric>(&self, ptr: VirtualPtr, value: T, len: usize) -> Result<()> {
        let r = self.table.resolve(ptr)?;
        let bytes = len * T::ELEM.size_of();
        if bytes > r.size {
            return Err(Error::InvalidArguments {
                reason: format!("memset of {bytes} bytes exceeds the {} bytes at {ptr}", r.size),
            });
        }
        let mut pattern = vec![0u8; T::ELEM.size_of()];
        value.write_le(&mut pattern);
        self.backend.fill(r.buffer, r.offset, bytes, &pattern)
    }

    /// Copies `bytes` bytes between host slices and/or device pointers.
    pub fn memcpy(
        &self,
        dst: CopyDst<'_>,
        src: CopySrc<'_>,
        bytes: usize,
        direction: CopyDirection,
    ) -> Result<()> {
        let actual = match (&dst, &src) {
            (CopyDst::Host(_), CopySrc::Host(_)) => CopyDirection::HostToHost,
            (CopyDst::Device(_), CopySrc::Host(_)) => CopyDirection::HostToDevice,
            (CopyDst::Host(_), CopySrc::Device(_)) => CopyDirection::DeviceToHost,
            (CopyDst::Device(_), CopySrc::Device(_)) => CopyDirection::DeviceToDevice,
        };
        if direction != CopyDirection::Auto && direction != actual {
            return Err(Error::InvalidArguments {
                reason: format!("requested {direction:?} copy but operands imply {actual:?}"),
            });
        }
        match (dst, src) {
            (CopyDst::Host(out), CopySrc::Host(data)) => {
                self.check_host(out.len(), bytes)?;
                self.check_host(data.len(), bytes)?;
                out[..bytes].copy_from_slice(&data[..bytes]);
                Ok(())
            }
            (CopyDst::Device(dptr), CopySrc::Host(data)) => {
                self.check_host(data.len(), bytes)?;
                let d = self.checked_resolve(dptr, bytes)?;
                self.backend.write(d.buffer, d.offset, &data[..bytes])
            }
            (CopyDst::Host(out), CopySrc::Device(sptr)) => {
                self.check_host(out.len(), bytes)?;
                let s = self.checked_resolve(sptr, bytes)?;
                self.backend.read(s.buffer, s.offset, &mut out[..bytes])
            }
            (CopyDst::Device(dptr), CopySrc::Device(sptr)) => {
                let d = self.checked_resolve(dptr, bytes)?;
                let s = self.checked_resolve(sptr, bytes)?;
                self.backend
                    .copy(s.buffer, s.offset, d.buffer, d.offset, bytes)
            }
        }
    }

    /// Uploads a typed host slice to a fresh region at `ptr`.
    pub fn upload<T: Numeric>(&self, ptr: VirtualPtr, data: &[T]) -> Result<()> {
        let bytes = clmem_common::to_bytes(data);
        self.memcpy(
            CopyDst::Device(ptr),
            CopySrc::Host(&bytes),
            bytes.len(),
            CopyDirection::HostToDevice,
        )
    }

    /// Downloads `len` elements of `T` from `ptr`.
    pub fn download<T: Numeric>(&self, ptr: VirtualPtr, len: usize) -> Result<Vec<T>> {
        let mut bytes = vec![0u8; len * T::ELEM.size_of()];
        let n = bytes.len();
        self.memcpy(
            CopyDst::Host(&mut bytes),
            CopySrc::Device(ptr),
            n,
            CopyDirection::DeviceToHost,
        )?;
        Ok(clmem_common::from_bytes(&bytes))
    }

    /// Element type size helper used by callers computing byte offsets.
    pub fn elem_bytes(elem: Elem, len: usize) -> usize {
        len * elem.size_of()
    }

    fn checked_resolve(&self, ptr: VirtualPtr, bytes: usize) -> Result<Resolved> {
        let r = self.table.resolve(ptr)?;
        if bytes > r.size {
            return Err(Error::Transfer(format!(
                "copy of {bytes} bytes exceeds the {} reachable bytes at {ptr}",
                r.size
            )));
        }
        Ok(r)
    }

    fn check_host(&self, have: usize, need: usize) -> Result<()> {
        if have < need {
            return Err(Error::Transfer(format!(
                "host slice of {have} bytes is shorter than the {need}-byte copy"
            )));
        }
        Ok(())
    }

    fn lock_buffers(&self) -> std::sync::MutexGuard<'_, Vec<BufferRecord>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of backing buffers ever created (live plus available).
    pub fn buffer_count(&self) -> usize {
        self.lock_buffers().len()
    }
}

impl Drop for BufferAllocator {
    /// Returns every backing buffer to the backend. `free` only marks
    /// buffers available for reuse; the backend objects themselves live
    /// until the allocator goes away.
    fn drop(&mut self) {
        let buffers = self.lock_buffers();
        for record in buffers.iter() {
            if let Err(e) = self.backend.release_buffer(record.handle) {
                debug!(buffer = record.handle.raw(), error = %e, "buffer release at teardown failed");
            }
        }
    }
}
