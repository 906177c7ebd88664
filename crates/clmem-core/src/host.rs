//! Host-memory backend.
//!
//! Implements [`ComputeBackend`] over plain `Vec<u8>` storage so the
//! allocator, the virtual-memory table and the argument binder are
//! exercisable without a device driver. Kernels are closures registered
//! by name; the kernel crate installs its CPU reference implementations
//! here and the binder dispatches to them exactly as it would to compiled
//! device kernels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use clmem_common::{Error, Result};
use tracing::debug;

use crate::backend::{BoundArg, BufferHandle, ComputeBackend, KernelHandle, KernelKey, ScalarArg};
use crate::launch::LaunchGeometry;

/// A host kernel body. Receives the call's scalar arguments and buffer
/// bindings through [`HostCall`].
pub type HostKernelFn = dyn Fn(&HostCall<'_>) -> Result<()> + Send + Sync;

enum HostAlloc {
    Root(Vec<u8>),
    View {
        parent: BufferHandle,
        offset: usize,
        len: usize,
    },
}

struct HostInner {
    buffers: HashMap<u64, HostAlloc>,
    next_id: u64,
    kernels: Vec<Arc<HostKernelFn>>,
    by_name: HashMap<String, KernelHandle>,
}

impl HostInner {
    /// Follows view chains down to `(root id, absolute offset, length)`.
    /// A view's own length bounds the access even when the root is larger.
    fn locate(&self, buffer: BufferHandle) -> Result<(u64, usize, usize)> {
        match self.buffers.get(&buffer.0) {
            Some(HostAlloc::Root(data)) => Ok((buffer.0, 0, data.len())),
            Some(HostAlloc::View {
                parent,
                offset,
                len,
            }) => {
                let (root, base, _) = self.locate(*parent)?;
                Ok((root, base + offset, *len))
            }
            None => Err(Error::Driver {
                call: "locate",
                device: "host".into(),
                detail: format!("unknown buffer {}", buffer.0),
            }),
        }
    }
}

/// Reference backend backed by host memory.
pub struct HostBackend {
    inner: Mutex<HostInner>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HostInner {
                buffers: HashMap::new(),
                next_id: 1,
                kernels: Vec::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    /// Registers a kernel body under `key`. Later registrations under the
    /// same key replace earlier ones.
    pub fn register_kernel(&self, key: KernelKey, body: Arc<HostKernelFn>) {
        let mut inner = self.lock();
        let handle = KernelHandle(inner.kernels.len() as u64);
        inner.kernels.push(body);
        inner.by_name.insert(key.name(), handle);
    }

    /// Number of live sub-buffer views. Tests use this to check that the
    /// binder releases every view it creates.
    pub fn live_sub_buffer_count(&self) -> usize {
        self.lock()
            .buffers
            .values()
            .filter(|a| matches!(a, HostAlloc::View { .. }))
            .count()
    }

    /// Number of live root buffers.
    pub fn live_buffer_count(&self) -> usize {
        self.lock()
            .buffers
            .values()
            .filter(|a| matches!(a, HostAlloc::Root(_)))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for HostBackend {
    fn device_name(&self) -> String {
        "host".into()
    }

    fn create_buffer(&self, bytes: usize) -> Result<BufferHandle> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.buffers.insert(id, HostAlloc::Root(vec![0u8; bytes]));
        debug!(buffer = id, bytes, "created host buffer");
        Ok(BufferHandle(id))
    }

    fn release_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let mut inner = self.lock();
        match inner.buffers.remove(&buffer.0) {
            Some(HostAlloc::Root(_)) => Ok(()),
            Some(view @ HostAlloc::View { .. }) => {
                inner.buffers.insert(buffer.0, view);
                Err(Error::Driver {
                    call: "release_buffer",
                    device: "host".into(),
                    detail: format!("buffer {} is a sub-buffer view", buffer.0),
                })
            }
            None => Err(Error::Driver {
                call: "release_buffer",
                device: "host".into(),
                detail: format!("unknown buffer {}", buffer.0),
            }),
        }
    }

    fn create_sub_buffer(
        &self,
        parent: BufferHandle,
        offset: usize,
        bytes: usize,
    ) -> Result<BufferHandle> {
        let mut inner = self.lock();
        let (_, _, len) = inner.locate(parent)?;
        if offset + bytes > len {
            return Err(Error::Driver {
                call: "create_sub_buffer",
                device: "host".into(),
                detail: format!(
                    "view [{offset}, {}) exceeds parent length {len}",
                    offset + bytes
                ),
            });
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.buffers.insert(
            id,
            HostAlloc::View {
                parent,
                offset,
                len: bytes,
            },
        );
        Ok(BufferHandle(id))
    }

    fn release_sub_buffer(&self, view: BufferHandle) -> Result<()> {
        let mut inner = self.lock();
        match inner.buffers.remove(&view.0) {
            Some(HostAlloc::View { .. }) => Ok(()),
            Some(root @ HostAlloc::Root(_)) => {
                inner.buffers.insert(view.0, root);
                Err(Error::Driver {
                    call: "release_sub_buffer",
                    device: "host".into(),
                    detail: format!("buffer {} is not a sub-buffer", view.0),
                })
            }
            None => Err(Error::Driver {
                call: "release_sub_buffer",
                device: "host".into(),
                detail: format!("unknown sub-buffer {}", view.0),
            }),
        }
    }

    fn write(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let (root, base, len) = inner.locate(buffer)?;
        if offset + data.len() > len {
            return Err(Error::Transfer(format!(
                "write of {} bytes at offset {offset} exceeds buffer length {len}",
                data.len()
            )));
        }
        match inner.buffers.get_mut(&root) {
            Some(HostAlloc::Root(storage)) => {
                storage[base + offset..base + offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ => unreachable!("locate returned a non-root id"),
        }
    }

    fn read(&self, buffer: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        let inner = self.lock();
        let (root, base, len) = inner.locate(buffer)?;
        if offset + out.len() > len {
            return Err(Error::Transfer(format!(
                "read of {} bytes at offset {offset} exceeds buffer length {len}",
                out.len()
            )));
        }
        match inner.buffers.get(&root) {
            Some(HostAlloc::Root(storage)) => {
                out.copy_from_slice(&storage[base + offset..base + offset + out.len()]);
                Ok(())
            }
            _ => unreachable!("locate returned a non-root id"),
        }
    }

    fn copy(
        &self,
        src: BufferHandle,
        src_offset: usize,
        dst: BufferHandle,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()> {
        // Stage through a host vector; overlapping device copies are not a
        // supported operation so the extra copy is acceptable here.
        let mut staging = vec![0u8; bytes];
        self.read(src, src_offset, &mut staging)?;
        self.write(dst, dst_offset, &staging)
    }

    fn fill(
        &self,
        buffer: BufferHandle,
        offset: usize,
        bytes: usize,
        pattern: &[u8],
    ) -> Result<()> {
        if pattern.is_empty() || bytes % pattern.len() != 0 {
            return Err(Error::InvalidArguments {
                reason: format!(
                    "fill length {bytes} is not a multiple of pattern length {}",
                    pattern.len()
                ),
            });
        }
        let mut staging = vec![0u8; bytes];
        for chunk in staging.chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        self.write(buffer, offset, &staging)
    }

    fn kernel(&self, key: &KernelKey) -> Option<KernelHandle> {
        self.lock().by_name.get(&key.name()).copied()
    }

    fn enqueue(
        &self,
        kernel: KernelHandle,
        geometry: &LaunchGeometry,
        args: &[BoundArg],
    ) -> Result<()> {
        let body = {
            let inner = self.lock();
            inner
                .kernels
                .get(kernel.0 as usize)
                .cloned()
                .ok_or_else(|| Error::KernelMissing {
                    name: format!("handle {}", kernel.0),
                })?
        };
        let call = HostCall {
            backend: self,
            geometry,
            args,
        };
        body(&call)
    }
}

/// View of one host-kernel invocation: scalar arguments by position and
/// buffer access by position.
pub struct HostCall<'a> {
    backend: &'a HostBackend,
    geometry: &'a LaunchGeometry,
    args: &'a [BoundArg],
}

impl HostCall<'_> {
    pub fn geometry(&self) -> &LaunchGeometry {
        self.geometry
    }

    fn arg(&self, index: usize) -> Result<&BoundArg> {
        self.args.get(index).ok_or_else(|| Error::ArgumentBinding {
            index,
            reason: format!("kernel received only {} arguments", self.args.len()),
        })
    }

    pub fn scalar_i32(&self, index: usize) -> Result<i32> {
        match self.arg(index)? {
            BoundArg::Scalar(ScalarArg::I32(v)) => Ok(*v),
            other => Err(Error::ArgumentBinding {
                index,
                reason: format!("expected i32 scalar, got {other:?}"),
            }),
        }
    }

    pub fn scalar_u32(&self, index: usize) -> Result<u32> {
        match self.arg(index)? {
            BoundArg::Scalar(ScalarArg::U32(v)) => Ok(*v),
            other => Err(Error::ArgumentBinding {
                index,
                reason: format!("expected u32 scalar, got {other:?}"),
            }),
        }
    }

    pub fn scalar_f32(&self, index: usize) -> Result<f32> {
        match self.arg(index)? {
            BoundArg::Scalar(ScalarArg::F32(v)) => Ok(*v),
            other => Err(Error::ArgumentBinding {
                index,
                reason: format!("expected f32 scalar, got {other:?}"),
            }),
        }
    }

    pub fn scalar_f64(&self, index: usize) -> Result<f64> {
        match self.arg(index)? {
            BoundArg::Scalar(ScalarArg::F64(v)) => Ok(*v),
            other => Err(Error::ArgumentBinding {
                index,
                reason: format!("expected f64 scalar, got {other:?}"),
            }),
        }
    }

    /// Snapshot of a buffer argument's contents.
    pub fn read_buffer(&self, index: usize) -> Result<Vec<u8>> {
        match self.arg(index)? {
            BoundArg::Buffer(handle) => {
                let len = {
                    let inner = self.backend.lock();
                    inner.locate(*handle)?.2
                };
                let mut out = vec![0u8; len];
                self.backend.read(*handle, 0, &mut out)?;
                Ok(out)
            }
            other => Err(Error::ArgumentBinding {
                index,
                reason: format!("expected buffer, got {other:?}"),
            }),
        }
    }

    /// Overwrites a buffer argument's contents from its start.
    pub fn write_buffer(&self, index: usize, data: &[u8]) -> Result<()> {
        match self.arg(index)? {
            BoundArg::Buffer(handle) => self.backend.write(*handle, 0, data),
            other => Err(Error::ArgumentBinding {
                index,
                reason: format!("expected buffer, got {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let backend = HostBackend::new();
        let buf = backend.create_buffer(16).unwrap();
        backend.write(buf, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        backend.read(buf, 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn sub_buffer_shares_parent_storage() {
        let backend = HostBackend::new();
        let buf = backend.create_buffer(32).unwrap();
        let view = backend.create_sub_buffer(buf, 8, 8).unwrap();
        backend.write(view, 0, &[9; 8]).unwrap();
        let mut out = [0u8; 8];
        backend.read(buf, 8, &mut out).unwrap();
        assert_eq!(out, [9; 8]);
    }

    #[test]
    fn sub_buffer_bounds_are_enforced() {
        let backend = HostBackend::new();
        let buf = backend.create_buffer(32).unwrap();
        assert!(backend.create_sub_buffer(buf, 24, 16).is_err());
        let view = backend.create_sub_buffer(buf, 24, 8).unwrap();
        assert!(backend.write(view, 4, &[0; 8]).is_err());
    }

    #[test]
    fn release_counts() {
        let backend = HostBackend::new();
        let buf = backend.create_buffer(8).unwrap();
        let view = backend.create_sub_buffer(buf, 0, 4).unwrap();
        assert_eq!(backend.live_buffer_count(), 1);
        assert_eq!(backend.live_sub_buffer_count(), 1);
        backend.release_sub_buffer(view).unwrap();
        backend.release_buffer(buf).unwrap();
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_sub_buffer_count(), 0);
    }

    #[test]
    fn release_rejects_wrong_kind() {
        let backend = HostBackend::new();
        let buf = backend.create_buffer(8).unwrap();
        let view = backend.create_sub_buffer(buf, 0, 4).unwrap();
        assert!(backend.release_buffer(view).is_err());
        assert!(backend.release_sub_buffer(buf).is_err());
    }

    #[test]
    fn fill_repeats_pattern() {
        let backend = HostBackend::new();
        let buf = backend.create_buffer(8).unwrap();
        backend.fill(buf, 0, 8, &[0xab, 0xcd]).unwrap();
        let mut out = [0u8; 8];
        backend.read(buf, 0, &mut out).unwrap();
        assert_eq!(out, [0xab, 0xcd, 0xab, 0xcd, 0xab, 0xcd, 0xab, 0xcd]);
    }

    #[test]
    fn fill_rejects_misaligned_length() {
        let backend = HostBackend::new();
        let buf = backend.create_buffer(8).unwrap();
        assert!(backend.fill(buf, 0, 7, &[0u8; 4]).is_err());
    }

    #[test]
    fn registered_kernel_is_found_and_invoked() {
        let backend = HostBackend::new();
        let key = KernelKey::new("double", clmem_common::Elem::I32);
        backend.register_kernel(
            key,
            Arc::new(|call: &HostCall<'_>| {
                let n = call.scalar_i32(0)?;
                let bytes = call.read_buffer(1)?;
                let mut values = clmem_common::from_bytes::<i32>(&bytes);
                for v in values.iter_mut().take(n as usize) {
                    *v *= 2;
                }
                call.write_buffer(1, &clmem_common::to_bytes(&values))
            }),
        );
        let handle = backend.kernel(&key).unwrap();
        let buf = backend.create_buffer(12).unwrap();
        backend
            .write(buf, 0, &clmem_common::to_bytes(&[1i32, 2, 3]))
            .unwrap();
        backend
            .enqueue(
                handle,
                &LaunchGeometry::flat(3, 64),
                &[
                    BoundArg::Scalar(ScalarArg::I32(3)),
                    BoundArg::Buffer(buf),
                ],
            )
            .unwrap();
        let mut out = vec![0u8; 12];
        backend.read(buf, 0, &mut out).unwrap();
        assert_eq!(clmem_common::from_bytes::<i32>(&out), vec![2, 4, 6]);
    }

    #[test]
    fn missing_kernel_lookup_returns_none() {
        let backend = HostBackend::new();
        assert!(backend
            .kernel(&KernelKey::new("nope", clmem_common::Elem::F32))
            .is_none());
    }
}
