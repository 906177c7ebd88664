//! Kernel argument binding.
//!
//! Pointer arguments resolve through the virtual-memory table; a pointer
//! into the middle of a buffer binds as a transient sub-buffer view over
//! `[offset, end)`. Views live in a [`CallScope`] guard that releases them
//! when it drops, so they are cleaned up on every exit path, including
//! early returns from binding or enqueue errors.

use std::collections::HashMap;
use std::sync::Arc;

use clmem_common::{Error, Result};
use tracing::{debug, warn};

use crate::backend::{BoundArg, BufferHandle, ComputeBackend, KernelKey, ScalarArg};
use crate::launch::LaunchGeometry;
use crate::vmem::{VirtualMemoryTable, VirtualPtr};

/// One kernel argument as callers supply it, before resolution.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg {
    I32(i32),
    U32(u32),
    F32(f32),
    F64(f64),
    Ptr(VirtualPtr),
}

/// Releases the sub-buffer views created while binding one call.
pub struct CallScope {
    backend: Arc<dyn ComputeBackend>,
    views: Vec<BufferHandle>,
    by_ptr: HashMap<VirtualPtr, BufferHandle>,
}

impl CallScope {
    fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            views: Vec::new(),
            by_ptr: HashMap::new(),
        }
    }

    /// Binds one pointer argument, creating a view when the pointer sits
    /// at a nonzero offset. The same pointer bound twice in one call
    /// reuses the first view.
    fn bind(
        &mut self,
        table: &VirtualMemoryTable,
        index: usize,
        ptr: VirtualPtr,
    ) -> Result<BufferHandle> {
        if let Some(view) = self.by_ptr.get(&ptr) {
            return Ok(*view);
        }
        let r = table.resolve(ptr).map_err(|e| Error::ArgumentBinding {
            index,
            reason: e.to_string(),
        })?;
        if r.offset == 0 {
            return Ok(r.buffer);
        }
        let view = self
            .backend
            .create_sub_buffer(r.buffer, r.offset, r.size)
            .map_err(|e| Error::ArgumentBinding {
                index,
                reason: e.to_string(),
            })?;
        self.views.push(view);
        self.by_ptr.insert(ptr, view);
        Ok(view)
    }

    /// Number of views held by this scope.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        for view in self.views.drain(..) {
            if let Err(e) = self.backend.release_sub_buffer(view) {
                warn!(view = view.raw(), error = %e, "failed to release sub-buffer view");
            }
        }
    }
}

/// Binds arguments and dispatches kernels against a backend.
pub struct KernelBinder {
    backend: Arc<dyn ComputeBackend>,
}

impl KernelBinder {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    /// Looks up `key`, binds `args` positionally and enqueues the kernel.
    /// All transient views are released before this returns, on success
    /// and on error alike.
    pub fn launch(
        &self,
        table: &VirtualMemoryTable,
        key: &KernelKey,
        geometry: &LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<()> {
        let kernel = self
            .backend
            .kernel(key)
            .ok_or_else(|| Error::KernelMissing { name: key.name() })?;
        let mut scope = CallScope::new(Arc::clone(&self.backend));
        let mut bound = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let b = match arg {
                KernelArg::I32(v) => BoundArg::Scalar(ScalarArg::I32(*v)),
                KernelArg::U32(v) => BoundArg::Scalar(ScalarArg::U32(*v)),
                KernelArg::F32(v) => BoundArg::Scalar(ScalarArg::F32(*v)),
                KernelArg::F64(v) => BoundArg::Scalar(ScalarArg::F64(*v)),
                KernelArg::Ptr(ptr) => BoundArg::Buffer(scope.bind(table, index, *ptr)?),
            };
            bound.push(b);
        }
        debug!(kernel = %key, views = scope.view_count(), work_items = geometry.work_items(), "dispatching kernel");
        self.backend.enqueue(kernel, geometry, &bound)
        // scope drops here, releasing the views after the blocking enqueue.
    }
}
