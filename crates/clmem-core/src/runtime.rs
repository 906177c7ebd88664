//! Runtime tying a backend, its allocator and the dispatch configuration
//! together behind one handle.

use std::sync::Arc;

use clmem_common::{DispatchConfig, Result};
use tracing::info;

use crate::alloc::BufferAllocator;
use crate::backend::{ComputeBackend, KernelKey};
use crate::binder::{KernelArg, KernelBinder};
use crate::launch::LaunchGeometry;

/// One device worth of state: buffers, pointers and kernel dispatch.
pub struct Runtime {
    backend: Arc<dyn ComputeBackend>,
    allocator: BufferAllocator,
    binder: KernelBinder,
    config: DispatchConfig,
}

impl Runtime {
    pub fn new(backend: Arc<dyn ComputeBackend>, config: DispatchConfig) -> Self {
        info!(device = %backend.device_name(), "runtime initialized");
        Self {
            allocator: BufferAllocator::new(Arc::clone(&backend)),
            binder: KernelBinder::new(Arc::clone(&backend)),
            backend,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatches one kernel call. Pointer arguments resolve through this
    /// runtime's allocator table.
    pub fn launch(
        &self,
        key: &KernelKey,
        geometry: &LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<()> {
        self.binder
            .launch(self.allocator.table(), key, geometry, args)
    }
}
