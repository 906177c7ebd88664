//! OpenCL backend via the `opencl3` crate.
//!
//! Buffers are `cl_mem` objects held in a handle table; sub-buffer views
//! map straight onto `clCreateSubBuffer`. Kernel programs are compiled
//! lazily per (base name, element type) pair from source supplied by a
//! provider closure, with the `Dtype` placeholder substituted for the
//! concrete OpenCL C type.

use std::collections::HashMap;
use std::sync::Mutex;

use clmem_common::{DispatchConfig, Elem, Error, Result};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_GPU};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_WRITE};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::CL_BLOCKING;
use tracing::{debug, info, warn};

use crate::backend::{
    BoundArg, BufferHandle, ComputeBackend, KernelHandle, KernelKey, ScalarArg,
};
use crate::launch::LaunchGeometry;

/// Supplies OpenCL C source for a kernel key. The source may use `Dtype`
/// for the element type; it is rewritten before compilation.
pub type SourceProvider = dyn Fn(&KernelKey) -> Option<String> + Send + Sync;

enum ClAlloc {
    Root(Buffer<u8>),
    View(Buffer<u8>),
}

impl ClAlloc {
    fn buffer(&self) -> &Buffer<u8> {
        match self {
            ClAlloc::Root(b) | ClAlloc::View(b) => b,
        }
    }

    fn buffer_mut(&mut self) -> &mut Buffer<u8> {
        match self {
            ClAlloc::Root(b) | ClAlloc::View(b) => b,
        }
    }
}

struct ClInner {
    buffers: HashMap<u64, ClAlloc>,
    next_id: u64,
    kernels: Vec<Kernel>,
    by_name: HashMap<String, KernelHandle>,
}

/// OpenCL device backend.
pub struct OpenClBackend {
    device_name: String,
    context: Context,
    queue: CommandQueue,
    source_provider: Box<SourceProvider>,
    inner: Mutex<ClInner>,
}

// SAFETY: all OpenCL handles are used through the single command queue and
// the inner mutex; the OpenCL runtime itself is thread-safe for these calls.
unsafe impl Send for OpenClBackend {}
unsafe impl Sync for OpenClBackend {}

fn driver_err(call: &'static str, device: &str, e: impl std::fmt::Display) -> Error {
    Error::Driver {
        call,
        device: device.to_string(),
        detail: e.to_string(),
    }
}

impl OpenClBackend {
    /// Opens the platform/device named by `config` and creates one in-order
    /// command queue.
    pub fn new(config: &DispatchConfig, source_provider: Box<SourceProvider>) -> Result<Self> {
        let platforms =
            get_platforms().map_err(|e| driver_err("clGetPlatformIDs", "unknown", e))?;
        let platform = platforms
            .get(config.platform_index)
            .ok_or_else(|| Error::Driver {
                call: "clGetPlatformIDs",
                device: "unknown".into(),
                detail: format!(
                    "platform index {} out of range ({} available)",
                    config.platform_index,
                    platforms.len()
                ),
            })?;
        let device_ids = platform
            .get_devices(CL_DEVICE_TYPE_GPU)
            .map_err(|e| driver_err("clGetDeviceIDs", "unknown", e))?;
        let device_id = device_ids
            .get(config.device_index)
            .copied()
            .ok_or_else(|| Error::Driver {
                call: "clGetDeviceIDs",
                device: "unknown".into(),
                detail: format!(
                    "device index {} out of range ({} available)",
                    config.device_index,
                    device_ids.len()
                ),
            })?;
        let device = Device::new(device_id);
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        let context = Context::from_device(&device)
            .map_err(|e| driver_err("clCreateContext", &device_name, e))?;
        let queue = CommandQueue::create_default_with_properties(&context, 0, 0)
            .map_err(|e| driver_err("clCreateCommandQueue", &device_name, e))?;
        info!(device = %device_name, "opened OpenCL device");
        Ok(Self {
            device_name,
            context,
            queue,
            source_provider,
            inner: Mutex::new(ClInner {
                buffers: HashMap::new(),
                next_id: 1,
                kernels: Vec::new(),
                by_name: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Prepares kernel source for `key`: substitutes the element type and
    /// enables the fp64 extension when needed.
    fn specialize_source(source: &str, elem: Elem) -> String {
        let body = source.replace("Dtype", elem.cl_type());
        if elem == Elem::F64 {
            format!("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n{body}")
        } else {
            body
        }
    }

    fn compile(&self, key: &KernelKey, source: &str) -> Result<Kernel> {
        let specialized = Self::specialize_source(source, key.elem);
        let program = Program::create_and_build_from_source(&self.context, &specialized, "")
            .map_err(|e| driver_err("clBuildProgram", &self.device_name, e))?;
        Kernel::create(&program, &key.name())
            .map_err(|e| driver_err("clCreateKernel", &self.device_name, e))
    }
}

impl ComputeBackend for OpenClBackend {
    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn create_buffer(&self, bytes: usize) -> Result<BufferHandle> {
        let buffer = unsafe {
            Buffer::<u8>::create(&self.context, CL_MEM_READ_WRITE, bytes, std::ptr::null_mut())
                .map_err(|e| driver_err("clCreateBuffer", &self.device_name, e))?
        };
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.buffers.insert(id, ClAlloc::Root(buffer));
        debug!(buffer = id, bytes, "created device buffer");
        Ok(BufferHandle(id))
    }

    fn release_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let mut inner = self.lock();
        match inner.buffers.remove(&buffer.0) {
            Some(ClAlloc::Root(_)) => Ok(()),
            Some(view @ ClAlloc::View(_)) => {
                inner.buffers.insert(buffer.0, view);
                Err(driver_err(
                    "clReleaseMemObject",
                    &self.device_name,
                    format!("buffer {} is a sub-buffer view", buffer.0),
                ))
            }
            None => Err(driver_err(
                "clReleaseMemObject",
                &self.device_name,
                format!("unknown buffer {}", buffer.0),
            )),
        }
    }

    fn create_sub_buffer(
        &self,
        parent: BufferHandle,
        offset: usize,
        bytes: usize,
    ) -> Result<BufferHandle> {
        let mut inner = self.lock();
        let view = {
            let alloc = inner.buffers.get(&parent.0).ok_or_else(|| {
                driver_err(
                    "clCreateSubBuffer",
                    &self.device_name,
                    format!("unknown parent buffer {}", parent.0),
                )
            })?;
            unsafe {
                alloc
                    .buffer()
                    .create_sub_buffer(CL_MEM_READ_WRITE, offset, bytes)
                    .map_err(|e| driver_err("clCreateSubBuffer", &self.device_name, e))?
            }
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.buffers.insert(id, ClAlloc::View(view));
        Ok(BufferHandle(id))
    }

    fn release_sub_buffer(&self, view: BufferHandle) -> Result<()> {
        let mut inner = self.lock();
        match inner.buffers.remove(&view.0) {
            Some(ClAlloc::View(_)) => Ok(()),
            Some(root @ ClAlloc::Root(_)) => {
                inner.buffers.insert(view.0, root);
                Err(driver_err(
                    "clReleaseMemObject",
                    &self.device_name,
                    format!("buffer {} is not a sub-buffer", view.0),
                ))
            }
            None => Err(driver_err(
                "clReleaseMemObject",
                &self.device_name,
                format!("unknown sub-buffer {}", view.0),
            )),
        }
    }

    fn write(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let alloc = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::Transfer(format!("unknown buffer {}", buffer.0)))?;
        unsafe {
            self.queue
                .enqueue_write_buffer(alloc.buffer_mut(), CL_BLOCKING, offset, data, &[])
                .map_err(|e| Error::Transfer(format!("clEnqueueWriteBuffer: {e}")))?;
        }
        Ok(())
    }

    fn read(&self, buffer: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        let inner = self.lock();
        let alloc = inner
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| Error::Transfer(format!("unknown buffer {}", buffer.0)))?;
        unsafe {
            self.queue
                .enqueue_read_buffer(alloc.buffer(), CL_BLOCKING, offset, out, &[])
                .map_err(|e| Error::Transfer(format!("clEnqueueReadBuffer: {e}")))?;
        }
        Ok(())
    }

    fn copy(
        &self,
        src: BufferHandle,
        src_offset: usize,
        dst: BufferHandle,
        dst_offset: usize,
        bytes: usize,
    ) -> Result<()> {
        // Staged through the host: clEnqueueCopyBuffer needs simultaneous
        // shared and mutable access to the handle table when src == dst's
        // root, and these copies are rare enough not to matter.
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
        let mut inner = self.lock();
        let alloc = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::Transfer(format!("unknown buffer {}", buffer.0)))?;
        let event = unsafe {
            self.queue
                .enqueue_fill_buffer(alloc.buffer_mut(), pattern, offset, bytes, &[])
                .map_err(|e| Error::Transfer(format!("clEnqueueFillBuffer: {e}")))?
        };
        event
            .wait()
            .map_err(|e| Error::Transfer(format!("clWaitForEvents: {e}")))
    }

    fn kernel(&self, key: &KernelKey) -> Option<KernelHandle> {
        let name = key.name();
        if let Some(handle) = self.lock().by_name.get(&name) {
            return Some(*handle);
        }
        let source = (self.source_provider)(key)?;
        match self.compile(key, &source) {
            Ok(kernel) => {
                let mut inner = self.lock();
                let handle = KernelHandle(inner.kernels.len() as u64);
                inner.kernels.push(kernel);
                inner.by_name.insert(name.clone(), handle);
                info!(kernel = %name, "compiled OpenCL kernel");
                Some(handle)
            }
            Err(e) => {
                warn!(kernel = %name, error = %e, "kernel compilation failed");
                None
            }
        }
    }

    fn enqueue(
        &self,
        kernel: KernelHandle,
        geometry: &LaunchGeometry,
        args: &[BoundArg],
    ) -> Result<()> {
        let inner = self.lock();
        let kernel = inner
            .kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| Error::KernelMissing {
                name: format!("handle {}", kernel.0),
            })?;
        let event = unsafe {
            let mut exec = ExecuteKernel::new(kernel);
            for (index, arg) in args.iter().enumerate() {
                match arg {
                    BoundArg::Scalar(ScalarArg::I32(v)) => {
                        exec.set_arg(v);
                    }
                    BoundArg::Scalar(ScalarArg::U32(v)) => {
                        exec.set_arg(v);
                    }
                    BoundArg::Scalar(ScalarArg::F32(v)) => {
                        exec.set_arg(v);
                    }
                    BoundArg::Scalar(ScalarArg::F64(v)) => {
                        exec.set_arg(v);
                    }
                    BoundArg::Buffer(handle) => {
                        let alloc = inner.buffers.get(&handle.0).ok_or_else(|| {
                            Error::ArgumentBinding {
                                index,
                                reason: format!("unknown buffer {}", handle.0),
                            }
                        })?;
                        exec.set_arg(&alloc.buffer().get());
                    }
                }
            }
            exec.set_global_work_sizes(&geometry.global)
                .set_local_work_sizes(&geometry.local)
                .enqueue_nd_range(&self.queue)
                .map_err(|e| driver_err("clEnqueueNDRangeKernel", &self.device_name, e))?
        };
        event
            .wait()
            .map_err(|e| driver_err("clWaitForEvents", &self.device_name, e))
    }
}
