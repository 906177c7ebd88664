//! Runtime-level integration: allocation, transfers, and dispatch of a
//! registered kernel through the full binder path.

use std::sync::Arc;

use anyhow::Result;
use clmem_common::{DispatchConfig, Elem};
use clmem_core::{
    ComputeBackend, HostBackend, HostCall, KernelArg, KernelKey, LaunchGeometry, Runtime,
};

fn saxpy_runtime() -> (Arc<HostBackend>, Runtime) {
    let backend = Arc::new(HostBackend::new());
    let key = KernelKey::new("saxpy", Elem::F32);
    backend.register_kernel(
        key,
        Arc::new(|call: &HostCall<'_>| {
            let n = call.scalar_i32(0)? as usize;
            let a = call.scalar_f32(1)?;
            let x: Vec<f32> = clmem_common::from_bytes(&call.read_buffer(2)?);
            let y_bytes = call.read_buffer(3)?;
            let mut y: Vec<f32> = clmem_common::from_bytes(&y_bytes);
            for i in 0..n {
                y[i] += a * x[i];
            }
            call.write_buffer(3, &clmem_common::to_bytes(&y))
        }),
    );
    let rt = Runtime::new(
        backend.clone() as Arc<dyn ComputeBackend>,
        DispatchConfig::default(),
    );
    (backend, rt)
}

#[test]
fn full_dispatch_path() -> Result<()> {
    let (_backend, rt) = saxpy_runtime();
    let x = rt.allocator().alloc::<f32>(4)?;
    let y = rt.allocator().alloc::<f32>(4)?;
    rt.allocator().upload(x, &[1.0f32, 2.0, 3.0, 4.0])?;
    rt.allocator().upload(y, &[10.0f32, 10.0, 10.0, 10.0])?;
    rt.launch(
        &KernelKey::new("saxpy", Elem::F32),
        &LaunchGeometry::flat(4, rt.config().local_size),
        &[
            KernelArg::I32(4),
            KernelArg::F32(2.0),
            KernelArg::Ptr(x),
            KernelArg::Ptr(y),
        ],
    )?;
    let out = rt.allocator().download::<f32>(y, 4)?;
    assert_eq!(out, vec![12.0, 14.0, 16.0, 18.0]);
    Ok(())
}

#[test]
fn dispatch_with_sliced_operand_cleans_up_views() -> Result<()> {
    let (backend, rt) = saxpy_runtime();
    let x = rt.allocator().alloc::<f32>(8)?;
    let y = rt.allocator().alloc::<f32>(4)?;
    rt.allocator()
        .upload(x, &[0.0f32, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0])?;
    rt.allocator().memset(y, 0.0f32, 4)?;
    let x_hi = rt.allocator().slice(x, 4 * std::mem::size_of::<f32>())?;
    rt.launch(
        &KernelKey::new("saxpy", Elem::F32),
        &LaunchGeometry::flat(4, rt.config().local_size),
        &[
            KernelArg::I32(4),
            KernelArg::F32(2.0),
            KernelArg::Ptr(x_hi),
            KernelArg::Ptr(y),
        ],
    )?;
    assert_eq!(backend.live_sub_buffer_count(), 0);
    assert_eq!(rt.allocator().download::<f32>(y, 4)?, vec![2.0; 4]);
    Ok(())
}

#[test]
fn freed_pointer_cannot_be_dispatched() {
    let (_backend, rt) = saxpy_runtime();
    let x = rt.allocator().alloc::<f32>(4).unwrap();
    let y = rt.allocator().alloc::<f32>(4).unwrap();
    rt.allocator().free(x).unwrap();
    let result = rt.launch(
        &KernelKey::new("saxpy", Elem::F32),
        &LaunchGeometry::flat(4, 64),
        &[
            KernelArg::I32(4),
            KernelArg::F32(2.0),
            KernelArg::Ptr(x),
            KernelArg::Ptr(y),
        ],
    );
    assert!(result.is_err());
}
