//! Host-backend registration of the reshape kernels.
//!
//! Each body decodes the same positional argument list the device sources
//! declare, then runs the CPU reference implementation from [`crate::cpu`].
//! Registered for every supported element type, so a host runtime executes
//! any dispatch the device path would.

use std::sync::Arc;

use clmem_common::{from_bytes, to_bytes, DispatchConfig, Error, Numeric, Result};
use clmem_core::{ComputeBackend, HostBackend, HostCall, KernelKey, Runtime};

use crate::cpu;
use crate::reshape::ConvParams;

fn take<T: Numeric>(call: &HostCall<'_>, index: usize, len: usize) -> Result<Vec<T>> {
    let bytes = call.read_buffer(index)?;
    let values: Vec<T> = from_bytes(&bytes);
    if values.len() < len {
        return Err(Error::ArgumentBinding {
            index,
            reason: format!("buffer holds {} elements, kernel needs {len}", values.len()),
        });
    }
    Ok(values)
}

fn params_from(call: &HostCall<'_>, channels: usize, base: usize) -> Result<ConvParams> {
    Ok(ConvParams {
        channels,
        height: call.scalar_i32(base)? as usize,
        width: call.scalar_i32(base + 1)? as usize,
        kernel_h: call.scalar_i32(base + 2)? as usize,
        kernel_w: call.scalar_i32(base + 3)? as usize,
        pad_h: call.scalar_i32(base + 4)? as usize,
        pad_w: call.scalar_i32(base + 5)? as usize,
        stride_h: call.scalar_i32(base + 6)? as usize,
        stride_w: call.scalar_i32(base + 7)? as usize,
    })
}

fn register_for<T: Numeric>(backend: &HostBackend) {
    // im2col: [n, image, height, width, kh, kw, ph, pw, sh, sw, hc, wc, col]
    backend.register_kernel(
        KernelKey::new("im2col", T::ELEM),
        Arc::new(|call: &HostCall<'_>| {
            let n = call.scalar_i32(0)? as usize;
            let hc = call.scalar_i32(10)? as usize;
            let wc = call.scalar_i32(11)? as usize;
            let p = params_from(call, n / (hc * wc), 2)?;
            let image = take::<T>(call, 1, p.image_len())?;
            let mut col = take::<T>(call, 12, p.col_len())?;
            cpu::im2col(&image[..p.image_len()], &p, &mut col[..p.col_len()]);
            call.write_buffer(12, &to_bytes(&col))
        }),
    );

    // im2col_strided:
    // [n, image, image_step, height, width, kh, kw, ph, pw, sh, sw, hc, wc, col, col_step]
    backend.register_kernel(
        KernelKey::new("im2col_strided", T::ELEM),
        Arc::new(|call: &HostCall<'_>| {
            let n = call.scalar_i32(0)? as usize;
            let image_step = call.scalar_i32(2)? as usize;
            let hc = call.scalar_i32(11)? as usize;
            let wc = call.scalar_i32(12)? as usize;
            let col_step = call.scalar_i32(14)? as usize;
            let p = params_from(call, n / (hc * wc), 3)?;
            let image = take::<T>(call, 1, image_step + p.image_len())?;
            let mut col = take::<T>(call, 13, col_step + p.col_len())?;
            cpu::im2col(
                &image[image_step..image_step + p.image_len()],
                &p,
                &mut col[col_step..col_step + p.col_len()],
            );
            call.write_buffer(13, &to_bytes(&col))
        }),
    );

    // im2col_batched:
    // [n, image, image_step, channels, height, width, kh, kw, ph, pw, sh, sw, hc, wc, col, col_step]
    backend.register_kernel(
        KernelKey::new("im2col_batched", T::ELEM),
        Arc::new(|call: &HostCall<'_>| {
            let n = call.scalar_i32(0)? as usize;
            let image_step = call.scalar_i32(2)? as usize;
            let channels = call.scalar_i32(3)? as usize;
            let hc = call.scalar_i32(12)? as usize;
            let wc = call.scalar_i32(13)? as usize;
            let col_step = call.scalar_i32(15)? as usize;
            let images = n / (channels * hc * wc);
            let p = params_from(call, channels, 4)?;
            let image = take::<T>(call, 1, (images - 1) * image_step + p.image_len())?;
            let mut col = take::<T>(call, 14, (images - 1) * col_step + p.col_len())?;
            cpu::im2col_batched(&image, images, image_step, &p, &mut col, col_step);
            call.write_buffer(14, &to_bytes(&col))
        }),
    );

    // im2col_masked:
    // [image, mask, images, channels, height, width, kh, kw, h_out, w_out, col]
    backend.register_kernel(
        KernelKey::new("im2col_masked", T::ELEM),
        Arc::new(|call: &HostCall<'_>| {
            let images = call.scalar_i32(2)? as usize;
            let channels = call.scalar_i32(3)? as usize;
            let height = call.scalar_i32(4)? as usize;
            let width = call.scalar_i32(5)? as usize;
            let kernel_h = call.scalar_i32(6)? as usize;
            let kernel_w = call.scalar_i32(7)? as usize;
            let height_out = call.scalar_i32(8)? as usize;
            let width_out = call.scalar_i32(9)? as usize;
            let image = take::<T>(call, 0, images * channels * height * width)?;
            let mask = take::<i32>(call, 1, images * channels * kernel_h * kernel_w)?;
            let col_len = images * channels * kernel_h * kernel_w * height_out * width_out;
            let mut col = take::<T>(call, 10, col_len)?;
            cpu::im2col_masked(
                &image, &mask, images, channels, height, width, kernel_h, kernel_w,
                &mut col[..col_len],
            );
            call.write_buffer(10, &to_bytes(&col))
        }),
    );

    // col2im: [n, col, height, width, channels, kh, kw, ph, pw, sh, sw, hc, wc, image]
    backend.register_kernel(
        KernelKey::new("col2im", T::ELEM),
        Arc::new(|call: &HostCall<'_>| {
            let channels = call.scalar_i32(4)? as usize;
            let p = params_from_col2im(call, channels, 2, 5)?;
            let col = take::<T>(call, 1, p.col_len())?;
            let mut image = take::<T>(call, 13, p.image_len())?;
            cpu::col2im(&col[..p.col_len()], &p, &mut image[..p.image_len()]);
            call.write_buffer(13, &to_bytes(&image))
        }),
    );

    // col2im_strided:
    // [n, col, col_step, height, width, channels, kh, kw, ph, pw, sh, sw, hc, wc, image, image_step]
    backend.register_kernel(
        KernelKey::new("col2im_strided", T::ELEM),
        Arc::new(|call: &HostCall<'_>| {
            let col_step = call.scalar_i32(2)? as usize;
            let channels = call.scalar_i32(5)? as usize;
            let image_step = call.scalar_i32(15)? as usize;
            let p = params_from_col2im(call, channels, 3, 6)?;
            let col = take::<T>(call, 1, col_step + p.col_len())?;
            let mut image = take::<T>(call, 14, image_step + p.image_len())?;
            cpu::col2im(
                &col[col_step..col_step + p.col_len()],
                &p,
                &mut image[image_step..image_step + p.image_len()],
            );
            call.write_buffer(14, &to_bytes(&image))
        }),
    );

    // col2im_batched:
    // [n, col, col_step, images, height, width, channels, kh, kw, ph, pw, sh, sw, hc, wc, image, image_step]
    backend.register_kernel(
        KernelKey::new("col2im_batched", T::ELEM),
        Arc::new(|call: &HostCall<'_>| {
            let col_step = call.scalar_i32(2)? as usize;
            let images = call.scalar_i32(3)? as usize;
            let channels = call.scalar_i32(6)? as usize;
            let image_step = call.scalar_i32(16)? as usize;
            let p = params_from_col2im(call, channels, 4, 7)?;
            let col = take::<T>(call, 1, (images - 1) * col_step + p.col_len())?;
            let mut image = take::<T>(call, 15, (images - 1) * image_step + p.image_len())?;
            cpu::col2im_batched(&col, images, col_step, &p, &mut image, image_step);
            call.write_buffer(15, &to_bytes(&image))
        }),
    );
}

/// col2im argument lists carry `height, width` at `dims_base` and the
/// window/pad/stride block at `window_base`.
fn params_from_col2im(
    call: &HostCall<'_>,
    channels: usize,
    dims_base: usize,
    window_base: usize,
) -> Result<ConvParams> {
    Ok(ConvParams {
        channels,
        height: call.scalar_i32(dims_base)? as usize,
        width: call.scalar_i32(dims_base + 1)? as usize,
        kernel_h: call.scalar_i32(window_base)? as usize,
        kernel_w: call.scalar_i32(window_base + 1)? as usize,
        pad_h: call.scalar_i32(window_base + 2)? as usize,
        pad_w: call.scalar_i32(window_base + 3)? as usize,
        stride_h: call.scalar_i32(window_base + 4)? as usize,
        stride_w: call.scalar_i32(window_base + 5)? as usize,
    })
}

/// Registers every reshape kernel for every supported element type.
pub fn register_host_kernels(backend: &HostBackend) {
    register_for::<f32>(backend);
    register_for::<f64>(backend);
    register_for::<i32>(backend);
}

/// Builds a runtime over a host backend with all reshape kernels installed.
pub fn host_runtime(config: DispatchConfig) -> Runtime {
    let backend = HostBackend::new();
    register_host_kernels(&backend);
    Runtime::new(Arc::new(backend) as Arc<dyn ComputeBackend>, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clmem_common::Elem;

    #[test]
    fn all_variants_registered_for_all_elements() {
        let backend = HostBackend::new();
        register_host_kernels(&backend);
        for base in [
            "im2col",
            "im2col_strided",
            "im2col_batched",
            "im2col_masked",
            "col2im",
            "col2im_strided",
            "col2im_batched",
        ] {
            for elem in Elem::all() {
                assert!(
                    backend.kernel(&KernelKey::new(base, elem)).is_some(),
                    "missing {base} for {elem}"
                );
            }
        }
    }
}
