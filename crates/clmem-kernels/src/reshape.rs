//! Dispatch of the im2col/col2im reshape kernels.
//!
//! Each function validates its geometry, computes the launch shape, and
//! hands the call to the runtime's binder with the kernel's argument list
//! in the order the device sources declare them. Pointer arguments may be
//! derived slices; the binder turns nonzero offsets into sub-buffer views
//! for the duration of the call.

use clmem_common::{Error, Numeric, OptLevel, Result};
use clmem_core::{KernelArg, KernelKey, LaunchGeometry, Runtime, VirtualPtr};
use tracing::debug;

/// Geometry of one im2col/col2im problem: a `channels x height x width`
/// image, a sliding window, symmetric zero padding, and strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
}

impl ConvParams {
    /// Number of window positions along the height axis.
    pub fn height_col(&self) -> usize {
        (self.height + 2 * self.pad_h - self.kernel_h) / self.stride_h + 1
    }

    /// Number of window positions along the width axis.
    pub fn width_col(&self) -> usize {
        (self.width + 2 * self.pad_w - self.kernel_w) / self.stride_w + 1
    }

    /// Elements in one image block.
    pub fn image_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Elements in one column block.
    pub fn col_len(&self) -> usize {
        self.channels * self.kernel_h * self.kernel_w * self.height_col() * self.width_col()
    }

    fn validate(&self) -> Result<()> {
        if self.stride_h == 0 || self.stride_w == 0 {
            return Err(Error::InvalidArguments {
                reason: "stride must be nonzero".into(),
            });
        }
        if self.kernel_h == 0 || self.kernel_w == 0 {
            return Err(Error::InvalidArguments {
                reason: "kernel size must be nonzero".into(),
            });
        }
        if self.kernel_h > self.height + 2 * self.pad_h
            || self.kernel_w > self.width + 2 * self.pad_w
        {
            return Err(Error::InvalidArguments {
                reason: format!(
                    "{}x{} window does not fit the {}x{} padded input",
                    self.kernel_h,
                    self.kernel_w,
                    self.height + 2 * self.pad_h,
                    self.width + 2 * self.pad_w
                ),
            });
        }
        Ok(())
    }

    fn as_args(&self) -> [KernelArg; 8] {
        [
            KernelArg::I32(self.kernel_h as i32),
            KernelArg::I32(self.kernel_w as i32),
            KernelArg::I32(self.pad_h as i32),
            KernelArg::I32(self.pad_w as i32),
            KernelArg::I32(self.stride_h as i32),
            KernelArg::I32(self.stride_w as i32),
            KernelArg::I32(self.height_col() as i32),
            KernelArg::I32(self.width_col() as i32),
        ]
    }
}

/// Expands one image into its column matrix.
pub fn im2col<T: Numeric>(
    rt: &Runtime,
    image: VirtualPtr,
    p: &ConvParams,
    col: VirtualPtr,
) -> Result<()> {
    p.validate()?;
    let n = p.channels * p.height_col() * p.width_col();
    if n == 0 {
        return Ok(());
    }
    let mut args = vec![
        KernelArg::I32(n as i32),
        KernelArg::Ptr(image),
        KernelArg::I32(p.height as i32),
        KernelArg::I32(p.width as i32),
    ];
    args.extend_from_slice(&p.as_args());
    args.push(KernelArg::Ptr(col));
    let key = KernelKey::new("im2col", T::ELEM);
    debug!(kernel = %key, n, "im2col dispatch");
    rt.launch(
        &key,
        &LaunchGeometry::flat(n, rt.config().local_size),
        &args,
    )
}

/// Expands one image found `image_step` elements into its buffer, writing
/// the columns `col_step` elements into theirs.
pub fn im2col_strided<T: Numeric>(
    rt: &Runtime,
    image: VirtualPtr,
    image_step: usize,
    p: &ConvParams,
    col: VirtualPtr,
    col_step: usize,
) -> Result<()> {
    p.validate()?;
    let n = p.channels * p.height_col() * p.width_col();
    if n == 0 {
        return Ok(());
    }
    let mut args = vec![
        KernelArg::I32(n as i32),
        KernelArg::Ptr(image),
        KernelArg::I32(image_step as i32),
        KernelArg::I32(p.height as i32),
        KernelArg::I32(p.width as i32),
    ];
    args.extend_from_slice(&p.as_args());
    args.push(KernelArg::Ptr(col));
    args.push(KernelArg::I32(col_step as i32));
    let key = KernelKey::new("im2col_strided", T::ELEM);
    debug!(kernel = %key, n, image_step, col_step, "im2col_strided dispatch");
    rt.launch(
        &key,
        &LaunchGeometry::flat(n, rt.config().local_size),
        &args,
    )
}

/// Expands `images` consecutive image blocks in one launch. The launch
/// shape follows the runtime's configured opt level: a flat 1-D grid, or a
/// 3-D grid with one plane per (image, channel) pair.
pub fn im2col_batched<T: Numeric>(
    rt: &Runtime,
    image: VirtualPtr,
    image_step: usize,
    images: usize,
    p: &ConvParams,
    col: VirtualPtr,
    col_step: usize,
) -> Result<()> {
    p.validate()?;
    let n = images * p.channels * p.height_col() * p.width_col();
    if n == 0 {
        return Ok(());
    }
    let mut args = vec![
        KernelArg::I32(n as i32),
        KernelArg::Ptr(image),
        KernelArg::I32(image_step as i32),
        KernelArg::I32(p.channels as i32),
        KernelArg::I32(p.height as i32),
        KernelArg::I32(p.width as i32),
    ];
    args.extend_from_slice(&p.as_args());
    args.push(KernelArg::Ptr(col));
    args.push(KernelArg::I32(col_step as i32));
    let local = rt.config().local_size;
    let geometry = match rt.config().opt_level {
        OptLevel::Spatial3d => {
            LaunchGeometry::spatial(p.width_col(), p.height_col(), images * p.channels, local)
        }
        OptLevel::Flat1d => LaunchGeometry::flat(n, local),
    };
    let key = KernelKey::new("im2col_batched", T::ELEM);
    debug!(kernel = %key, n, images, "im2col_batched dispatch");
    rt.launch(&key, &geometry, &args)
}

/// Masked expansion without padding or stride. `mask` holds one `i32` per
/// `(image, channel, tap_y, tap_x)`; zero entries blank the corresponding
/// column cells.
pub fn im2col_masked<T: Numeric>(
    rt: &Runtime,
    image: VirtualPtr,
    mask: VirtualPtr,
    images: usize,
    channels: usize,
    height: usize,
    width: usize,
    kernel_h: usize,
    kernel_w: usize,
    col: VirtualPtr,
) -> Result<()> {
    if kernel_h == 0 || kernel_w == 0 || kernel_h > height || kernel_w > width {
        return Err(Error::InvalidArguments {
            reason: format!("{kernel_h}x{kernel_w} window does not fit the {height}x{width} input"),
        });
    }
    let height_out = height - kernel_h + 1;
    let width_out = width - kernel_w + 1;
    let n = images * channels * height_out * width_out * kernel_h * kernel_w;
    if n == 0 {
        return Ok(());
    }
    let args = [
        KernelArg::Ptr(image),
        KernelArg::Ptr(mask),
        KernelArg::I32(images as i32),
        KernelArg::I32(channels as i32),
        KernelArg::I32(height as i32),
        KernelArg::I32(width as i32),
        KernelArg::I32(kernel_h as i32),
        KernelArg::I32(kernel_w as i32),
        KernelArg::I32(height_out as i32),
        KernelArg::I32(width_out as i32),
        KernelArg::Ptr(col),
    ];
    let key = KernelKey::new("im2col_masked", T::ELEM);
    debug!(kernel = %key, n, images, "im2col_masked dispatch");
    rt.launch(
        &key,
        &LaunchGeometry::flat(n, rt.config().mask_local_size),
        &args,
    )
}

/// Folds a column matrix back into an image, accumulating overlapping
/// window contributions. The destination is expected to be zeroed first.
pub fn col2im<T: Numeric>(
    rt: &Runtime,
    col: VirtualPtr,
    p: &ConvParams,
    image: VirtualPtr,
) -> Result<()> {
    p.validate()?;
    let n = p.image_len();
    if n == 0 {
        return Ok(());
    }
    let mut args = vec![
        KernelArg::I32(n as i32),
        KernelArg::Ptr(col),
        KernelArg::I32(p.height as i32),
        KernelArg::I32(p.width as i32),
        KernelArg::I32(p.channels as i32),
    ];
    args.extend_from_slice(&p.as_args());
    args.push(KernelArg::Ptr(image));
    let key = KernelKey::new("col2im", T::ELEM);
    debug!(kernel = %key, n, "col2im dispatch");
    rt.launch(
        &key,
        &LaunchGeometry::flat(n, rt.config().local_size),
        &args,
    )
}

/// Folds one column block found `col_step` elements into its buffer back
/// into the image `image_step` elements into its own.
pub fn col2im_strided<T: Numeric>(
    rt: &Runtime,
    col: VirtualPtr,
    col_step: usize,
    p: &ConvParams,
    image: VirtualPtr,
    image_step: usize,
) -> Result<()> {
    p.validate()?;
    let n = p.image_len();
    if n == 0 {
        return Ok(());
    }
    let mut args = vec![
        KernelArg::I32(n as i32),
        KernelArg::Ptr(col),
        KernelArg::I32(col_step as i32),
        KernelArg::I32(p.height as i32),
        KernelArg::I32(p.width as i32),
        KernelArg::I32(p.channels as i32),
    ];
    args.extend_from_slice(&p.as_args());
    args.push(KernelArg::Ptr(image));
    args.push(KernelArg::I32(image_step as i32));
    let key = KernelKey::new("col2im_strided", T::ELEM);
    debug!(kernel = %key, n, col_step, image_step, "col2im_strided dispatch");
    rt.launch(
        &key,
        &LaunchGeometry::flat(n, rt.config().local_size),
        &args,
    )
}

/// Folds `images` consecutive column blocks in one launch.
pub fn col2im_batched<T: Numeric>(
    rt: &Runtime,
    col: VirtualPtr,
    col_step: usize,
    images: usize,
    p: &ConvParams,
    image: VirtualPtr,
    image_step: usize,
) -> Result<()> {
    p.validate()?;
    let n = images * p.image_len();
    if n == 0 {
        return Ok(());
    }
    let mut args = vec![
        KernelArg::I32(n as i32),
        KernelArg::Ptr(col),
        KernelArg::I32(col_step as i32),
        KernelArg::I32(images as i32),
        KernelArg::I32(p.height as i32),
        KernelArg::I32(p.width as i32),
        KernelArg::I32(p.channels as i32),
    ];
    args.extend_from_slice(&p.as_args());
    args.push(KernelArg::Ptr(image));
    args.push(KernelArg::I32(image_step as i32));
    let key = KernelKey::new("col2im_batched", T::ELEM);
    debug!(kernel = %key, n, images, "col2im_batched dispatch");
    rt.launch(
        &key,
        &LaunchGeometry::flat(n, rt.config().local_size),
        &args,
    )
}
