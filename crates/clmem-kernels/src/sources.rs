//! OpenCL C sources for the reshape kernels.
//!
//! Templates use two placeholders: `KERNEL_NAME`, substituted here from the
//! kernel key, and `Dtype`, substituted by the backend for the concrete
//! element type at compile time. Argument lists match the dispatch order in
//! [`crate::reshape`] exactly.
//!
//! The col2im kernels gather: each work item owns one image pixel and sums
//! every column cell that maps onto it, so no atomics are needed even when
//! windows overlap.

use clmem_core::KernelKey;

/// One work item per (channel, output row, output column); the item walks
/// the window and writes `kernel_h * kernel_w` column cells.
const IM2COL_SRC: &str = r#"
__kernel void KERNEL_NAME(
    const int n, __global const Dtype* data_im,
    const int height, const int width,
    const int kernel_h, const int kernel_w,
    const int pad_h, const int pad_w,
    const int stride_h, const int stride_w,
    const int height_col, const int width_col,
    __global Dtype* data_col) {
  int index = get_global_id(0);
  if (index >= n) return;
  int w_out = index % width_col;
  int h_index = index / width_col;
  int h_out = h_index % height_col;
  int channel_in = h_index / height_col;
  int channel_out = channel_in * kernel_h * kernel_w;
  int h_in = h_out * stride_h - pad_h;
  int w_in = w_out * stride_w - pad_w;
  __global Dtype* col_ptr =
      data_col + (channel_out * height_col + h_out) * width_col + w_out;
  __global const Dtype* im_ptr =
      data_im + (channel_in * height + h_in) * width + w_in;
  for (int i = 0; i < kernel_h; ++i) {
    for (int j = 0; j < kernel_w; ++j) {
      int h = h_in + i;
      int w = w_in + j;
      *col_ptr = (h >= 0 && w >= 0 && h < height && w < width)
          ? im_ptr[i * width + j] : (Dtype)0;
      col_ptr += height_col * width_col;
    }
  }
}
"#;

/// im2col over one image located `im_step` elements into its buffer.
const IM2COL_STRIDED_SRC: &str = r#"
__kernel void KERNEL_NAME(
    const int n, __global const Dtype* data_im, const int im_step,
    const int height, const int width,
    const int kernel_h, const int kernel_w,
    const int pad_h, const int pad_w,
    const int stride_h, const int stride_w,
    const int height_col, const int width_col,
    __global Dtype* data_col, const int col_step) {
  int index = get_global_id(0);
  if (index >= n) return;
  data_im += im_step;
  data_col += col_step;
  int w_out = index % width_col;
  int h_index = index / width_col;
  int h_out = h_index % height_col;
  int channel_in = h_index / height_col;
  int channel_out = channel_in * kernel_h * kernel_w;
  int h_in = h_out * stride_h - pad_h;
  int w_in = w_out * stride_w - pad_w;
  __global Dtype* col_ptr =
      data_col + (channel_out * height_col + h_out) * width_col + w_out;
  __global const Dtype* im_ptr =
      data_im + (channel_in * height + h_in) * width + w_in;
  for (int i = 0; i < kernel_h; ++i) {
    for (int j = 0; j < kernel_w; ++j) {
      int h = h_in + i;
      int w = w_in + j;
      *col_ptr = (h >= 0 && w >= 0 && h < height && w < width)
          ? im_ptr[i * width + j] : (Dtype)0;
      col_ptr += height_col * width_col;
    }
  }
}
"#;

/// Batched im2col. Accepts either launch shape: with a 3-D grid the item
/// coordinates name (column, row, image*channel plane) directly; with a
/// 1-D grid the flat index is decomposed the same way.
const IM2COL_BATCHED_SRC: &str = r#"
__kernel void KERNEL_NAME(
    const int n, __global const Dtype* data_im, const int im_step,
    const int channels,
    const int height, const int width,
    const int kernel_h, const int kernel_w,
    const int pad_h, const int pad_w,
    const int stride_h, const int stride_w,
    const int height_col, const int width_col,
    __global Dtype* data_col, const int col_step) {
  int index;
  if (get_work_dim() == 3) {
    int x = get_global_id(0);
    if (x >= width_col) return;
    index = ((int)get_global_id(2) * height_col + (int)get_global_id(1))
        * width_col + x;
  } else {
    index = get_global_id(0);
  }
  if (index >= n) return;
  int w_out = index % width_col;
  int h_index = index / width_col;
  int h_out = h_index % height_col;
  int plane = h_index / height_col;
  int channel_in = plane % channels;
  int image = plane / channels;
  data_im += image * im_step;
  data_col += image * col_step;
  int channel_out = channel_in * kernel_h * kernel_w;
  int h_in = h_out * stride_h - pad_h;
  int w_in = w_out * stride_w - pad_w;
  __global Dtype* col_ptr =
      data_col + (channel_out * height_col + h_out) * width_col + w_out;
  __global const Dtype* im_ptr =
      data_im + (channel_in * height + h_in) * width + w_in;
  for (int i = 0; i < kernel_h; ++i) {
    for (int j = 0; j < kernel_w; ++j) {
      int h = h_in + i;
      int w = w_in + j;
      *col_ptr = (h >= 0 && w >= 0 && h < height && w < width)
          ? im_ptr[i * width + j] : (Dtype)0;
      col_ptr += height_col * width_col;
    }
  }
}
"#;

/// Masked im2col without padding or stride: one work item per column cell,
/// blanked when the (image, channel, tap) mask entry is zero.
const IM2COL_MASKED_SRC: &str = r#"
__kernel void KERNEL_NAME(
    __global const Dtype* data_im, __global const int* mask,
    const int images, const int channels,
    const int height, const int width,
    const int kernel_h, const int kernel_w,
    const int height_out, const int width_out,
    __global Dtype* data_col) {
  int index = get_global_id(0);
  int total = images * channels * height_out * width_out * kernel_h * kernel_w;
  if (index >= total) return;
  int kx = index % kernel_w;
  int i = index / kernel_w;
  int ky = i % kernel_h;
  i /= kernel_h;
  int x = i % width_out;
  i /= width_out;
  int y = i % height_out;
  i /= height_out;
  int c = i % channels;
  int image = i / channels;
  int col_chan = (c * kernel_h + ky) * kernel_w + kx;
  int col_step = channels * kernel_h * kernel_w * height_out * width_out;
  int out = image * col_step + (col_chan * height_out + y) * width_out + x;
  int tap = ((image * channels + c) * kernel_h + ky) * kernel_w + kx;
  if (mask[tap] != 0) {
    data_col[out] =
        data_im[((image * channels + c) * height + y + ky) * width + x + kx];
  } else {
    data_col[out] = (Dtype)0;
  }
}
"#;

/// One work item per image pixel, gathering every column cell whose window
/// covers it. Accumulates into the destination.
const COL2IM_SRC: &str = r#"
__kernel void KERNEL_NAME(
    const int n, __global const Dtype* data_col,
    const int height, const int width, const int channels,
    const int kernel_h, const int kernel_w,
    const int pad_h, const int pad_w,
    const int stride_h, const int stride_w,
    const int height_col, const int width_col,
    __global Dtype* data_im) {
  int index = get_global_id(0);
  if (index >= n) return;
  Dtype val = 0;
  int w = index % width + pad_w;
  int h = (index / width) % height + pad_h;
  int c = index / (width * height);
  int w_col_start = (w < kernel_w) ? 0 : (w - kernel_w) / stride_w + 1;
  int w_col_end = min(w / stride_w + 1, width_col);
  int h_col_start = (h < kernel_h) ? 0 : (h - kernel_h) / stride_h + 1;
  int h_col_end = min(h / stride_h + 1, height_col);
  for (int h_col = h_col_start; h_col < h_col_end; ++h_col) {
    for (int w_col = w_col_start; w_col < w_col_end; ++w_col) {
      int c_col = c * kernel_h * kernel_w
          + (h - h_col * stride_h) * kernel_w + (w - w_col * stride_w);
      val += data_col[(c_col * height_col + h_col) * width_col + w_col];
    }
  }
  data_im[index] += val;
}
"#;

/// col2im over one column block located `col_step` elements into its buffer.
const COL2IM_STRIDED_SRC: &str = r#"
__kernel void KERNEL_NAME(
    const int n, __global const Dtype* data_col, const int col_step,
    const int height, const int width, const int channels,
    const int kernel_h, const int kernel_w,
    const int pad_h, const int pad_w,
    const int stride_h, const int stride_w,
    const int height_col, const int width_col,
    __global Dtype* data_im, const int im_step) {
  int index = get_global_id(0);
  if (index >= n) return;
  data_col += col_step;
  data_im += im_step;
  Dtype val = 0;
  int w = index % width + pad_w;
  int h = (index / width) % height + pad_h;
  int c = index / (width * height);
  int w_col_start = (w < kernel_w) ? 0 : (w - kernel_w) / stride_w + 1;
  int w_col_end = min(w / stride_w + 1, width_col);
  int h_col_start = (h < kernel_h) ? 0 : (h - kernel_h) / stride_h + 1;
  int h_col_end = min(h / stride_h + 1, height_col);
  for (int h_col = h_col_start; h_col < h_col_end; ++h_col) {
    for (int w_col = w_col_start; w_col < w_col_end; ++w_col) {
      int c_col = c * kernel_h * kernel_w
          + (h - h_col * stride_h) * kernel_w + (w - w_col * stride_w);
      val += data_col[(c_col * height_col + h_col) * width_col + w_col];
    }
  }
  data_im[index] += val;
}
"#;

/// Batched col2im: the flat index covers every pixel of every image block.
const COL2IM_BATCHED_SRC: &str = r#"
__kernel void KERNEL_NAME(
    const int n, __global const Dtype* data_col, const int col_step,
    const int images,
    const int height, const int width, const int channels,
    const int kernel_h, const int kernel_w,
    const int pad_h, const int pad_w,
    const int stride_h, const int stride_w,
    const int height_col, const int width_col,
    __global Dtype* data_im, const int im_step) {
  int index = get_global_id(0);
  if (index >= n) return;
  int pixels = channels * height * width;
  int image = index / pixels;
  index = index % pixels;
  data_col += image * col_step;
  data_im += image * im_step;
  Dtype val = 0;
  int w = index % width + pad_w;
  int h = (index / width) % height + pad_h;
  int c = index / (width * height);
  int w_col_start = (w < kernel_w) ? 0 : (w - kernel_w) / stride_w + 1;
  int w_col_end = min(w / stride_w + 1, width_col);
  int h_col_start = (h < kernel_h) ? 0 : (h - kernel_h) / stride_h + 1;
  int h_col_end = min(h / stride_h + 1, height_col);
  for (int h_col = h_col_start; h_col < h_col_end; ++h_col) {
    for (int w_col = w_col_start; w_col < w_col_end; ++w_col) {
      int c_col = c * kernel_h * kernel_w
          + (h - h_col * stride_h) * kernel_w + (w - w_col * stride_w);
      val += data_col[(c_col * height_col + h_col) * width_col + w_col];
    }
  }
  data_im[index] += val;
}
"#;

/// Source template for a kernel base name, before name and element-type
/// substitution.
pub fn template_for(base: &str) -> Option<&'static str> {
    match base {
        "im2col" => Some(IM2COL_SRC),
        "im2col_strided" => Some(IM2COL_STRIDED_SRC),
        "im2col_batched" => Some(IM2COL_BATCHED_SRC),
        "im2col_masked" => Some(IM2COL_MASKED_SRC),
        "col2im" => Some(COL2IM_SRC),
        "col2im_strided" => Some(COL2IM_STRIDED_SRC),
        "col2im_batched" => Some(COL2IM_BATCHED_SRC),
        _ => None,
    }
}

/// Fully named source for a kernel key; `Dtype` is left for the backend.
pub fn source_for(key: &KernelKey) -> Option<String> {
    template_for(key.base).map(|t| t.replace("KERNEL_NAME", &key.name()))
}
