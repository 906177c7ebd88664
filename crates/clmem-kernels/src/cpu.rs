//! CPU reference implementations of the reshape kernels.
//!
//! These are the semantic ground truth: the host backend executes them
//! directly, and the device kernels in [`crate::sources`] must agree with
//! them element for element. `col2im` accumulates into the destination;
//! callers zero it first when they want a plain scatter.

use clmem_common::Numeric;

use crate::reshape::ConvParams;

/// Expands one `channels x height x width` image into the
/// `channels*kernel_h*kernel_w x height_col*width_col` column matrix.
/// Out-of-bounds taps (padding) produce zero.
pub fn im2col<T: Numeric>(image: &[T], p: &ConvParams, col: &mut [T]) {
    let height_col = p.height_col();
    let width_col = p.width_col();
    let channels_col = p.channels * p.kernel_h * p.kernel_w;
    for c in 0..channels_col {
        let w_offset = c % p.kernel_w;
        let h_offset = (c / p.kernel_w) % p.kernel_h;
        let c_im = c / p.kernel_h / p.kernel_w;
        for h in 0..height_col {
            for w in 0..width_col {
                let h_pad = (h * p.stride_h + h_offset) as isize - p.pad_h as isize;
                let w_pad = (w * p.stride_w + w_offset) as isize - p.pad_w as isize;
                let out = (c * height_col + h) * width_col + w;
                col[out] = if h_pad >= 0
                    && (h_pad as usize) < p.height
                    && w_pad >= 0
                    && (w_pad as usize) < p.width
                {
                    image[(c_im * p.height + h_pad as usize) * p.width + w_pad as usize]
                } else {
                    T::default()
                };
            }
        }
    }
}

/// Folds a column matrix back into an image, accumulating overlapping
/// contributions. The destination is not cleared here.
pub fn col2im<T: Numeric>(col: &[T], p: &ConvParams, image: &mut [T]) {
    let height_col = p.height_col();
    let width_col = p.width_col();
    let channels_col = p.channels * p.kernel_h * p.kernel_w;
    for c in 0..channels_col {
        let w_offset = c % p.kernel_w;
        let h_offset = (c / p.kernel_w) % p.kernel_h;
        let c_im = c / p.kernel_h / p.kernel_w;
        for h in 0..height_col {
            for w in 0..width_col {
                let h_pad = (h * p.stride_h + h_offset) as isize - p.pad_h as isize;
                let w_pad = (w * p.stride_w + w_offset) as isize - p.pad_w as isize;
                if h_pad >= 0
                    && (h_pad as usize) < p.height
                    && w_pad >= 0
                    && (w_pad as usize) < p.width
                {
                    let dst = (c_im * p.height + h_pad as usize) * p.width + w_pad as usize;
                    let src = (c * height_col + h) * width_col + w;
                    image[dst] = image[dst].add(col[src]);
                }
            }
        }
    }
}

/// Batched expansion: `images` consecutive image blocks of `image_step`
/// elements each, producing column blocks of `col_step` elements.
pub fn im2col_batched<T: Numeric>(
    image: &[T],
    images: usize,
    image_step: usize,
    p: &ConvParams,
    col: &mut [T],
    col_step: usize,
) {
    for i in 0..images {
        im2col(
            &image[i * image_step..i * image_step + p.image_len()],
            p,
            &mut col[i * col_step..i * col_step + p.col_len()],
        );
    }
}

/// Batched fold, accumulating per image block.
pub fn col2im_batched<T: Numeric>(
    col: &[T],
    images: usize,
    col_step: usize,
    p: &ConvParams,
    image: &mut [T],
    image_step: usize,
) {
    for i in 0..images {
        col2im(
            &col[i * col_step..i * col_step + p.col_len()],
            p,
            &mut image[i * image_step..i * image_step + p.image_len()],
        );
    }
}

/// Masked expansion over `images` image blocks without padding or stride.
/// One mask entry per `(image, channel, tap_y, tap_x)`; a zero entry forces
/// the corresponding column cell to zero.
pub fn im2col_masked<T: Numeric>(
    image: &[T],
    mask: &[i32],
    images: usize,
    channels: usize,
    height: usize,
    width: usize,
    kernel_h: usize,
    kernel_w: usize,
    col: &mut [T],
) {
    let height_out = height - kernel_h + 1;
    let width_out = width - kernel_w + 1;
    let image_step = channels * height * width;
    let col_step = channels * kernel_h * kernel_w * height_out * width_out;
    for i in 0..images {
        for c in 0..channels {
            for ky in 0..kernel_h {
                for kx in 0..kernel_w {
                    let tap = ((i * channels + c) * kernel_h + ky) * kernel_w + kx;
                    let live = mask[tap] != 0;
                    let col_chan = (c * kernel_h + ky) * kernel_w + kx;
                    for y in 0..height_out {
                        for x in 0..width_out {
                            let out = i * col_step
                                + (col_chan * height_out + y) * width_out
                                + x;
                            col[out] = if live {
                                image[i * image_step
                                    + (c * height + y + ky) * width
                                    + x
                                    + kx]
                            } else {
                                T::default()
                            };
                        }
                    }
                }
            }
        }
    }
}

/// Sets every element of `data` to the type's zero.
pub fn zero_fill<T: Numeric>(data: &mut [T]) {
    for v in data.iter_mut() {
        *v = T::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_4x4_k3_p1_s1() -> ConvParams {
        ConvParams {
            channels: 1,
            height: 4,
            width: 4,
            kernel_h: 3,
            kernel_w: 3,
            pad_h: 1,
            pad_w: 1,
            stride_h: 1,
            stride_w: 1,
        }
    }

    #[test]
    fn im2col_output_dimensions() {
        let p = params_4x4_k3_p1_s1();
        assert_eq!(p.height_col(), 4);
        assert_eq!(p.width_col(), 4);
        assert_eq!(p.col_len(), 9 * 16);
    }

    #[test]
    fn im2col_corner_taps_read_padding() {
        let p = params_4x4_k3_p1_s1();
        let image: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let mut col = vec![0.0f32; p.col_len()];
        im2col(&image, &p, &mut col);
        // Tap (0,0) of output (0,0) reads the padded corner.
        assert_eq!(col[0], 0.0);
        // Tap (1,1) of output (0,0) is the image's first pixel.
        let center_row = 1 * p.kernel_w + 1;
        assert_eq!(col[center_row * 16], 1.0);
        // Tap (2,2) of output (0,0) reads pixel (1,1).
        let br_row = 2 * p.kernel_w + 2;
        assert_eq!(col[br_row * 16], 6.0);
    }

    #[test]
    fn im2col_no_pad_unit_kernel_is_identity() {
        let p = ConvParams {
            channels: 2,
            height: 3,
            width: 3,
            kernel_h: 1,
            kernel_w: 1,
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
        };
        let image: Vec<f32> = (0..18).map(|v| v as f32).collect();
        let mut col = vec![0.0f32; p.col_len()];
        im2col(&image, &p, &mut col);
        assert_eq!(col, image);
    }

    #[test]
    fn col2im_inverts_non_overlapping_im2col() {
        // stride == kernel size, no padding: every pixel appears exactly once.
        let p = ConvParams {
            channels: 1,
            height: 4,
            width: 4,
            kernel_h: 2,
            kernel_w: 2,
            pad_h: 0,
            pad_w: 0,
            stride_h: 2,
            stride_w: 2,
        };
        let image: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let mut col = vec![0.0f32; p.col_len()];
        im2col(&image, &p, &mut col);
        let mut back = vec![0.0f32; p.image_len()];
        col2im(&col, &p, &mut back);
        assert_eq!(back, image);
    }

    #[test]
    fn col2im_accumulates_overlaps() {
        let p = params_4x4_k3_p1_s1();
        let image = vec![1.0f32; p.image_len()];
        let mut col = vec![0.0f32; p.col_len()];
        im2col(&image, &p, &mut col);
        let mut back = vec![0.0f32; p.image_len()];
        col2im(&col, &p, &mut back);
        // An interior pixel of a 4x4 image is visited by all 9 taps.
        assert_eq!(back[(1 * 4) + 1], 9.0);
        // The corner pixel is only covered by 4 of them.
        assert_eq!(back[0], 4.0);
    }

    #[test]
    fn col2im_does_not_clear_destination() {
        let p = params_4x4_k3_p1_s1();
        let col = vec![0.0f32; p.col_len()];
        let mut image = vec![5.0f32; p.image_len()];
        col2im(&col, &p, &mut image);
        assert_eq!(image, vec![5.0; 16]);
    }

    #[test]
    fn batched_matches_per_image() {
        let p = params_4x4_k3_p1_s1();
        let images: Vec<f32> = (0..32).map(|v| v as f32 * 0.5).collect();
        let mut batched = vec![0.0f32; 2 * p.col_len()];
        im2col_batched(&images, 2, p.image_len(), &p, &mut batched, p.col_len());
        for i in 0..2 {
            let mut single = vec![0.0f32; p.col_len()];
            im2col(&images[i * 16..(i + 1) * 16], &p, &mut single);
            assert_eq!(&batched[i * p.col_len()..(i + 1) * p.col_len()], &single[..]);
        }
    }

    #[test]
    fn masked_zeroes_dead_taps() {
        let (images, channels, height, width, kh, kw) = (1usize, 1usize, 3usize, 3usize, 2usize, 2usize);
        let image: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        // Kill tap (0,1), keep the rest.
        let mask = vec![1, 0, 1, 1];
        let h_out = height - kh + 1;
        let w_out = width - kw + 1;
        let mut col = vec![0.0f32; channels * kh * kw * h_out * w_out];
        im2col_masked(&image, &mask, images, channels, height, width, kh, kw, &mut col);
        let cells = h_out * w_out;
        // Tap (0,0) at output (0,0) reads pixel (0,0).
        assert_eq!(col[0], 1.0);
        // Tap (0,1) is masked out everywhere.
        assert_eq!(&col[cells..2 * cells], &[0.0; 4]);
        // Tap (1,0) at output (0,0) reads pixel (1,0).
        assert_eq!(col[2 * cells], 4.0);
    }

    #[test]
    fn integer_elements_accumulate_exactly() {
        let p = params_4x4_k3_p1_s1();
        let image = vec![1i32; p.image_len()];
        let mut col = vec![0i32; p.col_len()];
        im2col(&image, &p, &mut col);
        let mut back = vec![0i32; p.image_len()];
        col2im(&col, &p, &mut back);
        assert_eq!(back[5], 9);
    }
}
