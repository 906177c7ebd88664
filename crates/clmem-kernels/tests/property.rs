//! Property tests for the reshape kernels.

use clmem_common::DispatchConfig;
use clmem_kernels::{cpu, host_runtime, reshape, ConvParams};
use proptest::prelude::*;

fn arb_params() -> impl Strategy<Value = ConvParams> {
    (1usize..=3, 3usize..=10, 3usize..=10, 1usize..=3, 1usize..=3, 0usize..=2, 0usize..=2, 1usize..=3, 1usize..=3)
        .prop_filter_map("window must fit the padded input", |(c, h, w, kh, kw, ph, pw, sh, sw)| {
            let p = ConvParams {
                channels: c,
                height: h,
                width: w,
                kernel_h: kh,
                kernel_w: kw,
                pad_h: ph,
                pad_w: pw,
                stride_h: sh,
                stride_w: sw,
            };
            if kh <= h + 2 * ph && kw <= w + 2 * pw {
                Some(p)
            } else {
                None
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn dispatched_im2col_matches_reference(p in arb_params(), seed in 0u64..1000) {
        let rt = host_runtime(DispatchConfig::default());
        let image: Vec<f32> = (0..p.image_len())
            .map(|i| ((i as u64).wrapping_mul(seed + 1) % 97) as f32)
            .collect();
        let src = rt.allocator().alloc::<f32>(p.image_len()).unwrap();
        let dst = rt.allocator().alloc::<f32>(p.col_len()).unwrap();
        rt.allocator().upload(src, &image).unwrap();
        reshape::im2col::<f32>(&rt, src, &p, dst).unwrap();
        let col = rt.allocator().download::<f32>(dst, p.col_len()).unwrap();

        let mut expect = vec![0.0f32; p.col_len()];
        cpu::im2col(&image, &p, &mut expect);
        prop_assert_eq!(col, expect);
    }

    #[test]
    fn round_trip_is_identity_without_overlap(
        c in 1usize..=3,
        tiles_h in 1usize..=4,
        tiles_w in 1usize..=4,
        kh in 1usize..=3,
        kw in 1usize..=3,
        seed in 0u64..1000,
    ) {
        // stride == kernel size and no padding tiles the image exactly,
        // so fold(expand(x)) == x.
        let p = ConvParams {
            channels: c,
            height: tiles_h * kh,
            width: tiles_w * kw,
            kernel_h: kh,
            kernel_w: kw,
            pad_h: 0,
            pad_w: 0,
            stride_h: kh,
            stride_w: kw,
        };
        let rt = host_runtime(DispatchConfig::default());
        let image: Vec<f32> = (0..p.image_len())
            .map(|i| ((i as u64).wrapping_mul(seed + 7) % 89) as f32)
            .collect();
        let src = rt.allocator().alloc::<f32>(p.image_len()).unwrap();
        let col = rt.allocator().alloc::<f32>(p.col_len()).unwrap();
        rt.allocator().upload(src, &image).unwrap();
        reshape::im2col::<f32>(&rt, src, &p, col).unwrap();
        rt.allocator().memset(src, 0.0f32, p.image_len()).unwrap();
        reshape::col2im::<f32>(&rt, col, &p, src).unwrap();
        let back = rt.allocator().download::<f32>(src, p.image_len()).unwrap();
        prop_assert_eq!(back, image);
    }

    #[test]
    fn col2im_total_mass_counts_window_coverage(p in arb_params()) {
        // Folding the expansion of an all-ones image yields, per pixel, the
        // number of windows covering it; summed over the image this equals
        // the number of in-bounds column cells.
        let image = vec![1.0f32; p.image_len()];
        let mut col = vec![0.0f32; p.col_len()];
        cpu::im2col(&image, &p, &mut col);
        let mut back = vec![0.0f32; p.image_len()];
        cpu::col2im(&col, &p, &mut back);
        let mass: f32 = back.iter().sum();
        let cells: f32 = col.iter().sum();
        prop_assert_eq!(mass, cells);
    }
}
