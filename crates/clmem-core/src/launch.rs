//! Launch geometry for kernel dispatch.
//!
//! Two shapes cover every kernel here: a flat 1-D launch where one work item
//! handles one output element, and a 3-D launch that keeps the fastest-moving
//! output dimension contiguous inside a work-group.

use clmem_common::round_up;

/// Global and local work sizes for one enqueue. Global sizes are always
/// rounded up to a multiple of the local size, so kernels guard with an
/// index check against the true element count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub global: Vec<usize>,
    pub local: Vec<usize>,
}

impl LaunchGeometry {
    /// Flat 1-D launch over `n` elements with work-groups of `local_size`.
    pub fn flat(n: usize, local_size: usize) -> Self {
        Self {
            global: vec![round_up(n, local_size)],
            local: vec![local_size],
        }
    }

    /// 3-D launch: `width` along dimension 0 (padded to `local_size`),
    /// `height` and `planes` with unit-sized groups. Used by the spatial
    /// batched kernels so adjacent work items touch adjacent output columns.
    pub fn spatial(width: usize, height: usize, planes: usize, local_size: usize) -> Self {
        Self {
            global: vec![round_up(width, local_size), height, planes],
            local: vec![local_size, 1, 1],
        }
    }

    pub fn dims(&self) -> usize {
        self.global.len()
    }

    /// Total number of work items enqueued (including padding).
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_rounds_global_up() {
        let g = LaunchGeometry::flat(100, 64);
        assert_eq!(g.global, vec![128]);
        assert_eq!(g.local, vec![64]);
    }

    #[test]
    fn flat_exact_multiple_unchanged() {
        let g = LaunchGeometry::flat(256, 64);
        assert_eq!(g.global, vec![256]);
    }

    #[test]
    fn spatial_pads_width_only() {
        let g = LaunchGeometry::spatial(28, 28, 96, 64);
        assert_eq!(g.global, vec![64, 28, 96]);
        assert_eq!(g.local, vec![64, 1, 1]);
        assert_eq!(g.dims(), 3);
    }

    #[test]
    fn local_divides_global_in_every_dimension() {
        for n in [1, 63, 64, 65, 1000] {
            let g = LaunchGeometry::flat(n, 64);
            assert_eq!(g.global[0] % g.local[0], 0);
            assert!(g.global[0] >= n);
        }
        let g = LaunchGeometry::spatial(30, 7, 3, 64);
        for (gl, lo) in g.global.iter().zip(g.local.iter()) {
            assert_eq!(gl % lo, 0);
        }
    }
}
