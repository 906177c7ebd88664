//! Small integer helpers shared by the launch-geometry and dispatch code.

/// Integer ceiling division.
pub fn ceil_div(a: usize, b: usize) -> usize {
    debug_assert!(b > 0, "ceil_div by zero");
    (a + b - 1) / b
}

/// Rounds `n` up to the next multiple of `multiple`.
///
/// Work-group sizes must evenly divide the global size, so every flat
/// launch rounds its element count up with this before enqueueing.
pub fn round_up(n: usize, multiple: usize) -> usize {
    debug_assert!(multiple > 0, "round_up to zero multiple");
    ceil_div(n, multiple) * multiple
}
