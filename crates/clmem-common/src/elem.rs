//! Numeric element types supported by the device kernels.
//!
//! Kernels exist in one compiled variant per element type; [`Elem`] is the
//! explicit enumeration used to select the variant, and [`Numeric`] is the
//! trait the host-side reference implementations are generic over.

use std::fmt;

/// Element type of a device buffer, as seen by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Elem {
    /// Single-precision floating point.
    F32,
    /// Double-precision floating point.
    F64,
    /// 32-bit signed integer.
    I32,
}

impl Elem {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Elem::F32 | Elem::I32 => 4,
            Elem::F64 => 8,
        }
    }

    /// Suffix appended to a kernel base name to select the typed variant.
    pub fn suffix(self) -> &'static str {
        match self {
            Elem::F32 => "f32",
            Elem::F64 => "f64",
            Elem::I32 => "i32",
        }
    }

    /// The OpenCL C type spelled in kernel source.
    pub fn cl_type(self) -> &'static str {
        match self {
            Elem::F32 => "float",
            Elem::F64 => "double",
            Elem::I32 => "int",
        }
    }

    /// All supported element types.
    pub fn all() -> [Elem; 3] {
        [Elem::F32, Elem::F64, Elem::I32]
    }
}

impl fmt::Display for Elem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for i32 {}
}

/// A host-representable element type with a device kernel variant.
///
/// Sealed: the kernel set is compiled per type, so only the types with
/// device counterparts implement this.
pub trait Numeric:
    sealed::Sealed + Copy + Default + PartialEq + Send + Sync + fmt::Debug + 'static
{
    /// The element tag for kernel selection.
    const ELEM: Elem;

    /// Write this value into `out` in device byte order (little endian).
    /// `out` must be exactly `Self::ELEM.size_of()` bytes.
    fn write_le(self, out: &mut [u8]);

    /// Read a value from device byte order.
    fn read_le(bytes: &[u8]) -> Self;

    /// Element addition, used by the column→image accumulation path.
    fn add(self, rhs: Self) -> Self;

    /// Lossless conversion from a small integer, for test fixtures and
    /// fill patterns.
    fn from_i32(v: i32) -> Self;
}

impl Numeric for f32 {
    const ELEM: Elem = Elem::F32;

    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes(bytes.try_into().expect("f32 needs 4 bytes"))
    }

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn from_i32(v: i32) -> Self {
        v as f32
    }
}

impl Numeric for f64 {
    const ELEM: Elem = Elem::F64;

    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f64::from_le_bytes(bytes.try_into().expect("f64 needs 8 bytes"))
    }

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn from_i32(v: i32) -> Self {
        v as f64
    }
}

impl Numeric for i32 {
    const ELEM: Elem = Elem::I32;

    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes(bytes.try_into().expect("i32 needs 4 bytes"))
    }

    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    fn from_i32(v: i32) -> Self {
        v
    }
}

/// Encode a typed slice into raw device bytes.
pub fn to_bytes<T: Numeric>(values: &[T]) -> Vec<u8> {
    let sz = T::ELEM.size_of();
    let mut out = vec![0u8; values.len() * sz];
    for (i, v) in values.iter().enumerate() {
        v.write_le(&mut out[i * sz..(i + 1) * sz]);
    }
    out
}

/// Decode raw device bytes into a typed vector. Trailing bytes that do not
/// form a whole element are ignored.
pub fn from_bytes<T: Numeric>(bytes: &[u8]) -> Vec<T> {
    let sz = T::ELEM.size_of();
    bytes
        .chunks_exact(sz)
        .map(|c| T::read_le(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elem_sizes() {
        assert_eq!(Elem::F32.size_of(), 4);
        assert_eq!(Elem::F64.size_of(), 8);
        assert_eq!(Elem::I32.size_of(), 4);
    }

    #[test]
    fn elem_suffixes_unique() {
        let all = Elem::all();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.suffix(), b.suffix());
            }
        }
    }

    #[test]
    fn elem_cl_types() {
        assert_eq!(Elem::F32.cl_type(), "float");
        assert_eq!(Elem::F64.cl_type(), "double");
        assert_eq!(Elem::I32.cl_type(), "int");
    }

    #[test]
    fn elem_display_matches_suffix() {
        assert_eq!(Elem::F64.to_string(), "f64");
    }

    #[test]
    fn f32_round_trip() {
        let vals = [0.0f32, -1.5, 3.25, f32::MAX];
        let bytes = to_bytes(&vals);
        assert_eq!(bytes.len(), 16);
        assert_eq!(from_bytes::<f32>(&bytes), vals);
    }

    #[test]
    fn f64_round_trip() {
        let vals = [1e300f64, -0.125];
        assert_eq!(from_bytes::<f64>(&to_bytes(&vals)), vals);
    }

    #[test]
    fn i32_round_trip() {
        let vals = [i32::MIN, -1, 0, 7, i32::MAX];
        assert_eq!(from_bytes::<i32>(&to_bytes(&vals)), vals);
    }

    #[test]
    fn from_bytes_ignores_partial_tail() {
        let mut bytes = to_bytes(&[1.0f32, 2.0]);
        bytes.push(0xff);
        assert_eq!(from_bytes::<f32>(&bytes), vec![1.0, 2.0]);
    }

    #[test]
    fn i32_add_wraps() {
        assert_eq!(i32::MAX.add(1), i32::MIN);
    }

    #[test]
    fn from_i32_conversions() {
        assert_eq!(f32::from_i32(3), 3.0);
        assert_eq!(f64::from_i32(-2), -2.0);
        assert_eq!(i32::from_i32(9), 9);
    }
}
