//! Scalar element types carried by buffers and lazy nodes.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between lazy nodes and device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I8,
    U8,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn itemsize(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Byte length of `count` elements, or `None` when it does not fit in `usize`.
    pub fn nbytes(self, count: usize) -> Option<usize> {
        count.checked_mul(self.itemsize())
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Short lowercase name used in logs and kernel names.
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I8 => "char",
            DType::U8 => "uchar",
            DType::I32 => "int",
            DType::I64 => "long",
            DType::F16 => "half",
            DType::BF16 => "bfloat16",
            DType::F32 => "float",
            DType::F64 => "double",
        }
    }

    /// Decodes one little-endian element into an `f64`.
    ///
    /// `bytes` must hold at least `itemsize()` bytes.
    pub fn decode_f64(self, bytes: &[u8]) -> f64 {
        match self {
            DType::Bool => f64::from(u8::from(bytes[0] != 0)),
            DType::I8 => f64::from(bytes[0] as i8),
            DType::U8 => f64::from(bytes[0]),
            DType::I32 => f64::from(i32::from_le_bytes(le4(bytes))),
            DType::I64 => i64::from_le_bytes(le8(bytes)) as f64,
            DType::F16 => f16::from_le_bytes([bytes[0], bytes[1]]).to_f64(),
            DType::BF16 => bf16::from_le_bytes([bytes[0], bytes[1]]).to_f64(),
            DType::F32 => f64::from(f32::from_le_bytes(le4(bytes))),
            DType::F64 => f64::from_le_bytes(le8(bytes)),
        }
    }

    /// Encodes `value` into `out` using this dtype's little-endian layout.
    ///
    /// Integer dtypes truncate toward zero and saturate at their bounds.
    pub fn encode_f64(self, value: f64, out: &mut [u8]) {
        match self {
            DType::Bool => out[0] = u8::from(value != 0.0),
            DType::I8 => out[0] = (value as i8) as u8,
            DType::U8 => out[0] = value as u8,
            DType::I32 => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
            DType::I64 => out[..8].copy_from_slice(&(value as i64).to_le_bytes()),
            DType::F16 => out[..2].copy_from_slice(&f16::from_f64(value).to_le_bytes()),
            DType::BF16 => out[..2].copy_from_slice(&bf16::from_f64(value).to_le_bytes()),
            DType::F32 => out[..4].copy_from_slice(&(value as f32).to_le_bytes()),
            DType::F64 => out[..8].copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// Encodes a slice of `f32` values into a dense byte vector of this dtype.
    pub fn encode_f32_slice(self, values: &[f32]) -> Vec<u8> {
        let size = self.itemsize();
        let mut out = vec![0u8; values.len() * size];
        for (chunk, value) in out.chunks_exact_mut(size).zip(values) {
            self.encode_f64(f64::from(*value), chunk);
        }
        out
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

#[cfg(test)]
mod tests {
    use super::DType;

    #[test]
    fn itemsize_matches_layout() {
        assert_eq!(DType::Bool.itemsize(), 1);
        assert_eq!(DType::BF16.itemsize(), 2);
        assert_eq!(DType::F32.itemsize(), 4);
        assert_eq!(DType::I64.itemsize(), 8);
    }

    #[test]
    fn byte_length_overflow_is_detected() {
        assert_eq!(DType::F32.nbytes(3), Some(12));
        assert_eq!(DType::F64.nbytes(usize::MAX / 4), None);
        assert_eq!(DType::U8.nbytes(usize::MAX), Some(usize::MAX));
    }

    #[test]
    fn encode_f32_slice_casts_per_dtype() {
        let values = [0.25f32, 0.75];
        assert_eq!(DType::I32.encode_f32_slice(&values), vec![0u8; 8]);
        let halves = DType::F16.encode_f32_slice(&values);
        assert_eq!(halves.len(), 4);
        assert_eq!(DType::F16.decode_f64(&halves[2..]), 0.75);
        let floats = DType::F32.encode_f32_slice(&values);
        assert_eq!(DType::F32.decode_f64(&floats[..4]), 0.25);
    }
}
