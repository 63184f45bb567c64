//! Numeric formats and the per-type trait registry.
//!
//! Every tensor carries a [`DType`] tag. The registry maps each tag to its
//! block geometry (how many elements share one fixed-size byte record), the
//! codec capabilities, and the preferred partner type for quantized dot
//! products. Row data is always a whole number of blocks.

use serde::{Deserialize, Serialize};

/// Numeric storage format of a tensor.
///
/// Dense formats store one element per "block"; quantized formats store
/// `block_size()` consecutive elements of the fastest axis in one byte
/// record (typically a scale plus packed indices).
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    F64,
    I8,
    I16,
    I32,
    I64,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    IQ1_S,
    IQ1_M,
    IQ2_XXS,
    IQ2_XS,
    IQ2_S,
    IQ3_XXS,
    IQ3_S,
    IQ4_NL,
    IQ4_XS,
    TQ1_0,
    TQ2_0,
    /// Interleaved Q4_0 layouts for batched GEMV/GEMM. Matmul-only: no row
    /// codecs, payloads are produced by repacking plain Q4_0 rows.
    Q4_0_4_4,
    Q4_0_4_8,
    Q4_0_8_8,
}

/// Elements per super-block of the K and IQ families.
pub const QK_K: usize = 256;
/// Elements per block of the legacy 4/5/8-bit families.
pub const QK: usize = 32;

/// Immutable per-type record. One instance per [`DType`], fetched through
/// [`DType::traits`].
#[derive(Debug, Clone, Copy)]
pub struct TypeTraits {
    pub name: &'static str,
    /// Elements covered by one block.
    pub block_size: usize,
    /// Bytes of one block.
    pub type_size: usize,
    pub is_quantized: bool,
    /// Partner type the other operand is materialized into for a quantized
    /// vec-dot (e.g. Q4_0 pairs with Q8_0).
    pub vec_dot_type: DType,
    /// Whether `quant::dequantize_row` accepts this type.
    pub has_to_float: bool,
    /// Whether `quant::quantize_row` accepts this type.
    pub has_from_float: bool,
    /// Rows consumed by one vec-dot call. Always 1 in the reference kernels.
    pub n_rows_per_vec_dot: usize,
}

impl DType {
    pub const COUNT: usize = 34;

    pub fn traits(self) -> &'static TypeTraits {
        &TYPE_TRAITS[self.index()]
    }

    pub fn name(self) -> &'static str {
        self.traits().name
    }

    pub fn block_size(self) -> usize {
        self.traits().block_size
    }

    pub fn type_size(self) -> usize {
        self.traits().type_size
    }

    pub fn is_quantized(self) -> bool {
        self.traits().is_quantized
    }

    pub fn vec_dot_type(self) -> DType {
        self.traits().vec_dot_type
    }

    /// Bytes of one row of `n` elements. `n` must be a whole number of
    /// blocks.
    pub fn row_size(self, n: usize) -> usize {
        let tt = self.traits();
        assert!(
            n % tt.block_size == 0,
            "row of {} elements is not a multiple of the {} block size {}",
            n,
            tt.name,
            tt.block_size
        );
        tt.type_size * n / tt.block_size
    }

    /// Stable on-disk tag used by the GGUF container.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4_0 => 2,
            DType::Q4_1 => 3,
            DType::Q5_0 => 6,
            DType::Q5_1 => 7,
            DType::Q8_0 => 8,
            DType::Q8_1 => 9,
            DType::Q2_K => 10,
            DType::Q3_K => 11,
            DType::Q4_K => 12,
            DType::Q5_K => 13,
            DType::Q6_K => 14,
            DType::Q8_K => 15,
            DType::IQ2_XXS => 16,
            DType::IQ2_XS => 17,
            DType::IQ3_XXS => 18,
            DType::IQ1_S => 19,
            DType::IQ4_NL => 20,
            DType::IQ3_S => 21,
            DType::IQ2_S => 22,
            DType::IQ4_XS => 23,
            DType::I8 => 24,
            DType::I16 => 25,
            DType::I32 => 26,
            DType::I64 => 27,
            DType::F64 => 28,
            DType::IQ1_M => 29,
            DType::BF16 => 30,
            DType::Q4_0_4_4 => 31,
            DType::Q4_0_4_8 => 32,
            DType::Q4_0_8_8 => 33,
            DType::TQ1_0 => 34,
            DType::TQ2_0 => 35,
        }
    }

    pub fn from_tag(tag: u32) -> Option<DType> {
        ALL.iter().copied().find(|t| t.tag() == tag)
    }

    fn index(self) -> usize {
        ALL.iter().position(|&t| t == self).unwrap()
    }
}

pub const ALL: [DType; DType::COUNT] = [
    DType::F32,
    DType::F16,
    DType::BF16,
    DType::F64,
    DType::I8,
    DType::I16,
    DType::I32,
    DType::I64,
    DType::Q4_0,
    DType::Q4_1,
    DType::Q5_0,
    DType::Q5_1,
    DType::Q8_0,
    DType::Q8_1,
    DType::Q2_K,
    DType::Q3_K,
    DType::Q4_K,
    DType::Q5_K,
    DType::Q6_K,
    DType::Q8_K,
    DType::IQ1_S,
    DType::IQ1_M,
    DType::IQ2_XXS,
    DType::IQ2_XS,
    DType::IQ2_S,
    DType::IQ3_XXS,
    DType::IQ3_S,
    DType::IQ4_NL,
    DType::IQ4_XS,
    DType::TQ1_0,
    DType::TQ2_0,
    DType::Q4_0_4_4,
    DType::Q4_0_4_8,
    DType::Q4_0_8_8,
];

macro_rules! tt {
    ($name:literal, $bs:expr, $ts:expr, $q:expr, $vd:expr, $tof:expr, $fromf:expr) => {
        TypeTraits {
            name: $name,
            block_size: $bs,
            type_size: $ts,
            is_quantized: $q,
            vec_dot_type: $vd,
            has_to_float: $tof,
            has_from_float: $fromf,
            n_rows_per_vec_dot: 1,
        }
    };
}

/// Indexed by `DType::index()`, i.e. the order of [`ALL`].
static TYPE_TRAITS: [TypeTraits; DType::COUNT] = [
    tt!("f32", 1, 4, false, DType::F32, true, true),
    tt!("f16", 1, 2, false, DType::F16, true, true),
    tt!("bf16", 1, 2, false, DType::BF16, true, true),
    tt!("f64", 1, 8, false, DType::F64, false, false),
    tt!("i8", 1, 1, false, DType::I8, false, false),
    tt!("i16", 1, 2, false, DType::I16, false, false),
    tt!("i32", 1, 4, false, DType::I32, false, false),
    tt!("i64", 1, 8, false, DType::I64, false, false),
    tt!("q4_0", QK, 18, true, DType::Q8_0, true, true),
    tt!("q4_1", QK, 20, true, DType::Q8_1, true, true),
    tt!("q5_0", QK, 22, true, DType::Q8_0, true, true),
    tt!("q5_1", QK, 24, true, DType::Q8_1, true, true),
    tt!("q8_0", QK, 34, true, DType::Q8_0, true, true),
    tt!("q8_1", QK, 36, true, DType::Q8_1, false, true),
    tt!("q2_K", QK_K, 84, true, DType::Q8_K, true, true),
    tt!("q3_K", QK_K, 110, true, DType::Q8_K, true, true),
    tt!("q4_K", QK_K, 144, true, DType::Q8_K, true, true),
    tt!("q5_K", QK_K, 176, true, DType::Q8_K, true, true),
    tt!("q6_K", QK_K, 210, true, DType::Q8_K, true, true),
    tt!("q8_K", QK_K, 292, true, DType::Q8_K, true, true),
    tt!("iq1_s", QK_K, 50, true, DType::Q8_K, true, true),
    tt!("iq1_m", QK_K, 56, true, DType::Q8_K, true, true),
    tt!("iq2_xxs", QK_K, 66, true, DType::Q8_K, true, true),
    tt!("iq2_xs", QK_K, 74, true, DType::Q8_K, true, true),
    tt!("iq2_s", QK_K, 82, true, DType::Q8_K, true, true),
    tt!("iq3_xxs", QK_K, 98, true, DType::Q8_K, true, true),
    tt!("iq3_s", QK_K, 110, true, DType::Q8_K, true, true),
    tt!("iq4_nl", QK, 18, true, DType::Q8_0, true, true),
    tt!("iq4_xs", QK_K, 136, true, DType::Q8_K, true, true),
    tt!("tq1_0", QK_K, 54, true, DType::Q8_K, true, true),
    tt!("tq2_0", QK_K, 66, true, DType::Q8_K, true, true),
    tt!("q4_0_4x4", QK, 18, true, DType::Q8_0, false, false),
    tt!("q4_0_4x8", QK, 18, true, DType::Q8_0, false, false),
    tt!("q4_0_8x8", QK, 18, true, DType::Q8_0, false, false),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for &t in ALL.iter() {
            assert_eq!(DType::from_tag(t.tag()), Some(t));
        }
    }

    #[test]
    fn row_sizes() {
        assert_eq!(DType::F32.row_size(64), 256);
        assert_eq!(DType::Q4_0.row_size(64), 36);
        assert_eq!(DType::Q4_K.row_size(256), 144);
    }

    #[test]
    #[should_panic]
    fn row_size_rejects_partial_blocks() {
        DType::Q4_0.row_size(33);
    }
}
