//! Block-quantized codecs and the bulk quantization façade.
//!
//! Each format stores groups of `block_size` consecutive values of the
//! fastest axis as one fixed-size byte record. The scalar encode/decode
//! paths here are the reference numerical behaviour for every kernel that
//! touches quantized data.

pub mod iq;
pub mod kquants;
pub mod legacy;

use crate::errors::{SlipError, SlipResult};
use crate::simd;
use crate::types::DType;

pub use legacy::{BlockQ4_0, BlockQ4_1, BlockQ5_0, BlockQ5_1, BlockQ8_0, BlockQ8_1};

/// Decode one row of `dst.len()` elements. Panics if the type has no
/// decoder or the row is not a whole number of blocks.
pub fn dequantize_row(t: DType, src: &[u8], dst: &mut [f32]) {
    let n = dst.len();
    assert!(
        t.traits().has_to_float,
        "type {} has no to_float decoder",
        t.name()
    );
    assert_eq!(src.len(), t.row_size(n));
    match t {
        DType::F32 => dst.copy_from_slice(bytemuck::cast_slice(src)),
        DType::F16 => {
            let h: &[half::f16] = bytemuck::cast_slice(src);
            for (d, s) in dst.iter_mut().zip(h) {
                *d = s.to_f32();
            }
        }
        DType::BF16 => {
            let h: &[half::bf16] = bytemuck::cast_slice(src);
            for (d, s) in dst.iter_mut().zip(h) {
                *d = s.to_f32();
            }
        }
        DType::Q4_0 => legacy::dequantize_row_q4_0(bytemuck::cast_slice(src), dst),
        DType::Q4_1 => legacy::dequantize_row_q4_1(bytemuck::cast_slice(src), dst),
        DType::Q5_0 => legacy::dequantize_row_q5_0(bytemuck::cast_slice(src), dst),
        DType::Q5_1 => legacy::dequantize_row_q5_1(bytemuck::cast_slice(src), dst),
        DType::Q8_0 => legacy::dequantize_row_q8_0(bytemuck::cast_slice(src), dst),
        DType::Q2_K => kquants::dequantize_row_q2_k(bytemuck::cast_slice(src), dst),
        DType::Q3_K => kquants::dequantize_row_q3_k(bytemuck::cast_slice(src), dst),
        DType::Q4_K => kquants::dequantize_row_q4_k(bytemuck::cast_slice(src), dst),
        DType::Q5_K => kquants::dequantize_row_q5_k(bytemuck::cast_slice(src), dst),
        DType::Q6_K => kquants::dequantize_row_q6_k(bytemuck::cast_slice(src), dst),
        DType::Q8_K => kquants::dequantize_row_q8_k(bytemuck::cast_slice(src), dst),
        DType::IQ4_NL => iq::dequantize_row_iq4_nl(bytemuck::cast_slice(src), dst),
        DType::IQ4_XS => iq::dequantize_row_iq4_xs(src, dst),
        DType::IQ2_XXS => iq::dequantize_row_iq2_xxs(src, dst),
        DType::IQ2_XS => iq::dequantize_row_iq2_xs(src, dst),
        DType::IQ2_S => iq::dequantize_row_iq2_s(src, dst),
        DType::IQ3_XXS => iq::dequantize_row_iq3_xxs(src, dst),
        DType::IQ3_S => iq::dequantize_row_iq3_s(src, dst),
        DType::IQ1_S => iq::dequantize_row_iq1_s(src, dst),
        DType::IQ1_M => iq::dequantize_row_iq1_m(src, dst),
        DType::TQ1_0 => iq::dequantize_row_tq1_0(src, dst),
        DType::TQ2_0 => iq::dequantize_row_tq2_0(src, dst),
        _ => unreachable!("decoder coverage matches the trait table"),
    }
}

/// Encode one row without an importance matrix. IQ1/IQ2/IQ3 rows fall back
/// to uniform weights; prefer [`quantize_chunk`] which enforces the imatrix
/// requirement for them.
pub fn quantize_row(t: DType, src: &[f32], dst: &mut [u8]) {
    quantize_row_imatrix(t, src, dst, None)
}

pub fn quantize_row_imatrix(t: DType, src: &[f32], dst: &mut [u8], imatrix: Option<&[f32]>) {
    let n = src.len();
    assert!(
        t.traits().has_from_float,
        "type {} has no from_float encoder",
        t.name()
    );
    assert_eq!(dst.len(), t.row_size(n));
    match t {
        DType::F32 => bytemuck::cast_slice_mut(dst).copy_from_slice(src),
        DType::F16 => {
            let h: &mut [half::f16] = bytemuck::cast_slice_mut(dst);
            for (d, s) in h.iter_mut().zip(src) {
                *d = half::f16::from_f32(*s);
            }
        }
        DType::BF16 => {
            let h: &mut [half::bf16] = bytemuck::cast_slice_mut(dst);
            for (d, s) in h.iter_mut().zip(src) {
                *d = half::bf16::from_f32(*s);
            }
        }
        DType::Q4_0 => legacy::quantize_row_q4_0(src, bytemuck::cast_slice_mut(dst)),
        DType::Q4_1 => legacy::quantize_row_q4_1(src, bytemuck::cast_slice_mut(dst)),
        DType::Q5_0 => legacy::quantize_row_q5_0(src, bytemuck::cast_slice_mut(dst)),
        DType::Q5_1 => legacy::quantize_row_q5_1(src, bytemuck::cast_slice_mut(dst)),
        DType::Q8_0 => legacy::quantize_row_q8_0(src, bytemuck::cast_slice_mut(dst)),
        DType::Q8_1 => legacy::quantize_row_q8_1(src, bytemuck::cast_slice_mut(dst)),
        DType::Q2_K => kquants::quantize_row_q2_k(src, bytemuck::cast_slice_mut(dst)),
        DType::Q3_K => kquants::quantize_row_q3_k(src, bytemuck::cast_slice_mut(dst)),
        DType::Q4_K => kquants::quantize_row_q4_k(src, bytemuck::cast_slice_mut(dst)),
        DType::Q5_K => kquants::quantize_row_q5_k(src, bytemuck::cast_slice_mut(dst)),
        DType::Q6_K => kquants::quantize_row_q6_k(src, bytemuck::cast_slice_mut(dst)),
        DType::Q8_K => kquants::quantize_row_q8_k(src, bytemuck::cast_slice_mut(dst)),
        DType::IQ4_NL => iq::quantize_row_iq4_nl(src, bytemuck::cast_slice_mut(dst), imatrix),
        DType::IQ4_XS => iq::quantize_row_iq4_xs(src, dst, imatrix),
        DType::IQ2_XXS => iq::quantize_row_iq2_xxs(src, dst, imatrix),
        DType::IQ2_XS => iq::quantize_row_iq2_xs(src, dst, imatrix),
        DType::IQ2_S => iq::quantize_row_iq2_s(src, dst, imatrix),
        DType::IQ3_XXS => iq::quantize_row_iq3_xxs(src, dst, imatrix),
        DType::IQ3_S => iq::quantize_row_iq3_s(src, dst, imatrix),
        DType::IQ1_S => iq::quantize_row_iq1_s(src, dst, imatrix),
        DType::IQ1_M => iq::quantize_row_iq1_m(src, dst, imatrix),
        DType::TQ1_0 => iq::quantize_row_tq1_0(src, dst),
        DType::TQ2_0 => iq::quantize_row_tq2_0(src, dst),
        _ => unreachable!("encoder coverage matches the trait table"),
    }
}

fn requires_imatrix(t: DType) -> bool {
    matches!(
        t,
        DType::IQ1_S
            | DType::IQ1_M
            | DType::IQ2_XXS
            | DType::IQ2_XS
            | DType::IQ2_S
            | DType::IQ3_XXS
            | DType::IQ3_S
    )
}

/// Bulk row quantization over `[start, start + nrows*ncols)` source
/// elements. Returns the number of bytes written, always
/// `nrows * row_size(t, ncols)`.
///
/// `start` must land on a row boundary and on a block boundary. IQ-family
/// types refuse to encode without an importance matrix of one weight per
/// input column.
pub fn quantize_chunk(
    t: DType,
    src: &[f32],
    dst: &mut [u8],
    start: usize,
    nrows: usize,
    ncols: usize,
    imatrix: Option<&[f32]>,
) -> SlipResult<usize> {
    assert!(start % ncols == 0, "start {} not a row boundary", start);
    assert!(
        start % t.block_size() == 0,
        "start {} not a block boundary for {}",
        start,
        t.name()
    );
    if requires_imatrix(t) && imatrix.is_none() {
        return Err(SlipError::ImatrixRequired(t));
    }
    if let Some(im) = imatrix {
        assert_eq!(im.len(), ncols, "imatrix carries one weight per column");
    }
    if !t.traits().has_from_float {
        return Err(SlipError::Unsupported(format!(
            "type {} cannot be quantized directly (matmul-only layout)",
            t.name()
        )));
    }

    let row_bytes = t.row_size(ncols);
    let src = &src[start..start + nrows * ncols];
    let dst = &mut dst[..nrows * row_bytes];

    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        src.par_chunks_exact(ncols)
            .zip(dst.par_chunks_exact_mut(row_bytes))
            .for_each(|(s, d)| quantize_row_imatrix(t, s, d, imatrix));
    }
    #[cfg(not(feature = "rayon"))]
    {
        for (s, d) in src.chunks_exact(ncols).zip(dst.chunks_exact_mut(row_bytes)) {
            quantize_row_imatrix(t, s, d, imatrix);
        }
    }
    Ok(nrows * row_bytes)
}

/// Dot product of one quantized row `a` against a row `b` already held in
/// `a`'s partner type (see [`DType::vec_dot_type`]).
pub fn vec_dot(t: DType, n: usize, a: &[u8], bt: DType, b: &[u8]) -> f32 {
    debug_assert_eq!(bt, t.vec_dot_type());
    debug_assert_eq!(a.len(), t.row_size(n));
    debug_assert_eq!(b.len(), bt.row_size(n));
    match (t, bt) {
        (DType::Q4_0, DType::Q8_0) => {
            legacy::vec_dot_q4_0_q8_0(bytemuck::cast_slice(a), bytemuck::cast_slice(b))
        }
        (DType::Q8_0, DType::Q8_0) => {
            legacy::vec_dot_q8_0_q8_0(bytemuck::cast_slice(a), bytemuck::cast_slice(b))
        }
        (DType::Q4_1, DType::Q8_1) => {
            legacy::vec_dot_q4_1_q8_1(bytemuck::cast_slice(a), bytemuck::cast_slice(b))
        }
        _ => vec_dot_dequant(t, n, a, bt, b),
    }
}

/// Reference path: decode both rows blockwise and accumulate in f32.
fn vec_dot_dequant(t: DType, n: usize, a: &[u8], bt: DType, b: &[u8]) -> f32 {
    let (bs, bbs) = (t.block_size(), bt.block_size());
    debug_assert!(bbs % bs == 0 || bs % bbs == 0);
    let mut xa = vec![0.0f32; n];
    let mut xb = vec![0.0f32; n];
    dequantize_row(t, a, &mut xa);
    match bt {
        DType::Q8_0 => legacy::dequantize_row_q8_0(bytemuck::cast_slice(b), &mut xb),
        DType::Q8_1 => legacy::dequantize_row_q8_1(bytemuck::cast_slice(b), &mut xb),
        DType::Q8_K => kquants::dequantize_row_q8_k(bytemuck::cast_slice(b), &mut xb),
        _ => dequantize_row(bt, b, &mut xb),
    }
    simd::vec_dot_f32(&xa, &xb)
}

/// Interleave `r` consecutive Q4_0 rows block-by-block, producing the
/// payload layout of the `Q4_0_4x4 / 4x8 / 8x8` matmul-only types: for each
/// column block, the blocks of the `r` rows are stored back to back.
pub fn repack_q4_0(src: &[u8], nrows: usize, ncols: usize, r: usize) -> Vec<u8> {
    assert!(nrows % r == 0, "row count {} not a multiple of {}", nrows, r);
    let row_bytes = DType::Q4_0.row_size(ncols);
    assert_eq!(src.len(), nrows * row_bytes);
    let nblk = ncols / DType::Q4_0.block_size();
    let bsz = DType::Q4_0.type_size();
    let mut out = vec![0u8; src.len()];
    let mut o = 0;
    for g in (0..nrows).step_by(r) {
        for blk in 0..nblk {
            for row in g..g + r {
                let s = row * row_bytes + blk * bsz;
                out[o..o + bsz].copy_from_slice(&src[s..s + bsz]);
                o += bsz;
            }
        }
    }
    out
}

/// GEMV over an interleaved Q4_0 group: `a` holds `r` interleaved rows of
/// `n` columns, `b` is one Q8_0 row; writes `r` dot products.
pub fn gemv_q4_0_interleaved(n: usize, r: usize, a: &[u8], b: &[u8], out: &mut [f32]) {
    assert_eq!(out.len(), r);
    let bsz = DType::Q4_0.type_size();
    let nblk = n / DType::Q4_0.block_size();
    debug_assert_eq!(a.len(), r * nblk * bsz);
    let bblocks: &[BlockQ8_0] = bytemuck::cast_slice(b);
    out.fill(0.0);
    for blk in 0..nblk {
        let bb = &bblocks[blk];
        for row in 0..r {
            let s = (blk * r + row) * bsz;
            let ab: &BlockQ4_0 = bytemuck::from_bytes(&a[s..s + bsz]);
            out[row] += legacy::vec_dot_block_q4_0_q8_0(ab, bb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QK;

    #[test]
    fn imatrix_is_enforced() {
        let src = vec![0.5f32; 256];
        let mut dst = vec![0u8; DType::IQ2_XXS.row_size(256)];
        let err = quantize_chunk(DType::IQ2_XXS, &src, &mut dst, 0, 1, 256, None);
        assert!(matches!(err, Err(SlipError::ImatrixRequired(_))));
        let im = vec![1.0f32; 256];
        quantize_chunk(DType::IQ2_XXS, &src, &mut dst, 0, 1, 256, Some(&im)).unwrap();
    }

    #[test]
    fn repack_round_trips_blocks() {
        let ncols = 2 * QK;
        let nrows = 4;
        let mut rows = vec![0u8; nrows * DType::Q4_0.row_size(ncols)];
        for (i, b) in rows.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let packed = repack_q4_0(&rows, nrows, ncols, 4);
        assert_eq!(packed.len(), rows.len());
        // first interleaved record is row 0 block 0, second is row 1 block 0
        let bsz = DType::Q4_0.type_size();
        let row_bytes = DType::Q4_0.row_size(ncols);
        assert_eq!(&packed[bsz..2 * bsz], &rows[row_bytes..row_bytes + bsz]);
    }
}
