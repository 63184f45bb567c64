//! Matrix products: the batched contraction MUL_MAT with its mixed-type
//! pre-pass and chunk stealing, the mixture-of-experts MUL_MAT_ID, and
//! OUT_PROD.

use super::{partition, unravel_row, ComputeParams, TV};
use crate::context::Context;
use crate::quant;
use crate::simd;
use crate::tensor::TensorId;
use crate::types::DType;
use std::sync::atomic::Ordering;

/// Output chunk edge (rows × cols) for the work-stealing loop.
const CHUNK: i64 = 16;

fn is_interleaved(t: DType) -> bool {
    matches!(t, DType::Q4_0_4_4 | DType::Q4_0_4_8 | DType::Q4_0_8_8)
}

fn interleave_rows(t: DType) -> usize {
    match t {
        DType::Q4_0_4_4 | DType::Q4_0_4_8 => 4,
        DType::Q4_0_8_8 => 8,
        _ => unreachable!(),
    }
}

/// One dot product of an `a` row (any supported type) against a `b` row
/// that is already in `a`'s partner type.
#[inline]
unsafe fn row_dot(at: DType, k: usize, a: *const u8, vdt: DType, b: *const u8) -> f32 {
    match at {
        DType::F32 => {
            let ar = std::slice::from_raw_parts(a as *const f32, k);
            let br = std::slice::from_raw_parts(b as *const f32, k);
            simd::vec_dot_f32(ar, br)
        }
        DType::F16 => {
            let ar = std::slice::from_raw_parts(a as *const half::f16, k);
            let br = std::slice::from_raw_parts(b as *const half::f16, k);
            simd::vec_dot_f16(ar, br)
        }
        DType::BF16 => {
            let ar = std::slice::from_raw_parts(a as *const half::bf16, k);
            let br = std::slice::from_raw_parts(b as *const half::bf16, k);
            simd::vec_dot_bf16(ar, br)
        }
        _ => {
            let ab = std::slice::from_raw_parts(a, at.row_size(k));
            let bb = std::slice::from_raw_parts(b, vdt.row_size(k));
            quant::vec_dot(at, k, ab, vdt, bb)
        }
    }
}

/// Stage the rows of `b` into `a`'s partner type inside the work buffer.
/// All threads convert disjoint row ranges; the caller barriers after.
unsafe fn stage_b(p: &ComputeParams, b: &TV, vdt: DType, base: *mut u8) {
    let k = b.ne(0) as usize;
    let row_sz = vdt.row_size(k);
    let total = b.nrows();
    let (s0, s1) = partition(total, p.ith, p.nth);
    for ir in s0..s1 {
        let (i1, i2, i3) = unravel_row(b.t, ir);
        let src = std::slice::from_raw_parts(b.row_ptr(i1, i2, i3) as *const f32, k);
        let dst = std::slice::from_raw_parts_mut(base.add(ir as usize * row_sz), row_sz);
        quant::quantize_row(vdt, src, dst);
    }
}

pub fn mul_mat(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert_eq!(d.t.dtype, DType::F32);
    assert!(a.t.has_contiguous_rows());
    assert!(b.t.has_contiguous_rows());

    if is_interleaved(a.t.dtype) {
        return mul_mat_interleaved(p, ctx, dst);
    }

    let k = a.ne(0) as usize;
    let vdt = a.t.dtype.vec_dot_type();
    let staged = if b.t.dtype != vdt {
        assert_eq!(b.t.dtype, DType::F32, "mixed-type matmul takes f32 activations");
        let base = p.work_bytes();
        unsafe { stage_b(p, &b, vdt, base) };
        Some(base as *const u8)
    } else {
        None
    };
    if p.ith == 0 {
        // reset the stealing counter for this node
        p.shared.current_chunk.0.store(p.nth, Ordering::SeqCst);
    }
    p.barrier();

    let row_sz_v = vdt.row_size(k);
    let r2 = b.ne(2) / a.ne(2);
    let r3 = b.ne(3) / a.ne(3);
    let nr0 = d.ne(0);
    let nr1 = d.ne(1) * d.ne(2) * d.ne(3);
    let nchunk0 = (nr0 + CHUNK - 1) / CHUNK;
    let nchunk1 = (nr1 + CHUNK - 1) / CHUNK;
    let total_chunks = nchunk0 * nchunk1;

    let mut chunk = p.ith as i64;
    while chunk < total_chunks {
        let c0 = chunk % nchunk0;
        let c1 = chunk / nchunk0;
        let ir0_start = c0 * CHUNK;
        let ir0_end = (ir0_start + CHUNK).min(nr0);
        let ir1_start = c1 * CHUNK;
        let ir1_end = (ir1_start + CHUNK).min(nr1);

        for ir1 in ir1_start..ir1_end {
            let (i11, i12, i13) = unravel_row(d.t, ir1);
            let i02 = i12 / r2;
            let i03 = i13 / r3;
            unsafe {
                let b_row: *const u8 = match staged {
                    Some(base) => {
                        let ir = i11 + b.ne(1) * (i12 + b.ne(2) * i13);
                        base.add(ir as usize * row_sz_v)
                    }
                    None => b.row_ptr(i11, i12, i13),
                };
                let drow = d.row_ptr(i11, i12, i13) as *mut f32;
                for ir0 in ir0_start..ir0_end {
                    let a_row = a.row_ptr(ir0, i02, i03);
                    *drow.add(ir0 as usize) = row_dot(a.t.dtype, k, a_row, vdt, b_row);
                }
            }
        }
        chunk = p.shared.current_chunk.0.fetch_add(1, Ordering::Relaxed) as i64;
    }
}

/// Matmul over the repacked Q4_0 interleaved layouts: each group of
/// `R` destination rows shares one interleaved byte region, consumed by
/// the batched GEMV entry point.
fn mul_mat_interleaved(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert!(a.t.is_matrix() && b.t.is_matrix(), "interleaved layouts are 2-d");
    let r = interleave_rows(a.t.dtype);
    let k = a.ne(0) as usize;
    let m = a.ne(1);
    assert!(m % r as i64 == 0);

    let vdt = DType::Q8_0;
    let base = p.work_bytes();
    unsafe { stage_b(p, &b, vdt, base) };
    p.barrier();

    let row_sz_v = vdt.row_size(k);
    let group_bytes = r * DType::Q4_0.row_size(k);
    let n_groups = (m / r as i64) as usize;
    let (g0, g1) = partition(n_groups as i64, p.ith, p.nth);
    let mut out = vec![0.0f32; r];
    for g in g0..g1 {
        unsafe {
            let group = std::slice::from_raw_parts(
                a.data.add(g as usize * group_bytes),
                group_bytes,
            );
            for i11 in 0..b.ne(1) {
                let b_row =
                    std::slice::from_raw_parts(base.add(i11 as usize * row_sz_v), row_sz_v);
                quant::gemv_q4_0_interleaved(k, r, group, b_row, &mut out);
                let drow = d.row_ptr(i11, 0, 0) as *mut f32;
                for (j, &v) in out.iter().enumerate() {
                    *drow.add(g as usize * r + j) = v;
                }
            }
        }
    }
}

/// Mixture-of-experts matmul. Thread 0 buckets the (token, slot) pairs by
/// expert inside the work buffer, then all threads stage activations and
/// process disjoint pair slices.
pub fn mul_mat_id(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let ids = TV::new(ctx, ctx.tensor(dst).src[2].unwrap());
    assert_eq!(d.t.dtype, DType::F32);

    let k = a.ne(0) as usize;
    let m = a.ne(1);
    let n_as = a.ne(2) as usize;
    let n_ids = (ids.ne(0) * ids.ne(1)) as usize;
    let vdt = a.t.dtype.vec_dot_type();

    // work layout: [counts: n_as i64][pairs: n_as * n_ids * (i32, i32)]
    // [staged b rows]
    let counts = p.work_bytes() as *mut i64;
    let pairs = unsafe { p.work_bytes().add(n_as * 8) as *mut i32 };
    let map_bytes = n_as * 8 + n_as * n_ids * 8;

    if p.ith == 0 {
        unsafe {
            std::ptr::write_bytes(counts, 0, n_as);
            for t in 0..ids.ne(1) {
                for s in 0..ids.ne(0) {
                    let e = ids.at_i32(s, t, 0, 0);
                    assert!(e >= 0 && (e as usize) < n_as, "expert id out of range");
                    let c = *counts.add(e as usize);
                    let slot = pairs.add((e as usize * n_ids + c as usize) * 2);
                    *slot = s as i32;
                    *slot.add(1) = t as i32;
                    *counts.add(e as usize) = c + 1;
                }
            }
        }
    }

    let staged = if b.t.dtype != vdt {
        assert_eq!(b.t.dtype, DType::F32);
        let base = unsafe { p.work_bytes().add(map_bytes) };
        unsafe { stage_b(p, &b, vdt, base) };
        Some(base as *const u8)
    } else {
        None
    };
    p.barrier();

    let row_sz_v = vdt.row_size(k);
    for e in 0..n_as {
        let ce = unsafe { *counts.add(e) };
        for pi in 0..ce {
            // round-robin pair assignment keeps threads busy even when one
            // expert dominates
            if (pi as usize) % p.nth != p.ith {
                continue;
            }
            unsafe {
                let slot = pairs.add((e * n_ids + pi as usize) * 2);
                let s = *slot as i64;
                let t = *slot.add(1) as i64;
                let b_row: *const u8 = match staged {
                    Some(base) => base.add((s + b.ne(1) * t) as usize * row_sz_v),
                    None => b.row_ptr(s, t, 0),
                };
                let drow = d.row_ptr(s, t, 0) as *mut f32;
                for ir0 in 0..m {
                    let a_row = a.row_ptr(ir0, e as i64, 0);
                    *drow.add(ir0 as usize) = row_dot(a.t.dtype, k, a_row, vdt, b_row);
                }
            }
        }
    }
}

/// `dst[i, j] = Σ_t a[i, t] · b[j, t]`, accumulated into a zeroed
/// destination. Thread 0 performs the memset; the barrier orders it before
/// the partitioned accumulation.
pub fn out_prod(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert_eq!(d.t.dtype, DType::F32);
    assert_eq!(a.t.dtype, DType::F32);
    assert_eq!(b.t.dtype, DType::F32);

    if p.ith == 0 {
        unsafe { std::ptr::write_bytes(d.data, 0, d.t.nbytes()) };
    }
    p.barrier();

    let r2 = d.ne(2) / a.ne(2);
    let r3 = d.ne(3) / a.ne(3);
    let nrows = d.ne(1) * d.ne(2) * d.ne(3);
    let (j0, j1) = partition(nrows, p.ith, p.nth);
    for jr in j0..j1 {
        let (i1, i2, i3) = unravel_row(d.t, jr);
        let i02 = i2 / r2;
        let i03 = i3 / r3;
        unsafe {
            let drow =
                std::slice::from_raw_parts_mut(d.row_ptr(i1, i2, i3) as *mut f32, d.ne(0) as usize);
            for t in 0..a.ne(1) {
                let c = b.at_f32(i1, t, i2, i3);
                if c == 0.0 {
                    continue;
                }
                let arow =
                    std::slice::from_raw_parts(a.row_ptr(t, i02, i03) as *const f32, a.ne(0) as usize);
                simd::vec_mad_f32(drow, arow, c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::pool::{compute_with_ctx, Status};

    #[test]
    fn dense_matmul_literal() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let a = ctx.from_slice_f32(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = ctx.from_slice_f32(&[3, 1], &[1.0, 0.0, 1.0]);
        let d = ctx.mul_mat(a, b);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, d).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
        assert_eq!(ctx.f32s(d), &[4.0, 10.0]);
    }

    #[test]
    fn quantized_matmul_close_to_dense() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let vals: Vec<f32> = (0..64 * 4).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.25).collect();
        let act: Vec<f32> = (0..64).map(|i| ((i * 5 % 11) as f32 - 5.0) * 0.5).collect();

        let af = ctx.from_slice_f32(&[64, 4], &vals);
        let b = ctx.from_slice_f32(&[64, 1], &act);
        let dd = ctx.mul_mat(af, b);

        let aq = ctx.new_tensor_2d(DType::Q8_0, 64, 4);
        {
            let mut packed = vec![0u8; DType::Q8_0.row_size(64) * 4];
            quant::quantize_chunk(DType::Q8_0, &vals, &mut packed, 0, 4, 64, None).unwrap();
            ctx.bytes_mut(aq).copy_from_slice(&packed);
        }
        let dq = ctx.mul_mat(aq, b);

        let mut g = Graph::new(16);
        g.build_forward_expand(&ctx, dd).unwrap();
        g.build_forward_expand(&ctx, dq).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 2), Status::Success);

        let dense = ctx.f32s(dd).to_vec();
        let quantized = ctx.f32s(dq).to_vec();
        for (x, y) in dense.iter().zip(&quantized) {
            assert!((x - y).abs() < 0.5 + 0.01 * x.abs(), "{} vs {}", x, y);
        }
    }

    #[test]
    fn out_prod_matches_manual() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        // a: [2 rows of 3]ᵗ layout [ne0=3, ne1=2]
        let a = ctx.from_slice_f32(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = ctx.from_slice_f32(&[2, 2], &[1.0, 1.0, 0.0, 2.0]);
        let d = ctx.out_prod(a, b);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, d).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 2), Status::Success);
        // dst[i, j] = sum_t a[i, t] * b[j, t]
        let expect = [
            1.0 * 1.0 + 4.0 * 1.0,
            2.0 * 1.0 + 5.0 * 1.0,
            3.0 * 1.0 + 6.0 * 1.0,
            1.0 * 0.0 + 4.0 * 2.0,
            2.0 * 0.0 + 5.0 * 2.0,
            3.0 * 0.0 + 6.0 * 2.0,
        ];
        assert_eq!(ctx.f32s(d), &expect);
    }
}
