//! Reductions: whole-tensor and per-row sums, argmax, equality counting
//! and the cross-entropy loss pair.

use super::{partition, unravel_row, ComputeParams, TV};
use crate::context::Context;
use crate::simd;
use crate::tensor::TensorId;
use crate::types::DType;

pub fn sum(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    assert_eq!(a.t.dtype, DType::F32);
    let mut total = 0.0f32;
    for i3 in 0..a.ne(3) {
        for i2 in 0..a.ne(2) {
            for i1 in 0..a.ne(1) {
                unsafe {
                    if a.t.has_contiguous_rows() {
                        let ar = std::slice::from_raw_parts(
                            a.row_ptr(i1, i2, i3) as *const f32,
                            a.ne(0) as usize,
                        );
                        total += simd::vec_sum_f32(ar);
                    } else {
                        for i0 in 0..a.ne(0) {
                            total += a.at_f32(i0, i1, i2, i3);
                        }
                    }
                }
            }
        }
    }
    unsafe { d.set_at_f32(0, 0, 0, 0, total) };
}

pub fn sum_rows(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let (r0, r1) = partition(a.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        unsafe {
            let ar = std::slice::from_raw_parts(
                a.row_ptr(i1, i2, i3) as *const f32,
                a.ne(0) as usize,
            );
            d.set_at_f32(0, i1, i2, i3, simd::vec_sum_f32(ar));
        }
    }
}

pub fn mean(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let n = a.ne(0) as f32;
    for i3 in 0..a.ne(3) {
        for i2 in 0..a.ne(2) {
            for i1 in 0..a.ne(1) {
                unsafe {
                    let ar = std::slice::from_raw_parts(
                        a.row_ptr(i1, i2, i3) as *const f32,
                        a.ne(0) as usize,
                    );
                    d.set_at_f32(0, i1, i2, i3, simd::vec_sum_f32(ar) / n);
                }
            }
        }
    }
}

pub fn argmax(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    unsafe {
        let dr = d.row_i32(0, 0, 0);
        for i1 in 0..a.ne(1) {
            let ar = a.row_ptr(i1, 0, 0) as *const f32;
            let mut best = 0i32;
            let mut best_v = f32::NEG_INFINITY;
            for i0 in 0..a.ne(0) {
                let v = *ar.add(i0 as usize);
                if v > best_v {
                    best_v = v;
                    best = i0 as i32;
                }
            }
            dr[i1 as usize] = best;
        }
    }
}

/// Partitioned I32 equality count; per-thread partials in the work buffer,
/// final reduce by thread 0 after a barrier.
pub fn count_equal(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert_eq!(d.t.dtype, DType::I64);

    let partials = p.work_bytes() as *mut i64;
    let mut local = 0i64;
    let (r0, r1) = partition(a.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        unsafe {
            let ar = a.row_ptr(i1, i2, i3) as *const i32;
            let br = b.row_ptr(i1, i2, i3) as *const i32;
            for i0 in 0..a.ne(0) as usize {
                local += (*ar.add(i0) == *br.add(i0)) as i64;
            }
        }
    }
    unsafe { *partials.add(p.ith) = local };
    p.barrier();
    if p.ith == 0 {
        let mut total = 0i64;
        for i in 0..p.nth {
            total += unsafe { *partials.add(i) };
        }
        unsafe { *(d.data as *mut i64) = total };
    }
}

/// Mean over rows of `-Σ b · log softmax(a)`; per-thread partials then a
/// reduce by thread 0.
pub fn cross_entropy_loss(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert!(a.t.same_shape(b.t));

    let partials = p.work_bytes() as *mut f32;
    let nr = a.nrows();
    let mut local = 0.0f32;
    let (r0, r1) = partition(nr, p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        unsafe {
            let ar = std::slice::from_raw_parts(
                a.row_ptr(i1, i2, i3) as *const f32,
                a.ne(0) as usize,
            );
            let br = std::slice::from_raw_parts(
                b.row_ptr(i1, i2, i3) as *const f32,
                b.ne(0) as usize,
            );
            let max = simd::vec_max_f32(ar);
            let mut sum = 0.0f32;
            for &v in ar {
                sum += (v - max).exp();
            }
            let log_z = sum.ln() + max;
            for (av, bv) in ar.iter().zip(br) {
                local -= bv * (av - log_z);
            }
        }
    }
    unsafe { *partials.add(p.ith) = local };
    p.barrier();
    if p.ith == 0 {
        let mut total = 0.0f32;
        for i in 0..p.nth {
            total += unsafe { *partials.add(i) };
        }
        unsafe { d.set_at_f32(0, 0, 0, 0, total / nr as f32) };
    }
}

/// `(softmax(a) - b) · g / nrows` per row.
pub fn cross_entropy_loss_back(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let g = TV::new(ctx, ctx.tensor(dst).src[2].unwrap());

    let gv = unsafe { g.at_f32(0, 0, 0, 0) };
    let nr = a.nrows();
    let scale = gv / nr as f32;
    for ir in 0..nr {
        let (i1, i2, i3) = unravel_row(a.t, ir);
        unsafe {
            let ar = std::slice::from_raw_parts(
                a.row_ptr(i1, i2, i3) as *const f32,
                a.ne(0) as usize,
            );
            let br = std::slice::from_raw_parts(
                b.row_ptr(i1, i2, i3) as *const f32,
                b.ne(0) as usize,
            );
            let dr = std::slice::from_raw_parts_mut(
                d.row_ptr(i1, i2, i3) as *mut f32,
                d.ne(0) as usize,
            );
            let max = simd::vec_max_f32(ar);
            let sum = simd::vec_soft_max_f32(dr, ar, max);
            let inv = 1.0 / sum;
            for i in 0..dr.len() {
                dr[i] = (dr[i] * inv - br[i]) * scale;
            }
        }
    }
}
