//! Normalization kernels: layer/RMS/group/L2 norms and the softmax pair.

use super::{partition, unravel_row, ComputeParams, TV};
use crate::context::Context;
use crate::simd;
use crate::tensor::{OpParams, TensorId};
use crate::types::DType;

pub fn norm(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::Norm { eps } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let n = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let mut mean = 0.0f64;
            for i in 0..n {
                mean += *ar.add(i) as f64;
            }
            mean /= n as f64;
            let mut var = 0.0f64;
            for i in 0..n {
                let v = *ar.add(i) as f64 - mean;
                *dr.add(i) = v as f32;
                var += v * v;
            }
            var /= n as f64;
            let scale = (1.0 / (var + eps as f64).sqrt()) as f32;
            for i in 0..n {
                *dr.add(i) *= scale;
            }
        }
    }
}

pub fn rms_norm(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::Norm { eps } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let n = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let mut ms = 0.0f64;
            for i in 0..n {
                let v = *ar.add(i) as f64;
                ms += v * v;
            }
            ms /= n as f64;
            let scale = (1.0 / (ms + eps as f64).sqrt()) as f32;
            for i in 0..n {
                *dr.add(i) = *ar.add(i) * scale;
            }
        }
    }
}

/// Closed-form RMS-norm gradient:
/// `dx = s·g − s³·x·dot(x, g)/n`, `s = (mean(x²)+eps)^(-1/2)`.
pub fn rms_norm_back(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let g = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let OpParams::Norm { eps } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let n = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            let gr = g.row_ptr(i1, i2, i3) as *const f32;
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let mut ms = 0.0f64;
            let mut xg = 0.0f64;
            for i in 0..n {
                let x = *ar.add(i) as f64;
                ms += x * x;
                xg += x * *gr.add(i) as f64;
            }
            ms = ms / n as f64 + eps as f64;
            let s = 1.0 / ms.sqrt();
            let k = s * s * s * xg / n as f64;
            for i in 0..n {
                *dr.add(i) = (s * *gr.add(i) as f64 - k * *ar.add(i) as f64) as f32;
            }
        }
    }
}

/// Normalize over channel groups: statistics span `(ne0, ne1,
/// channels-per-group)` for each (group, sample).
pub fn group_norm(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::GroupNorm { n_groups, eps } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let channels = d.ne(2);
    let per_group = (channels + n_groups as i64 - 1) / n_groups as i64;

    let total = n_groups as i64 * d.ne(3);
    let (t0, t1) = partition(total, p.ith, p.nth);
    for tg in t0..t1 {
        let i3 = tg / n_groups as i64;
        let gi = tg % n_groups as i64;
        let c0 = gi * per_group;
        let c1 = (c0 + per_group).min(channels);
        unsafe {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for i2 in c0..c1 {
                for i1 in 0..d.ne(1) {
                    let ar = a.row_ptr(i1, i2, i3) as *const f32;
                    for i0 in 0..d.ne(0) as usize {
                        sum += *ar.add(i0) as f64;
                        count += 1;
                    }
                }
            }
            let mean = sum / count as f64;
            let mut var = 0.0f64;
            for i2 in c0..c1 {
                for i1 in 0..d.ne(1) {
                    let ar = a.row_ptr(i1, i2, i3) as *const f32;
                    let dr = d.row_ptr(i1, i2, i3) as *mut f32;
                    for i0 in 0..d.ne(0) as usize {
                        let v = *ar.add(i0) as f64 - mean;
                        *dr.add(i0) = v as f32;
                        var += v * v;
                    }
                }
            }
            var /= count as f64;
            let scale = (1.0 / (var + eps as f64).sqrt()) as f32;
            for i2 in c0..c1 {
                for i1 in 0..d.ne(1) {
                    let dr = d.row_ptr(i1, i2, i3) as *mut f32;
                    for i0 in 0..d.ne(0) as usize {
                        *dr.add(i0) *= scale;
                    }
                }
            }
        }
    }
}

pub fn l2_norm(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::Norm { eps } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let n = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let mut ss = 0.0f64;
            for i in 0..n {
                let v = *ar.add(i) as f64;
                ss += v * v;
            }
            let scale = (1.0 / ss.sqrt().max(eps as f64)) as f32;
            for i in 0..n {
                *dr.add(i) = *ar.add(i) * scale;
            }
        }
    }
}

/// ALiBi slope for head `h` out of `n_head` at the given `max_bias`.
pub(crate) fn alibi_slope(h: i64, n_head: i64, max_bias: f32) -> f32 {
    if max_bias <= 0.0 {
        return 1.0;
    }
    let n_head_log2 = 1i64 << (63 - (n_head as u64).leading_zeros() as i64).max(0);
    let m0 = 2.0f32.powf(-max_bias / n_head_log2 as f32);
    let m1 = 2.0f32.powf(-max_bias / 2.0 / n_head_log2 as f32);
    if h < n_head_log2 {
        m0.powi(h as i32 + 1)
    } else {
        m1.powi(2 * (h - n_head_log2) as i32 + 1)
    }
}

/// Per-row max-shift softmax with optional additive mask (F32 or F16),
/// logit scale and ALiBi position bias.
pub fn soft_max(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let mask = ctx.tensor(dst).src[1].map(|m| TV::new(ctx, m));
    let OpParams::SoftMax { scale, max_bias } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let n = d.ne(0) as usize;
    let n_head = d.ne(2);

    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            let dr = std::slice::from_raw_parts_mut(d.row_ptr(i1, i2, i3) as *mut f32, n);
            for (i, v) in dr.iter_mut().enumerate() {
                *v = *ar.add(i) * scale;
            }
            if let Some(m) = &mask {
                let slope = alibi_slope(i2, n_head, max_bias);
                for (i, v) in dr.iter_mut().enumerate() {
                    *v += slope * m.at_float(i as i64, i1 % m.ne(1), 0, 0);
                }
            }
            let max = simd::vec_max_f32(dr);
            let mut sum = 0.0f32;
            for v in dr.iter_mut() {
                let e = (*v - max).exp();
                *v = e;
                sum += e;
            }
            let inv = 1.0 / sum;
            for v in dr.iter_mut() {
                *v *= inv;
                debug_assert!(!v.is_nan());
            }
        }
    }
}

/// `dx = y · (g − dot(y, g))` per row; srcs `[g, y]`.
pub fn soft_max_back(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let g = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let y = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert_eq!(d.t.dtype, DType::F32);
    let n = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let gr = g.row_ptr(i1, i2, i3) as *const f32;
            let yr = y.row_ptr(i1, i2, i3) as *const f32;
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let mut dot = 0.0f32;
            for i in 0..n {
                dot += *yr.add(i) * *gr.add(i);
            }
            for i in 0..n {
                *dr.add(i) = *yr.add(i) * (*gr.add(i) - dot);
            }
        }
    }
}
