//! Fused attention: one pass over the key axis per query row with an
//! online softmax, optional mask, ALiBi bias and logit softcap.

use super::{norm::alibi_slope, partition, ComputeParams, TV};
use crate::context::Context;
use crate::simd;
use crate::tensor::{OpParams, TensorId};
use crate::types::DType;
use half::f16;

/// Dot of an f32 query row against a K row stored as F32 or F16.
#[inline]
unsafe fn kq_dot(q: &[f32], krow: *const u8, kt: DType) -> f32 {
    match kt {
        DType::F32 => {
            let kr = std::slice::from_raw_parts(krow as *const f32, q.len());
            simd::vec_dot_f32(q, kr)
        }
        DType::F16 => {
            let kr = std::slice::from_raw_parts(krow as *const f16, q.len());
            let mut sum = 0.0f32;
            for (qi, ki) in q.iter().zip(kr) {
                sum += qi * ki.to_f32();
            }
            sum
        }
        other => panic!("flash_attn_ext: unsupported K type {}", other.name()),
    }
}

#[inline]
unsafe fn v_accumulate(acc: &mut [f32], vrow: *const u8, vt: DType, w: f32) {
    match vt {
        DType::F32 => {
            let vr = std::slice::from_raw_parts(vrow as *const f32, acc.len());
            simd::vec_mad_f32(acc, vr, w);
        }
        DType::F16 => {
            let vr = std::slice::from_raw_parts(vrow as *const f16, acc.len());
            for (a, v) in acc.iter_mut().zip(vr) {
                *a += v.to_f32() * w;
            }
        }
        other => panic!("flash_attn_ext: unsupported V type {}", other.name()),
    }
}

pub fn flash_attn_ext(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let q = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let k = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let v = TV::new(ctx, ctx.tensor(dst).src[2].unwrap());
    let mask = ctx.tensor(dst).src[3].map(|m| TV::new(ctx, m));
    let OpParams::FlashAttn {
        scale,
        max_bias,
        logit_softcap,
    } = ctx.tensor(dst).params
    else {
        unreachable!()
    };
    assert_eq!(q.t.dtype, DType::F32);

    let dk = q.ne(0) as usize;
    let dv = v.ne(0) as usize;
    let n_q = q.ne(1);
    let n_head = q.ne(2);
    let n_kv = k.ne(1);
    let rk = n_head / k.ne(2);

    // dst is [Dv, H, N, B]: row (h, n, b)
    let total = n_q * n_head * q.ne(3);
    let (t0, t1) = partition(total, p.ith, p.nth);
    let acc = unsafe { p.thread_scratch_f32(dv) };
    for ti in t0..t1 {
        let b = ti / (n_q * n_head);
        let rem = ti % (n_q * n_head);
        let n = rem / n_head;
        let h = rem % n_head;
        let hk = h / rk;
        let slope = alibi_slope(h, n_head, max_bias);

        unsafe {
            let qrow = std::slice::from_raw_parts(q.row_ptr(n, h, b) as *const f32, dk);
            acc.fill(0.0);
            let mut m = f32::NEG_INFINITY;
            let mut s = 0.0f32;

            for kv in 0..n_kv {
                let mut score = kq_dot(qrow, k.row_ptr(kv, hk, b), k.t.dtype) * scale;
                if logit_softcap != 0.0 {
                    score = logit_softcap * (score / logit_softcap).tanh();
                }
                if let Some(mk) = &mask {
                    let mv = mk.at_float(kv, n, 0, 0);
                    if mv == f32::NEG_INFINITY {
                        continue;
                    }
                    score += slope * mv;
                }
                let m_new = m.max(score);
                let ms = if m == f32::NEG_INFINITY {
                    0.0
                } else {
                    (m - m_new).exp()
                };
                let w = (score - m_new).exp();
                if ms != 1.0 {
                    simd::vec_scale_f32(acc, ms);
                }
                s = s * ms + w;
                v_accumulate(acc, v.row_ptr(kv, hk, b), v.t.dtype, w);
                m = m_new;
            }

            let drow = d.row_ptr(h, n, b) as *mut f32;
            let inv = if s > 0.0 { 1.0 / s } else { 0.0 };
            for (i, a) in acc.iter().enumerate() {
                *drow.add(i) = a * inv;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::graph::Graph;
    use crate::pool::{compute_with_ctx, Status};

    /// The fused kernel must agree with the unfused
    /// softmax(scale·KᵀQ)·V composition.
    #[test]
    fn matches_unfused_attention() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let (dim, n_q, n_kv) = (8i64, 5i64, 7i64);
        let qv: Vec<f32> = (0..dim * n_q).map(|i| ((i * 17 % 23) as f32 - 11.0) * 0.1).collect();
        let kv: Vec<f32> = (0..dim * n_kv).map(|i| ((i * 11 % 19) as f32 - 9.0) * 0.1).collect();
        let vv: Vec<f32> = (0..dim * n_kv).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.2).collect();
        let scale = 1.0 / (dim as f32).sqrt();

        let q = ctx.from_slice_f32(&[dim, n_q, 1, 1], &qv);
        let k = ctx.from_slice_f32(&[dim, n_kv, 1, 1], &kv);
        let v = ctx.from_slice_f32(&[dim, n_kv, 1, 1], &vv);

        let fused = ctx.flash_attn_ext(q, k, v, None, scale, 0.0, 0.0);

        // unfused: scores = mul_mat(k, q) : [n_kv, n_q]
        let scores = ctx.mul_mat(k, q);
        let probs = ctx.soft_max_ext(scores, None, scale, 0.0);
        let vt = ctx.transpose(v);
        let vtc = ctx.cont(vt);
        let out = ctx.mul_mat(vtc, probs);

        let mut g = Graph::new(32);
        g.build_forward_expand(&ctx, fused).unwrap();
        g.build_forward_expand(&ctx, out).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 2), Status::Success);

        let fused_out = ctx.f32s(fused).to_vec();
        let ref_out = ctx.f32s(out).to_vec();
        assert_eq!(fused_out.len(), ref_out.len());
        for (a, b) in fused_out.iter().zip(&ref_out) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }
}
