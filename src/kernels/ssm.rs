//! State-space and RWKV sequence kernels.

use super::{ComputeParams, TV};
use crate::context::Context;
use crate::tensor::TensorId;
use crate::types::DType;

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Causal 1-d convolution of width `d_conv` over the inner channels.
/// `sx: [d_conv-1+n_t, d_inner, n_s]`, `c: [d_conv, d_inner]` →
/// `dst: [d_inner, n_t, n_s]`.
pub fn ssm_conv(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let sx = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let c = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let d_conv = c.ne(0);
    let d_inner = d.ne(0);
    let n_t = d.ne(1);

    for seq in 0..d.ne(2) {
        for t in 0..n_t {
            unsafe {
                let dr = d.row_ptr(t, seq, 0) as *mut f32;
                for ch in 0..d_inner {
                    let mut sum = 0.0f32;
                    for j in 0..d_conv {
                        sum += sx.at_f32(t + j, ch, seq, 0) * c.at_f32(j, ch, 0, 0);
                    }
                    *dr.add(ch as usize) = sum;
                }
            }
        }
    }
}

/// Discrete-time selective scan:
/// `x_t = exp(Δ·A)·x_{t-1} + Δ·B·u_t`, `y_t = C·x_t`, `Δ = softplus(dt)`.
/// Output packs `y` (size of `x`) then the final states (size of `s`).
pub fn ssm_scan(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let s0 = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let x = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let dt = TV::new(ctx, ctx.tensor(dst).src[2].unwrap());
    let a = TV::new(ctx, ctx.tensor(dst).src[3].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[4].unwrap());
    let c = TV::new(ctx, ctx.tensor(dst).src[5].unwrap());
    assert_eq!(d.t.dtype, DType::F32);

    let d_state = s0.ne(0);
    let d_inner = s0.ne(1);
    let n_t = x.ne(1);
    let n_s = x.ne(2);

    let y_len = (d_inner * n_t * n_s) as usize;
    unsafe {
        let out = d.data as *mut f32;
        let state_out = out.add(y_len);

        for seq in 0..n_s {
            // running state starts from the input state of this sequence
            let st = state_out.add((seq * d_state * d_inner) as usize);
            for ch in 0..d_inner {
                for j in 0..d_state {
                    *st.add((ch * d_state + j) as usize) = s0.at_f32(j, ch, seq, 0);
                }
            }
            for t in 0..n_t {
                for ch in 0..d_inner {
                    let delta = softplus(dt.at_f32(ch, t, seq, 0));
                    let u = x.at_f32(ch, t, seq, 0);
                    let x_dt = u * delta;
                    let mut y = 0.0f32;
                    for j in 0..d_state {
                        let sp = st.add((ch * d_state + j) as usize);
                        let da = (delta * a.at_f32(j, ch, 0, 0)).exp();
                        *sp = *sp * da + b.at_f32(j, t, seq, 0) * x_dt;
                        y += c.at_f32(j, t, seq, 0) * *sp;
                    }
                    *out.add((ch + d_inner * (t + n_t * seq)) as usize) = y;
                }
            }
        }
    }
}

/// Per-head WKV recurrence: `state ← time_decay·state + kᵀv`, output
/// `r·(time_first·kᵀv + state)`. Output packs the per-token rows then the
/// final states.
pub fn rwkv_wkv(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let k = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let v = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let r = TV::new(ctx, ctx.tensor(dst).src[2].unwrap());
    let tf = TV::new(ctx, ctx.tensor(dst).src[3].unwrap());
    let td = TV::new(ctx, ctx.tensor(dst).src[4].unwrap());
    let state_in = TV::new(ctx, ctx.tensor(dst).src[5].unwrap());

    let s = k.ne(0);
    let h = k.ne(1);
    let n_t = k.ne(2);
    let n_seqs = state_in.ne(3);
    assert_eq!(n_t % n_seqs, 0, "tokens split evenly across sequences");
    let t_per_seq = n_t / n_seqs;

    let y_len = (s * h * n_t) as usize;
    unsafe {
        let out = d.data as *mut f32;
        let state_out = out.add(y_len);

        for seq in 0..n_seqs {
            for head in 0..h {
                let st = state_out.add(((seq * h + head) * s * s) as usize);
                for i in 0..s {
                    for j in 0..s {
                        *st.add((i * s + j) as usize) = state_in.at_f32(j, i, head, seq);
                    }
                }
                for tt in 0..t_per_seq {
                    let t = seq * t_per_seq + tt;
                    for j in 0..s {
                        let mut y = 0.0f32;
                        for i in 0..s {
                            let kv = k.at_f32(i, head, t, 0) * v.at_f32(j, head, t, 0);
                            let sp = st.add((i * s + j) as usize);
                            y += r.at_f32(i, head, t, 0)
                                * (tf.at_f32(i, head, 0, 0) * kv + *sp);
                            *sp = td.at_f32(i, head, t % td.ne(2), 0) * *sp + kv;
                        }
                        *out.add((j + s * head + s * h * t) as usize) = y;
                    }
                }
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

    #[test]
    fn ssm_conv_is_causal() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        // one channel, width-2 kernel [1, 1]: output = x[t] + x[t+1]
        let sx = ctx.from_slice_f32(&[5, 1, 1], &[0.0, 1.0, 2.0, 3.0, 4.0]);
        let c = ctx.from_slice_f32(&[2, 1], &[1.0, 1.0]);
        let y = ctx.ssm_conv(sx, c);
        let mut g = Graph::new(4);
        g.build_forward_expand(&ctx, y).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
        assert_eq!(ctx.f32s(y), &[1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn rwkv_recurrence_matches_reference() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let (s, h, t) = (2i64, 1i64, 3i64);
        let kv: Vec<f32> = vec![0.5, -0.25, 1.0, 0.75, -0.5, 0.25];
        let vv: Vec<f32> = vec![1.0, 2.0, -1.0, 0.5, 0.25, -0.75];
        let rv: Vec<f32> = vec![0.2, 0.4, -0.6, 0.8, 1.0, -0.2];
        let k = ctx.from_slice_f32(&[s, h, t], &kv);
        let v = ctx.from_slice_f32(&[s, h, t], &vv);
        let r = ctx.from_slice_f32(&[s, h, t], &rv);
        let tf = ctx.from_slice_f32(&[s, h], &[0.3, -0.1]);
        let td = ctx.from_slice_f32(&[s, h, t], &[0.9; 6]);
        let state = ctx.from_slice_f32(&[s, s, h, 1], &[0.0; 4]);
        let y = ctx.rwkv_wkv(k, v, r, tf, td, state);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, y).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);

        // scalar reference of the same recurrence
        let mut st = [[0.0f32; 2]; 2];
        let tfv = [0.3f32, -0.1];
        let out = ctx.f32s(y);
        for tt in 0..3 {
            for j in 0..2 {
                let mut yv = 0.0f32;
                for i in 0..2 {
                    let kvp = kv[tt * 2 + i] * vv[tt * 2 + j];
                    yv += rv[tt * 2 + i] * (tfv[i] * kvp + st[i][j]);
                    st[i][j] = 0.9 * st[i][j] + kvp;
                }
                assert!(
                    (out[tt * 2 + j] - yv).abs() < 1e-5,
                    "t={} j={}: {} vs {}",
                    tt,
                    j,
                    out[tt * 2 + j],
                    yv
                );
            }
        }
    }

    #[test]
    fn ssm_scan_decays_state() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let d_state = 2i64;
        let d_inner = 1i64;
        let n_t = 3i64;
        let s = ctx.from_slice_f32(&[d_state, d_inner, 1], &[0.0, 0.0]);
        let x = ctx.from_slice_f32(&[d_inner, n_t, 1], &[1.0, 1.0, 1.0]);
        let dt = ctx.from_slice_f32(&[d_inner, n_t, 1], &[0.0, 0.0, 0.0]);
        let a = ctx.from_slice_f32(&[d_state, d_inner], &[-1.0, -2.0]);
        let b = ctx.from_slice_f32(&[d_state, n_t, 1], &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        let c = ctx.from_slice_f32(&[d_state, n_t, 1], &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        let y = ctx.ssm_scan(s, x, dt, a, b, c);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, y).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
        let out = ctx.f32s(y);
        // softplus(0) = ln 2; states decay by exp(ln2·A), inputs add ln2·B
        let delta = std::f32::consts::LN_2;
        let mut st = [0.0f32; 2];
        let aa = [-1.0f32, -2.0];
        let mut expect = Vec::new();
        for _t in 0..3 {
            let mut yv = 0.0;
            for j in 0..2 {
                st[j] = st[j] * (delta * aa[j]).exp() + delta;
                yv += st[j];
            }
            expect.push(yv);
        }
        for (o, e) in out.iter().take(3).zip(&expect) {
            assert!((o - e).abs() < 1e-5, "{} vs {}", o, e);
        }
    }
}
