//! Rotary position embedding, forward and inverse, with optional YaRN
//! frequency rescaling and per-frequency factors.

use super::{partition, unravel_row, ComputeParams, TV};
use crate::context::Context;
use crate::tensor::{OpParams, RopeMode, TensorId};
use crate::types::DType;

/// YaRN correction dimension for a rotation count `n_rot` at `base`.
fn corr_dim(n_dims: usize, n_ctx_orig: usize, n_rot: f32, base: f32) -> f32 {
    n_dims as f32 * (n_ctx_orig as f32 / (n_rot * 2.0 * std::f32::consts::PI)).ln()
        / (2.0 * base.ln())
}

fn corr_dims(
    n_dims: usize,
    n_ctx_orig: usize,
    base: f32,
    beta_fast: f32,
    beta_slow: f32,
) -> (f32, f32) {
    let start = corr_dim(n_dims, n_ctx_orig, beta_fast, base).floor().max(0.0);
    let end = corr_dim(n_dims, n_ctx_orig, beta_slow, base)
        .ceil()
        .min(n_dims as f32 - 1.0);
    (start, end)
}

fn ramp(low: f32, high: f32, i0: usize) -> f32 {
    let y = (i0 as f32 / 2.0 - low) / (high - low).max(0.001);
    1.0 - y.clamp(0.0, 1.0)
}

/// Mix interpolated and extrapolated angles over the correction band and
/// rescale magnitude, per YaRN.
#[allow(clippy::too_many_arguments)]
fn rope_yarn(
    theta_extrap: f32,
    freq_scale: f32,
    corr: (f32, f32),
    i0: usize,
    ext_factor: f32,
    mut mscale: f32,
) -> (f32, f32) {
    let theta_interp = freq_scale * theta_extrap;
    let mut theta = theta_interp;
    if ext_factor != 0.0 {
        let ramp_mix = ramp(corr.0, corr.1, i0) * ext_factor;
        theta = theta_interp * (1.0 - ramp_mix) + theta_extrap * ramp_mix;
        mscale *= 1.0 + 0.1 * (1.0 / freq_scale).ln();
    }
    (theta.cos() * mscale, theta.sin() * mscale)
}

pub fn rope(p: &ComputeParams, ctx: &Context, dst: TensorId, forward: bool) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let pos = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let ff = ctx.tensor(dst).src[2].map(|f| TV::new(ctx, f));
    let OpParams::Rope(rp) = ctx.tensor(dst).params else {
        unreachable!()
    };
    assert_eq!(d.t.dtype, DType::F32);
    assert_eq!(pos.t.dtype, DType::I32);

    let n_dims = rp.n_dims;
    let theta_scale = rp.freq_base.powf(-2.0 / n_dims as f32);
    let corr = corr_dims(n_dims, rp.n_ctx_orig, rp.freq_base, rp.beta_fast, rp.beta_slow);
    // the inverse rotation flips the sine sign
    let sin_sign = if forward { 1.0f32 } else { -1.0 };

    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        let pos_v = unsafe { pos.at_i32(i2, 0, 0, 0) } as f32;
        unsafe {
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let mut theta_base = pos_v;
            for i0 in (0..n_dims).step_by(2) {
                let freq_factor = match &ff {
                    Some(f) => *(f.data as *const f32).add(i0 / 2),
                    None => 1.0,
                };
                let theta_extrap = theta_base / freq_factor;
                let (cos_t, sin_t) = rope_yarn(
                    theta_extrap,
                    rp.freq_scale,
                    corr,
                    i0,
                    rp.ext_factor,
                    rp.attn_factor,
                );
                let sin_t = sin_t * sin_sign;
                theta_base *= theta_scale;

                match rp.mode {
                    RopeMode::GptJ => {
                        let x0 = *ar.add(i0);
                        let x1 = *ar.add(i0 + 1);
                        *dr.add(i0) = x0 * cos_t - x1 * sin_t;
                        *dr.add(i0 + 1) = x0 * sin_t + x1 * cos_t;
                    }
                    RopeMode::Neox => {
                        let j0 = i0 / 2;
                        let j1 = i0 / 2 + n_dims / 2;
                        let x0 = *ar.add(j0);
                        let x1 = *ar.add(j1);
                        *dr.add(j0) = x0 * cos_t - x1 * sin_t;
                        *dr.add(j1) = x0 * sin_t + x1 * cos_t;
                    }
                }
            }
            // dimensions beyond the rotated span pass through
            for i0 in n_dims..d.ne(0) as usize {
                *dr.add(i0) = *ar.add(i0);
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
    use crate::tensor::RopeParams;

    #[test]
    fn rope_then_back_is_identity() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let n_dims = 16;
        let tokens = 8;
        let vals: Vec<f32> = (0..n_dims * tokens)
            .map(|i| ((i * 13 % 29) as f32 - 14.0) * 0.1)
            .collect();
        let x = ctx.from_slice_f32(&[n_dims as i64, 1, tokens as i64], &vals);
        let pos_vals: Vec<i32> = (0..tokens as i32).collect();
        let pos = ctx.from_slice_i32(&[tokens as i64], &pos_vals);
        let rp = RopeParams {
            n_dims,
            ..Default::default()
        };
        let fwd = ctx.rope(x, pos, rp);
        let back = ctx.rope_back(fwd, pos, None, rp);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, back).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
        let out = ctx.f32s(back);
        for (xv, yv) in vals.iter().zip(out) {
            assert!((xv - yv).abs() < 1e-3, "{} vs {}", xv, yv);
        }
    }

    #[test]
    fn position_zero_is_identity() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let vals: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let x = ctx.from_slice_f32(&[8, 1, 1], &vals);
        let pos = ctx.from_slice_i32(&[1], &[0]);
        let rp = RopeParams {
            n_dims: 8,
            ..Default::default()
        };
        let y = ctx.rope(x, pos, rp);
        let mut g = Graph::new(4);
        g.build_forward_expand(&ctx, y).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
        for (a, b) in vals.iter().zip(ctx.f32s(y)) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
