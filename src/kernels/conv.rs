//! Convolution-adjacent kernels: im2col unfolding, transposed
//! convolutions and pooling.

use super::{partition, ComputeParams, TV};
use crate::context::Context;
use crate::tensor::{OpParams, PoolOp, TensorId};
use crate::types::DType;

/// Unfold image patches into rows so convolution becomes a matmul.
pub fn im2col(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let kernel = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let img = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let OpParams::Im2Col {
        s0,
        s1,
        p0,
        p1,
        d0,
        d1,
        is_2d,
    } = ctx.tensor(dst).params
    else {
        unreachable!()
    };
    assert_eq!(d.t.dtype, DType::F32);

    if is_2d {
        let (kw, kh, cin) = (kernel.ne(0), kernel.ne(1), kernel.ne(2));
        let (w, h) = (img.ne(0), img.ne(1));
        let ow = (w + 2 * p0 as i64 - d0 as i64 * (kw - 1) - 1) / s0 as i64 + 1;
        let oh = (h + 2 * p1 as i64 - d1 as i64 * (kh - 1) - 1) / s1 as i64 + 1;
        let n = img.ne(3);

        let total = ow * oh * n;
        let (t0, t1) = partition(total, p.ith, p.nth);
        for ti in t0..t1 {
            let i3 = ti / (ow * oh);
            let rem = ti % (ow * oh);
            let oy = rem / ow;
            let ox = rem % ow;
            unsafe {
                let dr = d.row_ptr(rem, i3, 0) as *mut f32;
                let mut col = 0usize;
                for c in 0..cin {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let ix = ox * s0 as i64 + kx * d0 as i64 - p0 as i64;
                            let iy = oy * s1 as i64 + ky * d1 as i64 - p1 as i64;
                            let v = if ix >= 0 && ix < w && iy >= 0 && iy < h {
                                img.at_f32(ix, iy, c, i3)
                            } else {
                                0.0
                            };
                            *dr.add(col) = v;
                            col += 1;
                        }
                    }
                }
            }
        }
    } else {
        let (kw, cin) = (kernel.ne(0), kernel.ne(1));
        let w = img.ne(0);
        let ow = (w + 2 * p0 as i64 - d0 as i64 * (kw - 1) - 1) / s0 as i64 + 1;
        let n = img.ne(2);

        let total = ow * n;
        let (t0, t1) = partition(total, p.ith, p.nth);
        for ti in t0..t1 {
            let i2 = ti / ow;
            let ox = ti % ow;
            unsafe {
                let dr = d.row_ptr(ox, i2, 0) as *mut f32;
                let mut col = 0usize;
                for c in 0..cin {
                    for kx in 0..kw {
                        let ix = ox * s0 as i64 + kx * d0 as i64 - p0 as i64;
                        let v = if ix >= 0 && ix < w {
                            img.at_f32(ix, c, i2, 0)
                        } else {
                            0.0
                        };
                        *dr.add(col) = v;
                        col += 1;
                    }
                }
            }
        }
    }
}

/// Transposed 1-d convolution, single-threaded: kernel `[k, Cout, Cin]`,
/// input `[L, Cin, 1]`.
pub fn conv_transpose_1d(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let kernel = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let OpParams::ConvTranspose1d { s0 } = ctx.tensor(dst).params else {
        unreachable!()
    };

    unsafe {
        std::ptr::write_bytes(d.data, 0, d.t.nbytes());
        for cout in 0..kernel.ne(1) {
            let dr = d.row_ptr(cout, 0, 0) as *mut f32;
            for cin in 0..kernel.ne(2) {
                for l in 0..b.ne(0) {
                    let x = b.at_f32(l, cin, 0, 0);
                    if x == 0.0 {
                        continue;
                    }
                    for kx in 0..kernel.ne(0) {
                        let w = kernel.at_f32(kx, cout, cin, 0);
                        *dr.add((l * s0 as i64 + kx) as usize) += x * w;
                    }
                }
            }
        }
    }
}

/// Transposed 2-d convolution: threads own disjoint output channels, so
/// each zeroes and accumulates its own planes.
pub fn conv_transpose_2d(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let kernel = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let OpParams::ConvTranspose2d { stride } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let st = stride as i64;

    let (c0, c1) = partition(kernel.ne(2), p.ith, p.nth);
    for n in 0..b.ne(3) {
        for cout in c0..c1 {
            unsafe {
                for oy in 0..d.ne(1) {
                    let dr = d.row_ptr(oy, cout, n) as *mut f32;
                    std::ptr::write_bytes(dr as *mut u8, 0, d.ne(0) as usize * 4);
                }
                for cin in 0..b.ne(2) {
                    for iy in 0..b.ne(1) {
                        for ix in 0..b.ne(0) {
                            let x = b.at_f32(ix, iy, cin, n);
                            if x == 0.0 {
                                continue;
                            }
                            for ky in 0..kernel.ne(1) {
                                let dr = d.row_ptr(iy * st + ky, cout, n) as *mut f32;
                                for kx in 0..kernel.ne(0) {
                                    let w = kernel.at_f32(kx, ky, cout, cin);
                                    *dr.add((ix * st + kx) as usize) += x * w;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn pool_reduce(op: PoolOp, acc: f32, v: f32) -> f32 {
    match op {
        PoolOp::Max => acc.max(v),
        PoolOp::Avg => acc + v,
    }
}

pub fn pool_1d(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::Pool { op, k0, s0, p0, .. } = ctx.tensor(dst).params else {
        unreachable!()
    };

    for i2 in 0..d.ne(2) {
        for i1 in 0..d.ne(1) {
            unsafe {
                let dr = d.row_ptr(i1, i2, 0) as *mut f32;
                for ox in 0..d.ne(0) {
                    let mut acc = match op {
                        PoolOp::Max => f32::NEG_INFINITY,
                        PoolOp::Avg => 0.0,
                    };
                    for kx in 0..k0 as i64 {
                        let ix = ox * s0 as i64 + kx - p0 as i64;
                        let v = if ix >= 0 && ix < a.ne(0) {
                            a.at_f32(ix, i1, i2, 0)
                        } else {
                            0.0
                        };
                        acc = pool_reduce(op, acc, v);
                    }
                    if op == PoolOp::Avg {
                        acc /= k0 as f32;
                    }
                    *dr.add(ox as usize) = acc;
                }
            }
        }
    }
}

pub fn pool_2d(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::Pool {
        op,
        k0,
        k1,
        s0,
        s1,
        p0,
        p1,
    } = ctx.tensor(dst).params
    else {
        unreachable!()
    };

    for i3 in 0..d.ne(3) {
        for i2 in 0..d.ne(2) {
            for oy in 0..d.ne(1) {
                unsafe {
                    let dr = d.row_ptr(oy, i2, i3) as *mut f32;
                    for ox in 0..d.ne(0) {
                        let mut acc = match op {
                            PoolOp::Max => f32::NEG_INFINITY,
                            PoolOp::Avg => 0.0,
                        };
                        for ky in 0..k1 as i64 {
                            for kx in 0..k0 as i64 {
                                let ix = ox * s0 as i64 + kx - p0 as i64;
                                let iy = oy * s1 as i64 + ky - p1 as i64;
                                let v = if ix >= 0 && ix < a.ne(0) && iy >= 0 && iy < a.ne(1) {
                                    a.at_f32(ix, iy, i2, i3)
                                } else {
                                    0.0
                                };
                                acc = pool_reduce(op, acc, v);
                            }
                        }
                        if op == PoolOp::Avg {
                            acc /= (k0 * k1) as f32;
                        }
                        *dr.add(ox as usize) = acc;
                    }
                }
            }
        }
    }
}

/// Adjoint of pool_2d: max pooling scatters the gradient to each window's
/// argmax (recomputed from the forward input), average pooling spreads it
/// uniformly.
pub fn pool_2d_back(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let g = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let orig = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let OpParams::Pool {
        op,
        k0,
        k1,
        s0,
        s1,
        p0,
        p1,
    } = ctx.tensor(dst).params
    else {
        unreachable!()
    };

    unsafe {
        std::ptr::write_bytes(d.data, 0, d.t.nbytes());
        for i3 in 0..g.ne(3) {
            for i2 in 0..g.ne(2) {
                for oy in 0..g.ne(1) {
                    for ox in 0..g.ne(0) {
                        let gv = g.at_f32(ox, oy, i2, i3);
                        match op {
                            PoolOp::Max => {
                                let mut best = f32::NEG_INFINITY;
                                let mut best_ix = -1i64;
                                let mut best_iy = -1i64;
                                for ky in 0..k1 as i64 {
                                    for kx in 0..k0 as i64 {
                                        let ix = ox * s0 as i64 + kx - p0 as i64;
                                        let iy = oy * s1 as i64 + ky - p1 as i64;
                                        if ix >= 0 && ix < orig.ne(0) && iy >= 0 && iy < orig.ne(1)
                                        {
                                            let v = orig.at_f32(ix, iy, i2, i3);
                                            if v > best {
                                                best = v;
                                                best_ix = ix;
                                                best_iy = iy;
                                            }
                                        }
                                    }
                                }
                                if best_ix >= 0 {
                                    let dr = d.row_ptr(best_iy, i2, i3) as *mut f32;
                                    *dr.add(best_ix as usize) += gv;
                                }
                            }
                            PoolOp::Avg => {
                                let share = gv / (k0 * k1) as f32;
                                for ky in 0..k1 as i64 {
                                    for kx in 0..k0 as i64 {
                                        let ix = ox * s0 as i64 + kx - p0 as i64;
                                        let iy = oy * s1 as i64 + ky - p1 as i64;
                                        if ix >= 0 && ix < orig.ne(0) && iy >= 0 && iy < orig.ne(1)
                                        {
                                            let dr = d.row_ptr(iy, i2, i3) as *mut f32;
                                            *dr.add(ix as usize) += share;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
