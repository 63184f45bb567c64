//! Binary and unary elementwise kernels over F32 rows, with broadcast on
//! the second operand.
//!
//! Inner loops go through raw pointers: in-place results (e.g. the
//! accumulate path of the backward builder) alias their first source, so
//! no references are formed over the payloads.

use super::{partition, unravel_row, ComputeParams, TV};
use crate::context::Context;
use crate::simd;
use crate::tensor::{OpParams, TensorId, UnaryOp};
use crate::types::DType;

fn binary(p: &ComputeParams, ctx: &Context, dst: TensorId, f: impl Fn(f32, f32) -> f32) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert_eq!(d.t.dtype, DType::F32);
    assert_eq!(a.t.dtype, DType::F32);
    assert_eq!(b.t.dtype, DType::F32);
    assert!(d.t.same_shape(a.t));

    let fast =
        d.t.has_contiguous_rows() && a.t.has_contiguous_rows() && b.t.has_contiguous_rows();
    let ne0 = d.ne(0);
    let ne10 = b.ne(0);
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        let (b1, b2, b3) = (i1 % b.ne(1), i2 % b.ne(2), i3 % b.ne(3));
        unsafe {
            if fast {
                let dr = d.row_ptr(i1, i2, i3) as *mut f32;
                let ar = a.row_ptr(i1, i2, i3) as *const f32;
                let br = b.row_ptr(b1, b2, b3) as *const f32;
                if ne10 == ne0 {
                    for i in 0..ne0 as usize {
                        *dr.add(i) = f(*ar.add(i), *br.add(i));
                    }
                } else {
                    for i in 0..ne0 as usize {
                        *dr.add(i) = f(*ar.add(i), *br.add(i % ne10 as usize));
                    }
                }
            } else {
                for i0 in 0..ne0 {
                    let va = a.at_f32(i0, i1, i2, i3);
                    let vb = b.at_f32(i0 % ne10, b1, b2, b3);
                    d.set_at_f32(i0, i1, i2, i3, f(va, vb));
                }
            }
        }
    }
}

pub fn add(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    binary(p, ctx, dst, |x, y| x + y);
}

pub fn sub(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    binary(p, ctx, dst, |x, y| x - y);
}

pub fn mul(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    binary(p, ctx, dst, |x, y| x * y);
}

pub fn div(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    binary(p, ctx, dst, |x, y| x / y);
}

pub fn add1(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let v = unsafe { b.at_f32(0, 0, 0, 0) };
    map(p, ctx, dst, move |x| x + v);
}

pub fn scale(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let OpParams::Scale { s } = ctx.tensor(dst).params else {
        unreachable!()
    };
    map(p, ctx, dst, move |x| x * s);
}

pub fn clamp(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let OpParams::Clamp { min, max } = ctx.tensor(dst).params else {
        unreachable!()
    };
    map(p, ctx, dst, move |x| x.clamp(min, max));
}

pub fn leaky_relu(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let OpParams::LeakyRelu { slope } = ctx.tensor(dst).params else {
        unreachable!()
    };
    map(p, ctx, dst, move |x| if x > 0.0 { x } else { slope * x });
}

/// Apply `f` elementwise from src0 into dst; rows partitioned by thread.
pub fn map(p: &ComputeParams, ctx: &Context, dst: TensorId, f: impl Fn(f32) -> f32) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    assert_eq!(d.t.dtype, DType::F32);
    assert_eq!(a.t.dtype, DType::F32);
    assert!(d.t.same_shape(a.t));

    let fast = d.t.has_contiguous_rows() && a.t.has_contiguous_rows();
    let ne0 = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            if fast {
                let dr = d.row_ptr(i1, i2, i3) as *mut f32;
                let ar = a.row_ptr(i1, i2, i3) as *const f32;
                for i in 0..ne0 {
                    *dr.add(i) = f(*ar.add(i));
                }
            } else {
                for i0 in 0..d.ne(0) {
                    d.set_at_f32(i0, i1, i2, i3, f(a.at_f32(i0, i1, i2, i3)));
                }
            }
        }
    }
}

pub fn unary(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let OpParams::Unary(u) = ctx.tensor(dst).params else {
        unreachable!()
    };
    match u {
        UnaryOp::Abs => map(p, ctx, dst, f32::abs),
        UnaryOp::Sgn => map(p, ctx, dst, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }),
        UnaryOp::Neg => map(p, ctx, dst, |x| -x),
        UnaryOp::Step => map(p, ctx, dst, |x| if x > 0.0 { 1.0 } else { 0.0 }),
        UnaryOp::Tanh => map(p, ctx, dst, f32::tanh),
        UnaryOp::Elu => map(p, ctx, dst, |x| if x > 0.0 { x } else { x.exp_m1() }),
        UnaryOp::Relu => map(p, ctx, dst, |x| x.max(0.0)),
        UnaryOp::Sigmoid => map(p, ctx, dst, |x| 1.0 / (1.0 + (-x).exp())),
        UnaryOp::Gelu => map(p, ctx, dst, simd::gelu_f32),
        UnaryOp::GeluQuick => map(p, ctx, dst, simd::gelu_quick_f32),
        UnaryOp::Silu => map(p, ctx, dst, simd::silu_f32),
        UnaryOp::HardSwish => map(p, ctx, dst, |x| x * ((x + 3.0) / 6.0).clamp(0.0, 1.0)),
        UnaryOp::HardSigmoid => map(p, ctx, dst, |x| ((x + 3.0) / 6.0).clamp(0.0, 1.0)),
        UnaryOp::Exp => map(p, ctx, dst, f32::exp),
    }
}

/// `dst = silu'(a) · g` with srcs `[a, g]`.
pub fn silu_back(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let g = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert!(d.t.same_shape(a.t) && d.t.same_shape(g.t));

    let ne0 = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            let gr = g.row_ptr(i1, i2, i3) as *const f32;
            for i in 0..ne0 {
                *dr.add(i) = simd::silu_backward_f32(*ar.add(i), *gr.add(i));
            }
        }
    }
}
