//! Data-movement kernels: copies with type conversion, strided writes,
//! gathers/scatters, tiling and index generation.

use super::{partition, unravel_row, ComputeParams, TV};
use crate::context::Context;
use crate::quant;
use crate::tensor::{OpParams, SortOrder, TensorId};
use crate::types::DType;
use half::{bf16, f16};

/// DUP / CPY / CONT: copy src0 into dst, converting the storage type where
/// needed. Rows are partitioned across threads.
pub fn copy(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    assert_eq!(d.t.nelements(), a.t.nelements());

    // same type, both dense: rowwise byte copy
    if d.t.dtype == a.t.dtype
        && d.t.same_shape(a.t)
        && d.t.has_contiguous_rows()
        && a.t.has_contiguous_rows()
    {
        let row_bytes = d.t.row_bytes();
        let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
        for ir in r0..r1 {
            let (i1, i2, i3) = unravel_row(d.t, ir);
            unsafe {
                std::ptr::copy_nonoverlapping(a.row_ptr(i1, i2, i3), d.row_ptr(i1, i2, i3), row_bytes);
            }
        }
        return;
    }

    // float-ish source with matching shape: rowwise convert
    if d.t.same_shape(a.t) && a.t.has_contiguous_rows() && d.t.has_contiguous_rows() {
        let ne0 = d.ne(0) as usize;
        let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
        for ir in r0..r1 {
            let (i1, i2, i3) = unravel_row(d.t, ir);
            unsafe {
                convert_row(
                    a.t.dtype,
                    a.row_ptr(i1, i2, i3),
                    d.t.dtype,
                    d.row_ptr(i1, i2, i3),
                    ne0,
                    p,
                );
            }
        }
        return;
    }

    // general path: walk dst coordinates, pull the matching flat element
    // from src. F32/F16 only; quantized tensors are always dense.
    assert!(
        matches!(d.t.dtype, DType::F32 | DType::F16),
        "strided copy supports float tensors"
    );
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    let ane = a.t.ne;
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        for i0 in 0..d.ne(0) {
            let flat = i0 + d.ne(0) * (i1 + d.ne(1) * (i2 + d.ne(2) * i3));
            let a0 = flat % ane[0];
            let a1 = flat / ane[0] % ane[1];
            let a2 = flat / (ane[0] * ane[1]) % ane[2];
            let a3 = flat / (ane[0] * ane[1] * ane[2]);
            unsafe {
                let v = a.at_float(a0, a1, a2, a3);
                match d.t.dtype {
                    DType::F32 => d.set_at_f32(i0, i1, i2, i3, v),
                    DType::F16 => {
                        let ptr = d.row_ptr(i1, i2, i3) as *mut f16;
                        *ptr.add(i0 as usize) = f16::from_f32(v);
                    }
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// One row of type conversion; quantized destinations stage through the
/// per-thread scratch area.
unsafe fn convert_row(
    st: DType,
    src: *const u8,
    dt: DType,
    dst: *mut u8,
    n: usize,
    p: &ComputeParams,
) {
    let src_bytes = std::slice::from_raw_parts(src, st.row_size(n));
    let dst_bytes = std::slice::from_raw_parts_mut(dst, dt.row_size(n));
    match (st, dt) {
        (DType::F32, _) => quant::quantize_row(dt, bytemuck::cast_slice(src_bytes), dst_bytes),
        (_, DType::F32) => quant::dequantize_row(st, src_bytes, bytemuck::cast_slice_mut(dst_bytes)),
        (DType::F16, DType::BF16) | (DType::BF16, DType::F16) => {
            for i in 0..n {
                let v = if st == DType::F16 {
                    (*(src as *const f16).add(i)).to_f32()
                } else {
                    (*(src as *const bf16).add(i)).to_f32()
                };
                if dt == DType::F16 {
                    *(dst as *mut f16).add(i) = f16::from_f32(v);
                } else {
                    *(dst as *mut bf16).add(i) = bf16::from_f32(v);
                }
            }
        }
        _ => {
            // arbitrary pair: stage through f32 scratch
            let tmp = p.thread_scratch_f32(n);
            quant::dequantize_row(st, src_bytes, tmp);
            quant::quantize_row(dt, tmp, dst_bytes);
        }
    }
}

/// SET / ACC: dst is a copy of src0 (done by thread 0, then a barrier) and
/// src1 is written (SET) or added (ACC) into a strided window of it.
fn set_impl(p: &ComputeParams, ctx: &Context, dst: TensorId, accumulate: bool) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let OpParams::SetSlice {
        nb1,
        nb2,
        nb3,
        offset,
        inplace,
    } = ctx.tensor(dst).params
    else {
        unreachable!()
    };

    if !inplace {
        assert!(a.t.is_contiguous() && d.t.is_contiguous());
        if p.ith == 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(a.data, d.data, d.t.nbytes());
            }
        }
        p.barrier();
    }

    // view of dst shaped like src1
    let (r0, r1) = partition(b.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(b.t, ir);
        unsafe {
            let br = b.row_ptr(i1, i2, i3) as *const f32;
            let dr = d
                .data
                .add(offset + i1 as usize * nb1 + i2 as usize * nb2 + i3 as usize * nb3)
                as *mut f32;
            for i0 in 0..b.ne(0) as usize {
                if accumulate {
                    *dr.add(i0) += *br.add(i0);
                } else {
                    *dr.add(i0) = *br.add(i0);
                }
            }
        }
    }
}

pub fn set(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    set_impl(p, ctx, dst, false);
}

pub fn acc(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    set_impl(p, ctx, dst, true);
}

/// Gather rows by I32 index; quantized sources are decoded into the F32
/// destination rows.
pub fn get_rows(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let idx = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let ne0 = d.ne(0) as usize;
    assert_eq!(ne0 as i64, a.ne(0));

    for i12 in 0..idx.ne(2) {
        for i11 in 0..idx.ne(1) {
            for i10 in 0..idx.ne(0) {
                unsafe {
                    let r = idx.at_i32(i10, i11, i12, 0) as i64;
                    assert!(r >= 0 && r < a.ne(1), "row index {} out of range", r);
                    let dr = d.row_f32(i10, i11, i12);
                    let src = a.row_ptr(r, i11 % a.ne(2), i12 % a.ne(3));
                    let src_bytes =
                        std::slice::from_raw_parts(src, a.t.dtype.row_size(ne0));
                    quant::dequantize_row(a.t.dtype, src_bytes, dr);
                }
            }
        }
    }
}

/// Adjoint of get_rows: zero dst, scatter-add the gradient rows.
pub fn get_rows_back(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let g = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let idx = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    assert_eq!(d.t.dtype, DType::F32);

    unsafe {
        std::ptr::write_bytes(d.data, 0, d.t.nbytes());
        for i11 in 0..idx.ne(1) {
            for i10 in 0..idx.ne(0) {
                let r = idx.at_i32(i10, i11, 0, 0) as i64;
                let dr = d.row_ptr(r, i11, 0) as *mut f32;
                let gr = g.row_ptr(i10, i11, 0) as *const f32;
                for i in 0..g.ne(0) as usize {
                    *dr.add(i) += *gr.add(i);
                }
            }
        }
    }
}

/// Tile src0 over the destination shape.
pub fn repeat(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    assert!(d.t.can_repeat(a.t));
    assert_eq!(d.t.dtype, DType::F32);

    let ne10 = a.ne(0);
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let ar = a.row_ptr(i1 % a.ne(1), i2 % a.ne(2), i3 % a.ne(3)) as *const f32;
            for i0 in 0..d.ne(0) as usize {
                *dr.add(i0) = *ar.add(i0 % ne10 as usize);
            }
        }
    }
}

/// Sum the tiles of src0 down to the destination shape.
pub fn repeat_back(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    assert!(a.t.can_repeat(d.t));
    assert_eq!(d.t.dtype, DType::F32);

    let (k0, k1, k2, k3) = (
        a.ne(0) / d.ne(0),
        a.ne(1) / d.ne(1),
        a.ne(2) / d.ne(2),
        a.ne(3) / d.ne(3),
    );
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            for i0 in 0..d.ne(0) {
                let mut sum = 0.0f32;
                for t3 in 0..k3 {
                    for t2 in 0..k2 {
                        for t1 in 0..k1 {
                            let ar = a.row_ptr(
                                i1 + t1 * d.ne(1),
                                i2 + t2 * d.ne(2),
                                i3 + t3 * d.ne(3),
                            ) as *const f32;
                            for t0 in 0..k0 {
                                sum += *ar.add((i0 + t0 * d.ne(0)) as usize);
                            }
                        }
                    }
                }
                *dr.add(i0 as usize) = sum;
            }
        }
    }
}

pub fn concat(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let b = TV::new(ctx, ctx.tensor(dst).src[1].unwrap());
    let OpParams::Concat { dim } = ctx.tensor(dst).params else {
        unreachable!()
    };
    assert_eq!(d.t.dtype, DType::F32);

    let split = a.ne(dim);
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        for i0 in 0..d.ne(0) {
            let idx = [i0, i1, i2, i3];
            let v = unsafe {
                if idx[dim] < split {
                    a.at_f32(i0, i1, i2, i3)
                } else {
                    let mut j = idx;
                    j[dim] -= split;
                    b.at_f32(j[0], j[1], j[2], j[3])
                }
            };
            unsafe { d.set_at_f32(i0, i1, i2, i3, v) };
        }
    }
}

pub fn diag(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    if p.ith != 0 {
        return;
    }
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    for i3 in 0..d.ne(3) {
        for i2 in 0..d.ne(2) {
            for i1 in 0..d.ne(1) {
                unsafe {
                    let dr = d.row_ptr(i1, i2, i3) as *mut f32;
                    for i0 in 0..d.ne(0) {
                        *dr.add(i0 as usize) = if i0 == i1 {
                            a.at_f32(i0, 0, i2, i3)
                        } else {
                            0.0
                        };
                    }
                }
            }
        }
    }
}

/// Copy src0 and overwrite the entries above the shifted diagonal with
/// `value` (used with `-inf` and `0`).
pub fn diag_mask(p: &ComputeParams, ctx: &Context, dst: TensorId, value: f32) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::DiagMask { n_past } = ctx.tensor(dst).params else {
        unreachable!()
    };
    assert_eq!(d.t.dtype, DType::F32);

    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            for i0 in 0..d.ne(0) {
                *dr.add(i0 as usize) = if i0 > n_past as i64 + i1 {
                    value
                } else {
                    *ar.add(i0 as usize)
                };
            }
        }
    }
}

pub fn pad(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        let inside_outer = i1 < a.ne(1) && i2 < a.ne(2) && i3 < a.ne(3);
        unsafe {
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            for i0 in 0..d.ne(0) {
                let v = if inside_outer && i0 < a.ne(0) {
                    a.at_f32(i0, i1, i2, i3)
                } else {
                    0.0
                };
                *dr.add(i0 as usize) = v;
            }
        }
    }
}

/// Nearest-neighbour upscale: integer scale factor per dimension.
pub fn upscale(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let sf = [
        d.ne(0) / a.ne(0),
        d.ne(1) / a.ne(1),
        d.ne(2) / a.ne(2),
        d.ne(3) / a.ne(3),
    ];
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let dr = d.row_ptr(i1, i2, i3) as *mut f32;
            for i0 in 0..d.ne(0) {
                let v = a.at_f32(i0 / sf[0], i1 / sf[1], i2 / sf[2], i3 / sf[3]);
                *dr.add(i0 as usize) = v;
            }
        }
    }
}

pub fn arange(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let OpParams::Arange { start, step, .. } = ctx.tensor(dst).params else {
        unreachable!()
    };
    if p.ith != 0 {
        return;
    }
    unsafe {
        let dr = d.row_ptr(0, 0, 0) as *mut f32;
        for i in 0..d.ne(0) {
            *dr.add(i as usize) = start + step * i as f32;
        }
    }
}

/// Sinusoidal embedding of scalar timesteps: the first half of each row is
/// cosines, the second half sines, over log-spaced frequencies.
pub fn timestep_embedding(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let ts = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::TimestepEmbedding { dim, max_period } = ctx.tensor(dst).params else {
        unreachable!()
    };
    let half = dim / 2;
    let (r0, r1) = partition(d.ne(1), p.ith, p.nth);
    for i1 in r0..r1 {
        unsafe {
            let t = ts.at_f32(i1, 0, 0, 0);
            let dr = d.row_ptr(i1, 0, 0) as *mut f32;
            for j in 0..half {
                let freq = (-(max_period as f32).ln() * j as f32 / half as f32).exp();
                let arg = t * freq;
                *dr.add(j) = arg.cos();
                *dr.add(j + half) = arg.sin();
            }
            for j in 2 * half..d.ne(0) as usize {
                *dr.add(j) = 0.0;
            }
        }
    }
}

/// Stable per-row insertion sort of indices; deliberately O(n²), rows are
/// short (top-k heads).
pub fn argsort(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let d = TV::new(ctx, dst);
    let a = TV::new(ctx, ctx.tensor(dst).src[0].unwrap());
    let OpParams::Argsort { order } = ctx.tensor(dst).params else {
        unreachable!()
    };
    assert_eq!(d.t.dtype, DType::I32);

    let n = d.ne(0) as usize;
    let (r0, r1) = partition(d.nrows(), p.ith, p.nth);
    for ir in r0..r1 {
        let (i1, i2, i3) = unravel_row(d.t, ir);
        unsafe {
            let dr = d.row_i32(i1, i2, i3);
            let ar = a.row_ptr(i1, i2, i3) as *const f32;
            for (i, v) in dr.iter_mut().enumerate() {
                *v = i as i32;
            }
            for i in 1..n {
                let key = dr[i];
                let kv = *ar.add(key as usize);
                let mut j = i;
                while j > 0 {
                    let pv = *ar.add(dr[j - 1] as usize);
                    let swap = match order {
                        SortOrder::Asc => pv > kv,
                        SortOrder::Desc => pv < kv,
                    };
                    if !swap {
                        break;
                    }
                    dr[j] = dr[j - 1];
                    j -= 1;
                }
                dr[j] = key;
            }
        }
    }
}
