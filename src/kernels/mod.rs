//! Forward compute kernels, dispatched by op code.
//!
//! Every kernel has the same shape: partition destination rows across
//! `ith ∈ [0, nth)`, read sources through raw strided pointers, write only
//! the owned rows. Kernels that need a cross-thread reduction or an
//! in-place initialization issue intra-node barriers through the shared
//! pool state. The scalar bodies here are the reference numerical
//! behaviour.

mod attention;
mod conv;
mod elementwise;
mod matmul;
mod movement;
mod norm;
mod reduce;
mod rope;
mod ssm;

use crate::context::Context;
use crate::pool::Shared;
use crate::tensor::{Op, Tensor, TensorId};
use crate::types::DType;
use half::f16;

pub(crate) struct ComputeParams<'a> {
    pub ith: usize,
    pub nth: usize,
    pub work: *mut u8,
    pub work_size: usize,
    pub shared: &'a Shared,
}

impl ComputeParams<'_> {
    #[inline]
    pub fn barrier(&self) {
        self.shared.barrier();
    }

    /// Per-thread f32 scratch slice of `len` elements, cache-line spaced.
    ///
    /// # Safety
    /// The plan must have sized the work buffer for `nth` slices.
    pub unsafe fn thread_scratch_f32(&self, len: usize) -> &mut [f32] {
        let stride = len * 4 + 64;
        debug_assert!(stride * self.nth <= self.work_size + 64);
        let base = self.work.add(self.ith * stride) as *mut f32;
        std::slice::from_raw_parts_mut(base, len)
    }

    /// Whole work buffer, shared across threads; callers partition it.
    pub fn work_bytes(&self) -> *mut u8 {
        self.work
    }
}

/// A tensor descriptor paired with its resolved payload pointer.
#[derive(Clone, Copy)]
pub(crate) struct TV<'a> {
    pub t: &'a Tensor,
    pub data: *mut u8,
}

impl<'a> TV<'a> {
    pub fn new(ctx: &'a Context, id: TensorId) -> TV<'a> {
        TV {
            t: ctx.tensor(id),
            data: ctx.data_ptr(id),
        }
    }

    #[inline]
    pub fn ne(&self, i: usize) -> i64 {
        self.t.ne[i]
    }

    #[inline]
    pub fn nrows(&self) -> i64 {
        self.t.nrows()
    }

    #[inline]
    pub unsafe fn row_ptr(&self, i1: i64, i2: i64, i3: i64) -> *mut u8 {
        self.data.add(
            i1 as usize * self.t.nb[1] + i2 as usize * self.t.nb[2] + i3 as usize * self.t.nb[3],
        )
    }

    /// Dense f32 row; requires contiguous elements along dim 0.
    #[inline]
    pub unsafe fn row_f32(&self, i1: i64, i2: i64, i3: i64) -> &'a mut [f32] {
        debug_assert_eq!(self.t.dtype, DType::F32);
        debug_assert!(self.t.has_contiguous_rows());
        std::slice::from_raw_parts_mut(self.row_ptr(i1, i2, i3) as *mut f32, self.ne(0) as usize)
    }

    #[inline]
    pub unsafe fn row_i32(&self, i1: i64, i2: i64, i3: i64) -> &'a mut [i32] {
        debug_assert_eq!(self.t.dtype, DType::I32);
        debug_assert!(self.t.has_contiguous_rows());
        std::slice::from_raw_parts_mut(self.row_ptr(i1, i2, i3) as *mut i32, self.ne(0) as usize)
    }

    /// Fully strided scalar accessors for permuted/transposed operands.
    #[inline]
    pub unsafe fn at_f32(&self, i0: i64, i1: i64, i2: i64, i3: i64) -> f32 {
        *(self.elem_ptr(i0, i1, i2, i3) as *const f32)
    }

    #[inline]
    pub unsafe fn set_at_f32(&self, i0: i64, i1: i64, i2: i64, i3: i64, v: f32) {
        *(self.elem_ptr(i0, i1, i2, i3) as *mut f32) = v;
    }

    #[inline]
    pub unsafe fn at_i32(&self, i0: i64, i1: i64, i2: i64, i3: i64) -> i32 {
        *(self.elem_ptr(i0, i1, i2, i3) as *const i32)
    }

    /// Scalar read of an F32 or F16 element as f32.
    #[inline]
    pub unsafe fn at_float(&self, i0: i64, i1: i64, i2: i64, i3: i64) -> f32 {
        match self.t.dtype {
            DType::F32 => self.at_f32(i0, i1, i2, i3),
            DType::F16 => (*(self.elem_ptr(i0, i1, i2, i3) as *const f16)).to_f32(),
            other => panic!("scalar float read unsupported for {}", other.name()),
        }
    }

    #[inline]
    unsafe fn elem_ptr(&self, i0: i64, i1: i64, i2: i64, i3: i64) -> *mut u8 {
        self.data.add(
            i0 as usize * self.t.nb[0]
                + i1 as usize * self.t.nb[1]
                + i2 as usize * self.t.nb[2]
                + i3 as usize * self.t.nb[3],
        )
    }
}

/// Split `n` items into `nth` nearly equal ranges; returns `[start, end)`
/// of range `ith`.
#[inline]
pub(crate) fn partition(n: i64, ith: usize, nth: usize) -> (i64, i64) {
    let per = (n + nth as i64 - 1) / nth as i64;
    let i0 = per * ith as i64;
    let i1 = (i0 + per).min(n);
    (i0, i1.max(i0))
}

/// Decompose a flat row index into the three outer coordinates of `t`.
#[inline]
pub(crate) fn unravel_row(t: &Tensor, ir: i64) -> (i64, i64, i64) {
    let i3 = ir / (t.ne[2] * t.ne[1]);
    let i2 = (ir - i3 * t.ne[2] * t.ne[1]) / t.ne[1];
    let i1 = ir - i3 * t.ne[2] * t.ne[1] - i2 * t.ne[1];
    (i1, i2, i3)
}

pub(crate) fn compute_forward(p: &ComputeParams, ctx: &Context, dst: TensorId) {
    let op = ctx.tensor(dst).op;
    match op {
        // pure layout ops have no kernel
        Op::None | Op::View | Op::Reshape | Op::Permute | Op::Transpose => {}
        Op::Dup | Op::Cpy | Op::Cont => movement::copy(p, ctx, dst),
        Op::Add => elementwise::add(p, ctx, dst),
        Op::Add1 => elementwise::add1(p, ctx, dst),
        Op::Acc => movement::acc(p, ctx, dst),
        Op::Sub => elementwise::sub(p, ctx, dst),
        Op::Mul => elementwise::mul(p, ctx, dst),
        Op::Div => elementwise::div(p, ctx, dst),
        Op::Sqr => elementwise::map(p, ctx, dst, |x| x * x),
        Op::Sqrt => elementwise::map(p, ctx, dst, f32::sqrt),
        Op::Log => elementwise::map(p, ctx, dst, f32::ln),
        Op::Sin => elementwise::map(p, ctx, dst, f32::sin),
        Op::Cos => elementwise::map(p, ctx, dst, f32::cos),
        Op::Sum => reduce::sum(p, ctx, dst),
        Op::SumRows => reduce::sum_rows(p, ctx, dst),
        Op::Mean => reduce::mean(p, ctx, dst),
        Op::Argmax => reduce::argmax(p, ctx, dst),
        Op::CountEqual => reduce::count_equal(p, ctx, dst),
        Op::Repeat => movement::repeat(p, ctx, dst),
        Op::RepeatBack => movement::repeat_back(p, ctx, dst),
        Op::Concat => movement::concat(p, ctx, dst),
        Op::SiluBack => elementwise::silu_back(p, ctx, dst),
        Op::Norm => norm::norm(p, ctx, dst),
        Op::RmsNorm => norm::rms_norm(p, ctx, dst),
        Op::RmsNormBack => norm::rms_norm_back(p, ctx, dst),
        Op::GroupNorm => norm::group_norm(p, ctx, dst),
        Op::L2Norm => norm::l2_norm(p, ctx, dst),
        Op::MulMat => matmul::mul_mat(p, ctx, dst),
        Op::MulMatId => matmul::mul_mat_id(p, ctx, dst),
        Op::OutProd => matmul::out_prod(p, ctx, dst),
        Op::Scale => elementwise::scale(p, ctx, dst),
        Op::Set => movement::set(p, ctx, dst),
        Op::GetRows => movement::get_rows(p, ctx, dst),
        Op::GetRowsBack => movement::get_rows_back(p, ctx, dst),
        Op::Diag => movement::diag(p, ctx, dst),
        Op::DiagMaskInf => movement::diag_mask(p, ctx, dst, f32::NEG_INFINITY),
        Op::DiagMaskZero => movement::diag_mask(p, ctx, dst, 0.0),
        Op::SoftMax => norm::soft_max(p, ctx, dst),
        Op::SoftMaxBack => norm::soft_max_back(p, ctx, dst),
        Op::Rope => rope::rope(p, ctx, dst, true),
        Op::RopeBack => rope::rope(p, ctx, dst, false),
        Op::Clamp => elementwise::clamp(p, ctx, dst),
        Op::Im2Col => conv::im2col(p, ctx, dst),
        Op::ConvTranspose1d => conv::conv_transpose_1d(p, ctx, dst),
        Op::ConvTranspose2d => conv::conv_transpose_2d(p, ctx, dst),
        Op::Pool1d => conv::pool_1d(p, ctx, dst),
        Op::Pool2d => conv::pool_2d(p, ctx, dst),
        Op::Pool2dBack => conv::pool_2d_back(p, ctx, dst),
        Op::Upscale => movement::upscale(p, ctx, dst),
        Op::Pad => movement::pad(p, ctx, dst),
        Op::Arange => movement::arange(p, ctx, dst),
        Op::TimestepEmbedding => movement::timestep_embedding(p, ctx, dst),
        Op::Argsort => movement::argsort(p, ctx, dst),
        Op::LeakyRelu => elementwise::leaky_relu(p, ctx, dst),
        Op::FlashAttnExt => attention::flash_attn_ext(p, ctx, dst),
        Op::SsmConv => ssm::ssm_conv(p, ctx, dst),
        Op::SsmScan => ssm::ssm_scan(p, ctx, dst),
        Op::RwkvWkv => ssm::rwkv_wkv(p, ctx, dst),
        Op::Unary => elementwise::unary(p, ctx, dst),
        Op::CrossEntropyLoss => reduce::cross_entropy_loss(p, ctx, dst),
        Op::CrossEntropyLossBack => reduce::cross_entropy_loss_back(p, ctx, dst),
    }
}
