//! The tensor descriptor and the operation vocabulary.
//!
//! Tensors live in a [`crate::context::Context`] object table and are
//! addressed by [`TensorId`] handles. A descriptor carries up to four
//! dimensions with explicit byte strides, the producing op with its packed
//! parameters, non-owning source handles, an optional view base and an
//! optional gradient handle.

pub mod ops;

use crate::types::DType;
use bitflags::bitflags;

pub const MAX_DIMS: usize = 4;
pub const MAX_SRC: usize = 10;
pub const MAX_NAME: usize = 64;

/// Handle of a tensor inside its owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TensorFlags: u32 {
        const INPUT  = 1 << 0;
        const OUTPUT = 1 << 1;
        const PARAM  = 1 << 2;
        const LOSS   = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataRef {
    /// Descriptor only (`no_alloc` contexts).
    Unset,
    /// Byte offset into the owning context's arena.
    Arena(usize),
}

/// N-dimensional tensor descriptor. `ne[i]` counts elements, `nb[i]` is the
/// byte stride of dimension `i`; unused trailing dimensions are 1.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub dtype: DType,
    pub ne: [i64; MAX_DIMS],
    pub nb: [usize; MAX_DIMS],
    pub op: Op,
    pub params: OpParams,
    pub src: [Option<TensorId>; MAX_SRC],
    pub view_src: Option<TensorId>,
    pub view_offs: usize,
    pub grad: Option<TensorId>,
    pub flags: TensorFlags,
    pub name: String,
    pub(crate) data: DataRef,
}

impl Tensor {
    pub fn nelements(&self) -> i64 {
        self.ne[0] * self.ne[1] * self.ne[2] * self.ne[3]
    }

    /// Rows of the fastest axis, i.e. the product of the outer dimensions.
    pub fn nrows(&self) -> i64 {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn nbytes(&self) -> usize {
        if self.is_contiguous() {
            self.dtype.row_size(self.ne[0] as usize) * self.nrows() as usize
        } else {
            // largest element offset plus one element
            let mut max = 0usize;
            for i in 0..MAX_DIMS {
                max += (self.ne[i] as usize - 1) * self.nb[i];
            }
            max + self.dtype.type_size()
        }
    }

    pub fn row_bytes(&self) -> usize {
        self.dtype.row_size(self.ne[0] as usize)
    }

    pub fn is_contiguous(&self) -> bool {
        let ts = self.dtype.type_size();
        let bs = self.dtype.block_size();
        self.nb[0] == ts
            && self.nb[1] == self.nb[0] * self.ne[0] as usize / bs
            && self.nb[2] == self.nb[1] * self.ne[1] as usize
            && self.nb[3] == self.nb[2] * self.ne[2] as usize
    }

    /// Contiguous rows: elements of dimension 0 are dense even if the outer
    /// dimensions are permuted.
    pub fn has_contiguous_rows(&self) -> bool {
        self.nb[0] == self.dtype.type_size()
    }

    pub fn is_transposed(&self) -> bool {
        self.nb[0] > self.nb[1]
    }

    pub fn is_scalar(&self) -> bool {
        self.nelements() == 1
    }

    pub fn is_vector(&self) -> bool {
        self.ne[1] == 1 && self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn is_matrix(&self) -> bool {
        self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.ne == other.ne
    }

    /// `other` can be broadcast to this tensor's shape: every dimension of
    /// `self` is a multiple of the corresponding dimension of `other`.
    pub fn can_repeat(&self, other: &Tensor) -> bool {
        (0..MAX_DIMS).all(|i| self.ne[i] % other.ne[i] == 0)
    }

    pub fn is_param(&self) -> bool {
        self.flags.contains(TensorFlags::PARAM)
    }
}

/// Sort direction of ARGSORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    Max,
    Avg,
}

/// RoPE rotation layout: GPT-J rotates adjacent pairs `(i, i+1)`, NeoX
/// rotates the halves `(i, i + n_dims/2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeMode {
    GptJ,
    Neox,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeParams {
    pub n_dims: usize,
    pub mode: RopeMode,
    /// Original training context length, reference for YaRN correction.
    pub n_ctx_orig: usize,
    pub freq_base: f32,
    pub freq_scale: f32,
    /// YaRN extrapolation mix factor; 0 disables YaRN.
    pub ext_factor: f32,
    pub attn_factor: f32,
    pub beta_fast: f32,
    pub beta_slow: f32,
}

impl Default for RopeParams {
    fn default() -> Self {
        RopeParams {
            n_dims: 0,
            mode: RopeMode::GptJ,
            n_ctx_orig: 0,
            freq_base: 10000.0,
            freq_scale: 1.0,
            ext_factor: 0.0,
            attn_factor: 1.0,
            beta_fast: 32.0,
            beta_slow: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs,
    Sgn,
    Neg,
    Step,
    Tanh,
    Elu,
    Relu,
    Sigmoid,
    Gelu,
    GeluQuick,
    Silu,
    HardSwish,
    HardSigmoid,
    Exp,
}

/// Per-op packed parameters; the builder writes a variant, the kernel reads
/// it back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpParams {
    None,
    Unary(UnaryOp),
    Scale { s: f32 },
    Clamp { min: f32, max: f32 },
    LeakyRelu { slope: f32 },
    Norm { eps: f32 },
    GroupNorm { n_groups: usize, eps: f32 },
    Concat { dim: usize },
    DiagMask { n_past: i32 },
    SoftMax { scale: f32, max_bias: f32 },
    Rope(RopeParams),
    SetSlice { nb1: usize, nb2: usize, nb3: usize, offset: usize, inplace: bool },
    Im2Col { s0: usize, s1: usize, p0: usize, p1: usize, d0: usize, d1: usize, is_2d: bool },
    ConvTranspose1d { s0: usize },
    ConvTranspose2d { stride: usize },
    Pool { op: PoolOp, k0: usize, k1: usize, s0: usize, s1: usize, p0: i32, p1: i32 },
    Arange { start: f32, stop: f32, step: f32 },
    TimestepEmbedding { dim: usize, max_period: usize },
    Argsort { order: SortOrder },
    FlashAttn { scale: f32, max_bias: f32, logit_softcap: f32 },
    Permute { axes: [usize; MAX_DIMS] },
}

/// The closed operation set. Every computation appears as a graph node
/// tagged with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    None,
    Dup,
    Add,
    Add1,
    Acc,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Log,
    Sin,
    Cos,
    Sum,
    SumRows,
    Mean,
    Argmax,
    CountEqual,
    Repeat,
    RepeatBack,
    Concat,
    SiluBack,
    Norm,
    RmsNorm,
    RmsNormBack,
    GroupNorm,
    L2Norm,
    MulMat,
    MulMatId,
    OutProd,
    Scale,
    Set,
    Cpy,
    Cont,
    Reshape,
    View,
    Permute,
    Transpose,
    GetRows,
    GetRowsBack,
    Diag,
    DiagMaskInf,
    DiagMaskZero,
    SoftMax,
    SoftMaxBack,
    Rope,
    RopeBack,
    Clamp,
    Im2Col,
    ConvTranspose1d,
    ConvTranspose2d,
    Pool1d,
    Pool2d,
    Pool2dBack,
    Upscale,
    Pad,
    Arange,
    TimestepEmbedding,
    Argsort,
    LeakyRelu,
    FlashAttnExt,
    SsmConv,
    SsmScan,
    RwkvWkv,
    Unary,
    CrossEntropyLoss,
    CrossEntropyLossBack,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Dup => "dup",
            Op::Add => "add",
            Op::Add1 => "add1",
            Op::Acc => "acc",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Sqr => "sqr",
            Op::Sqrt => "sqrt",
            Op::Log => "log",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Sum => "sum",
            Op::SumRows => "sum_rows",
            Op::Mean => "mean",
            Op::Argmax => "argmax",
            Op::CountEqual => "count_equal",
            Op::Repeat => "repeat",
            Op::RepeatBack => "repeat_back",
            Op::Concat => "concat",
            Op::SiluBack => "silu_back",
            Op::Norm => "norm",
            Op::RmsNorm => "rms_norm",
            Op::RmsNormBack => "rms_norm_back",
            Op::GroupNorm => "group_norm",
            Op::L2Norm => "l2_norm",
            Op::MulMat => "mul_mat",
            Op::MulMatId => "mul_mat_id",
            Op::OutProd => "out_prod",
            Op::Scale => "scale",
            Op::Set => "set",
            Op::Cpy => "cpy",
            Op::Cont => "cont",
            Op::Reshape => "reshape",
            Op::View => "view",
            Op::Permute => "permute",
            Op::Transpose => "transpose",
            Op::GetRows => "get_rows",
            Op::GetRowsBack => "get_rows_back",
            Op::Diag => "diag",
            Op::DiagMaskInf => "diag_mask_inf",
            Op::DiagMaskZero => "diag_mask_zero",
            Op::SoftMax => "soft_max",
            Op::SoftMaxBack => "soft_max_back",
            Op::Rope => "rope",
            Op::RopeBack => "rope_back",
            Op::Clamp => "clamp",
            Op::Im2Col => "im2col",
            Op::ConvTranspose1d => "conv_transpose_1d",
            Op::ConvTranspose2d => "conv_transpose_2d",
            Op::Pool1d => "pool_1d",
            Op::Pool2d => "pool_2d",
            Op::Pool2dBack => "pool_2d_back",
            Op::Upscale => "upscale",
            Op::Pad => "pad",
            Op::Arange => "arange",
            Op::TimestepEmbedding => "timestep_embedding",
            Op::Argsort => "argsort",
            Op::LeakyRelu => "leaky_relu",
            Op::FlashAttnExt => "flash_attn_ext",
            Op::SsmConv => "ssm_conv",
            Op::SsmScan => "ssm_scan",
            Op::RwkvWkv => "rwkv_wkv",
            Op::Unary => "unary",
            Op::CrossEntropyLoss => "cross_entropy_loss",
            Op::CrossEntropyLossBack => "cross_entropy_loss_back",
        }
    }
}
