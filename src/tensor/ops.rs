//! Op builders. Each one allocates the result tensor with the op's output
//! shape and type rules, records the sources and packs the numeric
//! parameters. Shape/type preconditions are asserts: the graph is built by
//! trusted code and a violated rule is a programming error.

use crate::context::{with_src, Context};
use crate::tensor::{
    Op, OpParams, PoolOp, RopeParams, SortOrder, TensorId, UnaryOp, MAX_DIMS,
};
use crate::types::DType;

impl Context {
    fn new_result(
        &mut self,
        dtype: DType,
        ne: [i64; MAX_DIMS],
        op: Op,
        params: OpParams,
        srcs: &[TensorId],
    ) -> TensorId {
        let id = self.new_tensor(dtype, &ne);
        let t = self.tensor_mut(id);
        t.op = op;
        t.params = params;
        t.src = with_src(srcs);
        id
    }

    /// Full-shape view of `a`; in-place op results are built on top of it.
    fn view_tensor(&mut self, a: TensorId) -> TensorId {
        let ne = self.tensor(a).ne;
        let nb = self.tensor(a).nb;
        let v = self.view_4d(a, ne[0], ne[1], ne[2], ne[3], nb[1], nb[2], nb[3], 0);
        v
    }

    fn inplace_result(&mut self, a: TensorId, op: Op, params: OpParams, srcs: &[TensorId]) -> TensorId {
        let v = self.view_tensor(a);
        let t = self.tensor_mut(v);
        t.op = op;
        t.params = params;
        t.src = with_src(srcs);
        v
    }

    pub fn dup(&mut self, a: TensorId) -> TensorId {
        let t = self.tensor(a);
        let (dtype, ne) = (t.dtype, t.ne);
        self.new_result(dtype, ne, Op::Dup, OpParams::None, &[a])
    }

    // ---- binary elementwise ------------------------------------------------

    fn binary(&mut self, op: Op, a: TensorId, b: TensorId) -> TensorId {
        let ta = self.tensor(a);
        let tb = self.tensor(b);
        assert!(
            ta.can_repeat(tb),
            "{}: shape {:?} cannot broadcast onto {:?}",
            op.name(),
            tb.ne,
            ta.ne
        );
        let (dtype, ne) = (ta.dtype, ta.ne);
        self.new_result(dtype, ne, op, OpParams::None, &[a, b])
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.binary(Op::Add, a, b)
    }

    /// In-place `a += b`; the result aliases `a`'s payload.
    pub fn add_inplace(&mut self, a: TensorId, b: TensorId) -> TensorId {
        assert!(self.tensor(a).can_repeat(self.tensor(b)));
        self.inplace_result(a, Op::Add, OpParams::None, &[a, b])
    }

    /// Add the single value of `b` to every element of `a`.
    pub fn add1(&mut self, a: TensorId, b: TensorId) -> TensorId {
        assert!(self.tensor(b).is_scalar(), "add1 takes a 1-element tensor");
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        self.new_result(dtype, ne, Op::Add1, OpParams::None, &[a, b])
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.binary(Op::Sub, a, b)
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.binary(Op::Mul, a, b)
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> TensorId {
        self.binary(Op::Div, a, b)
    }

    /// Write `b` into a strided window of a copy of `a` (or of `a` itself
    /// when `inplace`).
    #[allow(clippy::too_many_arguments)]
    pub fn acc(
        &mut self,
        a: TensorId,
        b: TensorId,
        nb1: usize,
        nb2: usize,
        nb3: usize,
        offset: usize,
        inplace: bool,
    ) -> TensorId {
        let params = OpParams::SetSlice {
            nb1,
            nb2,
            nb3,
            offset,
            inplace,
        };
        if inplace {
            self.inplace_result(a, Op::Acc, params, &[a, b])
        } else {
            let (dtype, ne) = {
                let t = self.tensor(a);
                (t.dtype, t.ne)
            };
            self.new_result(dtype, ne, Op::Acc, params, &[a, b])
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        a: TensorId,
        b: TensorId,
        nb1: usize,
        nb2: usize,
        nb3: usize,
        offset: usize,
        inplace: bool,
    ) -> TensorId {
        let params = OpParams::SetSlice {
            nb1,
            nb2,
            nb3,
            offset,
            inplace,
        };
        if inplace {
            self.inplace_result(a, Op::Set, params, &[a, b])
        } else {
            let (dtype, ne) = {
                let t = self.tensor(a);
                (t.dtype, t.ne)
            };
            self.new_result(dtype, ne, Op::Set, params, &[a, b])
        }
    }

    // ---- unary -------------------------------------------------------------

    fn same_shape_op(&mut self, op: Op, params: OpParams, a: TensorId) -> TensorId {
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        self.new_result(dtype, ne, op, params, &[a])
    }

    pub fn sqr(&mut self, a: TensorId) -> TensorId {
        self.same_shape_op(Op::Sqr, OpParams::None, a)
    }

    pub fn sqrt(&mut self, a: TensorId) -> TensorId {
        self.same_shape_op(Op::Sqrt, OpParams::None, a)
    }

    pub fn log(&mut self, a: TensorId) -> TensorId {
        self.same_shape_op(Op::Log, OpParams::None, a)
    }

    pub fn sin(&mut self, a: TensorId) -> TensorId {
        self.same_shape_op(Op::Sin, OpParams::None, a)
    }

    pub fn cos(&mut self, a: TensorId) -> TensorId {
        self.same_shape_op(Op::Cos, OpParams::None, a)
    }

    pub fn unary(&mut self, a: TensorId, u: UnaryOp) -> TensorId {
        self.same_shape_op(Op::Unary, OpParams::Unary(u), a)
    }

    pub fn abs(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Abs)
    }

    pub fn sgn(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Sgn)
    }

    pub fn neg(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Neg)
    }

    pub fn step(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Step)
    }

    pub fn tanh(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Tanh)
    }

    pub fn elu(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Elu)
    }

    pub fn relu(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Relu)
    }

    pub fn sigmoid(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Sigmoid)
    }

    pub fn gelu(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Gelu)
    }

    pub fn gelu_quick(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::GeluQuick)
    }

    pub fn silu(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Silu)
    }

    pub fn hardswish(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::HardSwish)
    }

    pub fn hardsigmoid(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::HardSigmoid)
    }

    pub fn exp(&mut self, a: TensorId) -> TensorId {
        self.unary(a, UnaryOp::Exp)
    }

    pub fn scale(&mut self, a: TensorId, s: f32) -> TensorId {
        self.same_shape_op(Op::Scale, OpParams::Scale { s }, a)
    }

    pub fn clamp(&mut self, a: TensorId, min: f32, max: f32) -> TensorId {
        self.same_shape_op(Op::Clamp, OpParams::Clamp { min, max }, a)
    }

    pub fn leaky_relu(&mut self, a: TensorId, slope: f32) -> TensorId {
        self.same_shape_op(Op::LeakyRelu, OpParams::LeakyRelu { slope }, a)
    }

    /// dx of silu given the forward input `a` and incoming gradient `g`.
    pub fn silu_back(&mut self, a: TensorId, g: TensorId) -> TensorId {
        assert!(self.tensor(a).same_shape(self.tensor(g)));
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        self.new_result(dtype, ne, Op::SiluBack, OpParams::None, &[a, g])
    }

    // ---- reductions --------------------------------------------------------

    pub fn sum(&mut self, a: TensorId) -> TensorId {
        self.new_result(DType::F32, [1, 1, 1, 1], Op::Sum, OpParams::None, &[a])
    }

    pub fn sum_rows(&mut self, a: TensorId) -> TensorId {
        let ne = self.tensor(a).ne;
        self.new_result(
            DType::F32,
            [1, ne[1], ne[2], ne[3]],
            Op::SumRows,
            OpParams::None,
            &[a],
        )
    }

    pub fn mean(&mut self, a: TensorId) -> TensorId {
        let ne = self.tensor(a).ne;
        self.new_result(
            DType::F32,
            [1, ne[1], ne[2], ne[3]],
            Op::Mean,
            OpParams::None,
            &[a],
        )
    }

    pub fn argmax(&mut self, a: TensorId) -> TensorId {
        let t = self.tensor(a);
        assert!(t.is_matrix(), "argmax over rows of a matrix");
        let ne1 = t.ne[1];
        self.new_result(DType::I32, [ne1, 1, 1, 1], Op::Argmax, OpParams::None, &[a])
    }

    /// Number of positions where two I32 tensors agree; scalar I64 result.
    pub fn count_equal(&mut self, a: TensorId, b: TensorId) -> TensorId {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        assert_eq!(self.tensor(a).dtype, DType::I32);
        self.new_result(DType::I64, [1, 1, 1, 1], Op::CountEqual, OpParams::None, &[a, b])
    }

    // ---- shape movement ----------------------------------------------------

    /// Broadcast-copy `a` to the shape of `like`.
    pub fn repeat(&mut self, a: TensorId, like: TensorId) -> TensorId {
        let tl = self.tensor(like);
        assert!(tl.can_repeat(self.tensor(a)));
        let ne = tl.ne;
        let dtype = self.tensor(a).dtype;
        self.new_result(dtype, ne, Op::Repeat, OpParams::None, &[a])
    }

    /// Reduce `a` back to the shape of `like` by summing repeated tiles;
    /// adjoint of [`Context::repeat`].
    pub fn repeat_back(&mut self, a: TensorId, like: TensorId) -> TensorId {
        let ne = self.tensor(like).ne;
        assert!(self.tensor(a).can_repeat(self.tensor(like)));
        let dtype = self.tensor(a).dtype;
        self.new_result(dtype, ne, Op::RepeatBack, OpParams::None, &[a])
    }

    pub fn concat(&mut self, a: TensorId, b: TensorId, dim: usize) -> TensorId {
        assert!(dim < MAX_DIMS);
        let ta = self.tensor(a);
        let tb = self.tensor(b);
        assert_eq!(ta.dtype, tb.dtype);
        let mut ne = ta.ne;
        for i in 0..MAX_DIMS {
            if i == dim {
                ne[i] += tb.ne[i];
            } else {
                assert_eq!(ta.ne[i], tb.ne[i], "concat: dim {} differs", i);
            }
        }
        let dtype = ta.dtype;
        self.new_result(dtype, ne, Op::Concat, OpParams::Concat { dim }, &[a, b])
    }

    /// Copy `a` into `b` with type conversion; the result is a view of `b`.
    pub fn cpy(&mut self, a: TensorId, b: TensorId) -> TensorId {
        assert_eq!(
            self.tensor(a).nelements(),
            self.tensor(b).nelements(),
            "cpy: element counts differ"
        );
        let v = self.view_tensor(b);
        let t = self.tensor_mut(v);
        t.op = Op::Cpy;
        t.src = with_src(&[a, b]);
        v
    }

    /// Materialize `a` as a contiguous tensor of the same type.
    pub fn cont(&mut self, a: TensorId) -> TensorId {
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        self.new_result(dtype, ne, Op::Cont, OpParams::None, &[a])
    }

    /// Cast to another type, materializing contiguously.
    pub fn cast(&mut self, a: TensorId, dtype: DType) -> TensorId {
        let ne = self.tensor(a).ne;
        let dst = self.new_tensor(dtype, &ne);
        self.cpy(a, dst)
    }

    pub fn get_rows(&mut self, a: TensorId, idx: TensorId) -> TensorId {
        let ta = self.tensor(a);
        let ti = self.tensor(idx);
        assert_eq!(ti.dtype, DType::I32);
        assert_eq!(ta.ne[3], 1, "get_rows: 3-d data at most");
        let ne = [ta.ne[0], ti.ne[0], ti.ne[1], ti.ne[2]];
        self.new_result(DType::F32, ne, Op::GetRows, OpParams::None, &[a, idx])
    }

    /// Scatter-add the rows of `g` back into a zero tensor shaped like
    /// `like`; adjoint of [`Context::get_rows`].
    pub fn get_rows_back(&mut self, g: TensorId, idx: TensorId, like: TensorId) -> TensorId {
        assert_eq!(self.tensor(idx).dtype, DType::I32);
        let ne = self.tensor(like).ne;
        self.new_result(DType::F32, ne, Op::GetRowsBack, OpParams::None, &[g, idx])
    }

    pub fn diag(&mut self, a: TensorId) -> TensorId {
        let t = self.tensor(a);
        assert_eq!(t.ne[1], 1, "diag takes row vectors");
        let ne = [t.ne[0], t.ne[0], t.ne[2], t.ne[3]];
        let dtype = t.dtype;
        self.new_result(dtype, ne, Op::Diag, OpParams::None, &[a])
    }

    pub fn diag_mask_inf(&mut self, a: TensorId, n_past: i32) -> TensorId {
        self.same_shape_op(Op::DiagMaskInf, OpParams::DiagMask { n_past }, a)
    }

    pub fn diag_mask_zero(&mut self, a: TensorId, n_past: i32) -> TensorId {
        self.same_shape_op(Op::DiagMaskZero, OpParams::DiagMask { n_past }, a)
    }

    // ---- normalization -----------------------------------------------------

    pub fn norm(&mut self, a: TensorId, eps: f32) -> TensorId {
        self.same_shape_op(Op::Norm, OpParams::Norm { eps }, a)
    }

    pub fn rms_norm(&mut self, a: TensorId, eps: f32) -> TensorId {
        self.same_shape_op(Op::RmsNorm, OpParams::Norm { eps }, a)
    }

    pub fn rms_norm_back(&mut self, a: TensorId, g: TensorId, eps: f32) -> TensorId {
        assert!(self.tensor(a).same_shape(self.tensor(g)));
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        self.new_result(dtype, ne, Op::RmsNormBack, OpParams::Norm { eps }, &[a, g])
    }

    pub fn group_norm(&mut self, a: TensorId, n_groups: usize, eps: f32) -> TensorId {
        self.same_shape_op(Op::GroupNorm, OpParams::GroupNorm { n_groups, eps }, a)
    }

    pub fn l2_norm(&mut self, a: TensorId, eps: f32) -> TensorId {
        self.same_shape_op(Op::L2Norm, OpParams::Norm { eps }, a)
    }

    pub fn soft_max(&mut self, a: TensorId) -> TensorId {
        self.soft_max_ext(a, None, 1.0, 0.0)
    }

    /// Softmax over rows with optional additive mask (F32 or F16), logit
    /// scale and ALiBi `max_bias`.
    pub fn soft_max_ext(
        &mut self,
        a: TensorId,
        mask: Option<TensorId>,
        scale: f32,
        max_bias: f32,
    ) -> TensorId {
        if let Some(m) = mask {
            let tm = self.tensor(m);
            assert!(matches!(tm.dtype, DType::F32 | DType::F16));
            assert!(tm.ne[0] == self.tensor(a).ne[0]);
        } else {
            assert!(max_bias == 0.0, "ALiBi requires a mask tensor");
        }
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        let params = OpParams::SoftMax { scale, max_bias };
        match mask {
            Some(m) => self.new_result(dtype, ne, Op::SoftMax, params, &[a, m]),
            None => self.new_result(dtype, ne, Op::SoftMax, params, &[a]),
        }
    }

    /// Gradient of softmax: `y * (g - dot(y, g))` per row.
    pub fn soft_max_back(&mut self, g: TensorId, y: TensorId) -> TensorId {
        assert!(self.tensor(g).same_shape(self.tensor(y)));
        let (dtype, ne) = {
            let t = self.tensor(g);
            (t.dtype, t.ne)
        };
        self.new_result(dtype, ne, Op::SoftMaxBack, OpParams::None, &[g, y])
    }

    // ---- linear algebra ----------------------------------------------------

    /// Batched contraction `dst = aᵀ · b`: `a: [k, m, a2, a3]`,
    /// `b: [k, n, b2, b3]` with `b2 % a2 == 0`, `b3 % a3 == 0`;
    /// `dst: [m, n, b2, b3]` in F32.
    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let ta = self.tensor(a);
        let tb = self.tensor(b);
        assert_eq!(ta.ne[0], tb.ne[0], "mul_mat: inner dimensions differ");
        assert!(tb.ne[2] % ta.ne[2] == 0 && tb.ne[3] % ta.ne[3] == 0);
        assert!(!ta.is_transposed());
        let ne = [ta.ne[1], tb.ne[1], tb.ne[2], tb.ne[3]];
        self.new_result(DType::F32, ne, Op::MulMat, OpParams::None, &[a, b])
    }

    /// Mixture-of-experts matmul: `experts: [k, m, n_expert, 1]`,
    /// `b: [k, n_expert_used, n_tokens, 1]`, `ids: [n_expert_used,
    /// n_tokens]` I32; `dst: [m, n_expert_used, n_tokens, 1]`.
    pub fn mul_mat_id(&mut self, experts: TensorId, b: TensorId, ids: TensorId) -> TensorId {
        let te = self.tensor(experts);
        let tb = self.tensor(b);
        let ti = self.tensor(ids);
        assert_eq!(ti.dtype, DType::I32);
        assert_eq!(te.ne[0], tb.ne[0], "mul_mat_id: inner dimensions differ");
        assert_eq!(te.ne[3], 1);
        assert_eq!(tb.ne[3], 1);
        assert_eq!(ti.ne[0], tb.ne[1], "one expert id per used slot");
        assert_eq!(ti.ne[1], tb.ne[2], "one id row per token");
        let ne = [te.ne[1], tb.ne[1], tb.ne[2], 1];
        self.new_result(DType::F32, ne, Op::MulMatId, OpParams::None, &[experts, b, ids])
    }

    /// Outer product over the shared middle axis:
    /// `dst[i, j] = Σ_k a[i, k] · b[j, k]`.
    pub fn out_prod(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let ta = self.tensor(a);
        let tb = self.tensor(b);
        assert_eq!(ta.ne[1], tb.ne[1], "out_prod: shared axis differs");
        assert!(tb.ne[2] % ta.ne[2] == 0 && tb.ne[3] % ta.ne[3] == 0);
        let ne = [ta.ne[0], tb.ne[0], tb.ne[2], tb.ne[3]];
        self.new_result(DType::F32, ne, Op::OutProd, OpParams::None, &[a, b])
    }

    // ---- positions ---------------------------------------------------------

    pub fn rope(&mut self, a: TensorId, pos: TensorId, params: RopeParams) -> TensorId {
        self.rope_impl(a, pos, None, params, Op::Rope)
    }

    pub fn rope_ext(
        &mut self,
        a: TensorId,
        pos: TensorId,
        freq_factors: Option<TensorId>,
        params: RopeParams,
    ) -> TensorId {
        self.rope_impl(a, pos, freq_factors, params, Op::Rope)
    }

    /// Inverse rotation, used by the backward pass.
    pub fn rope_back(
        &mut self,
        a: TensorId,
        pos: TensorId,
        freq_factors: Option<TensorId>,
        params: RopeParams,
    ) -> TensorId {
        self.rope_impl(a, pos, freq_factors, params, Op::RopeBack)
    }

    fn rope_impl(
        &mut self,
        a: TensorId,
        pos: TensorId,
        freq_factors: Option<TensorId>,
        params: RopeParams,
        op: Op,
    ) -> TensorId {
        {
            let ta = self.tensor(a);
            let tp = self.tensor(pos);
            assert_eq!(tp.dtype, DType::I32);
            assert_eq!(tp.ne[0], ta.ne[2], "one position per token");
            assert!(params.n_dims <= ta.ne[0] as usize);
            assert!(params.n_dims % 2 == 0);
            if let Some(ff) = freq_factors {
                assert_eq!(self.tensor(ff).dtype, DType::F32);
                assert!(self.tensor(ff).ne[0] as usize >= params.n_dims / 2);
            }
        }
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        let srcs: Vec<TensorId> = match freq_factors {
            Some(ff) => vec![a, pos, ff],
            None => vec![a, pos],
        };
        self.new_result(dtype, ne, op, OpParams::Rope(params), &srcs)
    }

    // ---- convolution / pooling ---------------------------------------------

    /// Unfold image patches into matmul-ready columns.
    /// 2-d: kernel `[kw, kh, Cin, *]`, image `[W, H, Cin, N]` →
    /// `[Cin·kh·kw, OW·OH, N, 1]`.
    /// 1-d: kernel `[k, Cin, *]`, image `[W, Cin, N]` → `[Cin·k, OW, N, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn im2col(
        &mut self,
        kernel: TensorId,
        image: TensorId,
        s0: usize,
        s1: usize,
        p0: usize,
        p1: usize,
        d0: usize,
        d1: usize,
        is_2d: bool,
    ) -> TensorId {
        let tk = self.tensor(kernel);
        let ti = self.tensor(image);
        let params = OpParams::Im2Col {
            s0,
            s1,
            p0,
            p1,
            d0,
            d1,
            is_2d,
        };
        let ne = if is_2d {
            assert_eq!(tk.ne[2], ti.ne[2], "channel count differs");
            let ow = conv_out(ti.ne[0], tk.ne[0], s0, p0, d0);
            let oh = conv_out(ti.ne[1], tk.ne[1], s1, p1, d1);
            [tk.ne[0] * tk.ne[1] * tk.ne[2], ow * oh, ti.ne[3], 1]
        } else {
            assert_eq!(tk.ne[1], ti.ne[1], "channel count differs");
            let ow = conv_out(ti.ne[0], tk.ne[0], s0, p0, d0);
            [tk.ne[0] * tk.ne[1], ow, ti.ne[2], 1]
        };
        self.new_result(DType::F32, ne, Op::Im2Col, params, &[kernel, image])
    }

    /// 1-d convolution as im2col plus matmul.
    pub fn conv_1d(
        &mut self,
        kernel: TensorId,
        image: TensorId,
        s0: usize,
        p0: usize,
        d0: usize,
    ) -> TensorId {
        let cols = self.im2col(kernel, image, s0, 0, p0, 0, d0, 0, false);
        let (k, cout) = {
            let tk = self.tensor(kernel);
            (tk.ne[0] * tk.ne[1], tk.ne[2])
        };
        let (ow, n) = {
            let tc = self.tensor(cols);
            (tc.ne[1], tc.ne[2])
        };
        let k2 = self.reshape_2d(kernel, k, cout);
        let c2 = self.reshape_2d(cols, k, ow * n);
        let mm = self.mul_mat(k2, c2);
        self.reshape_3d(mm, cout, ow, n)
    }

    /// 2-d convolution as im2col plus matmul; result `[Cout, OW, OH, N]`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv_2d(
        &mut self,
        kernel: TensorId,
        image: TensorId,
        s0: usize,
        s1: usize,
        p0: usize,
        p1: usize,
        d0: usize,
        d1: usize,
    ) -> TensorId {
        let cols = self.im2col(kernel, image, s0, s1, p0, p1, d0, d1, true);
        let (k, cout) = {
            let tk = self.tensor(kernel);
            (tk.ne[0] * tk.ne[1] * tk.ne[2], tk.ne[3])
        };
        let (ohw, n) = {
            let tc = self.tensor(cols);
            (tc.ne[1], tc.ne[2])
        };
        let (ow, oh) = {
            let ti = self.tensor(image);
            let tk = self.tensor(kernel);
            (
                conv_out(ti.ne[0], tk.ne[0], s0, p0, d0),
                conv_out(ti.ne[1], tk.ne[1], s1, p1, d1),
            )
        };
        debug_assert_eq!(ohw, ow * oh);
        let k2 = self.reshape_2d(kernel, k, cout);
        let c2 = self.reshape_2d(cols, k, ohw * n);
        let mm = self.mul_mat(k2, c2);
        self.reshape_4d(mm, cout, ow, oh, n)
    }

    /// Transposed 1-d convolution; kernel `[k, Cout, Cin]`, input
    /// `[L, Cin, 1]` → `[(L-1)·s0 + k, Cout, 1]`.
    pub fn conv_transpose_1d(&mut self, kernel: TensorId, b: TensorId, s0: usize) -> TensorId {
        let tk = self.tensor(kernel);
        let tb = self.tensor(b);
        assert_eq!(tk.ne[2], tb.ne[1], "input channel count differs");
        let ne = [
            (tb.ne[0] - 1) * s0 as i64 + tk.ne[0],
            tk.ne[1],
            1,
            1,
        ];
        self.new_result(
            DType::F32,
            ne,
            Op::ConvTranspose1d,
            OpParams::ConvTranspose1d { s0 },
            &[kernel, b],
        )
    }

    /// Transposed 2-d convolution; kernel `[kw, kh, Cout, Cin]`, input
    /// `[W, H, Cin, N]` → `[(W-1)·st + kw, (H-1)·st + kh, Cout, N]`.
    pub fn conv_transpose_2d(&mut self, kernel: TensorId, b: TensorId, stride: usize) -> TensorId {
        let tk = self.tensor(kernel);
        let tb = self.tensor(b);
        assert_eq!(tk.ne[3], tb.ne[2], "input channel count differs");
        let ne = [
            (tb.ne[0] - 1) * stride as i64 + tk.ne[0],
            (tb.ne[1] - 1) * stride as i64 + tk.ne[1],
            tk.ne[2],
            tb.ne[3],
        ];
        self.new_result(
            DType::F32,
            ne,
            Op::ConvTranspose2d,
            OpParams::ConvTranspose2d { stride },
            &[kernel, b],
        )
    }

    pub fn pool_1d(&mut self, a: TensorId, op: PoolOp, k0: usize, s0: usize, p0: i32) -> TensorId {
        let ta = self.tensor(a);
        let ne = [
            pool_out(ta.ne[0], k0, s0, p0),
            ta.ne[1],
            ta.ne[2],
            ta.ne[3],
        ];
        let params = OpParams::Pool {
            op,
            k0,
            k1: 1,
            s0,
            s1: 1,
            p0,
            p1: 0,
        };
        self.new_result(DType::F32, ne, Op::Pool1d, params, &[a])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pool_2d(
        &mut self,
        a: TensorId,
        op: PoolOp,
        k0: usize,
        k1: usize,
        s0: usize,
        s1: usize,
        p0: i32,
        p1: i32,
    ) -> TensorId {
        let ta = self.tensor(a);
        let ne = [
            pool_out(ta.ne[0], k0, s0, p0),
            pool_out(ta.ne[1], k1, s1, p1),
            ta.ne[2],
            ta.ne[3],
        ];
        let params = OpParams::Pool {
            op,
            k0,
            k1,
            s0,
            s1,
            p0,
            p1,
        };
        self.new_result(DType::F32, ne, Op::Pool2d, params, &[a])
    }

    /// Adjoint of pool_2d: `g` has the pooled shape, `orig` the forward
    /// input; max pooling scatters to the argmax, average pooling spreads.
    #[allow(clippy::too_many_arguments)]
    pub fn pool_2d_back(
        &mut self,
        g: TensorId,
        orig: TensorId,
        op: PoolOp,
        k0: usize,
        k1: usize,
        s0: usize,
        s1: usize,
        p0: i32,
        p1: i32,
    ) -> TensorId {
        let ne = self.tensor(orig).ne;
        let params = OpParams::Pool {
            op,
            k0,
            k1,
            s0,
            s1,
            p0,
            p1,
        };
        self.new_result(DType::F32, ne, Op::Pool2dBack, params, &[g, orig])
    }

    /// Nearest-neighbour upscale to an explicit target shape; every target
    /// dimension must be a multiple of the source one.
    pub fn upscale(&mut self, a: TensorId, ne: [i64; MAX_DIMS]) -> TensorId {
        let ta = self.tensor(a);
        for i in 0..MAX_DIMS {
            assert!(ne[i] % ta.ne[i] == 0, "upscale: dim {} not a multiple", i);
        }
        self.new_result(DType::F32, ne, Op::Upscale, OpParams::None, &[a])
    }

    /// Zero-pad each dimension at the high end.
    pub fn pad(&mut self, a: TensorId, p: [i64; MAX_DIMS]) -> TensorId {
        let ta = self.tensor(a);
        let ne = [
            ta.ne[0] + p[0],
            ta.ne[1] + p[1],
            ta.ne[2] + p[2],
            ta.ne[3] + p[3],
        ];
        self.new_result(DType::F32, ne, Op::Pad, OpParams::None, &[a])
    }

    pub fn arange(&mut self, start: f32, stop: f32, step: f32) -> TensorId {
        assert!(step != 0.0 && (stop - start) / step > 0.0);
        let n = ((stop - start) / step).ceil() as i64;
        self.new_result(
            DType::F32,
            [n, 1, 1, 1],
            Op::Arange,
            OpParams::Arange { start, stop, step },
            &[],
        )
    }

    /// Sinusoidal timestep embedding: `timesteps: [N]` → `[dim, N]`.
    pub fn timestep_embedding(
        &mut self,
        timesteps: TensorId,
        dim: usize,
        max_period: usize,
    ) -> TensorId {
        let n = self.tensor(timesteps).ne[0];
        let actual_dim = dim + dim % 2;
        self.new_result(
            DType::F32,
            [actual_dim as i64, n, 1, 1],
            Op::TimestepEmbedding,
            OpParams::TimestepEmbedding { dim, max_period },
            &[timesteps],
        )
    }

    /// Stable per-row sort indices.
    pub fn argsort(&mut self, a: TensorId, order: SortOrder) -> TensorId {
        let ne = self.tensor(a).ne;
        self.new_result(DType::I32, ne, Op::Argsort, OpParams::Argsort { order }, &[a])
    }

    /// Top-k row indices, built as an argsort view.
    pub fn top_k(&mut self, a: TensorId, k: i64) -> TensorId {
        assert!(k <= self.tensor(a).ne[0]);
        let sorted = self.argsort(a, SortOrder::Desc);
        let t = self.tensor(sorted);
        let (ne, nb) = (t.ne, t.nb);
        self.view_4d(sorted, k, ne[1], ne[2], ne[3], nb[1], nb[2], nb[3], 0)
    }

    // ---- attention / sequence ----------------------------------------------

    /// Fused attention over `q: [D, N, H, B]`, `k: [D, KV, Hk, B]`,
    /// `v: [Dv, KV, Hk, B]`, optional mask `[KV, N]`; output
    /// `[Dv, H, N, B]`.
    #[allow(clippy::too_many_arguments)]
    pub fn flash_attn_ext(
        &mut self,
        q: TensorId,
        k: TensorId,
        v: TensorId,
        mask: Option<TensorId>,
        scale: f32,
        max_bias: f32,
        logit_softcap: f32,
    ) -> TensorId {
        let tq = self.tensor(q);
        let tk = self.tensor(k);
        let tv = self.tensor(v);
        assert_eq!(tq.ne[0], tk.ne[0], "q/k head size differs");
        assert_eq!(tk.ne[1], tv.ne[1], "k/v length differs");
        assert!(tq.ne[2] % tk.ne[2] == 0, "grouped kv heads must divide");
        if let Some(m) = mask {
            let tm = self.tensor(m);
            assert!(matches!(tm.dtype, DType::F32 | DType::F16));
            assert!(tm.ne[0] >= tk.ne[1] && tm.ne[1] >= tq.ne[1]);
        } else {
            assert!(max_bias == 0.0, "ALiBi requires a mask tensor");
        }
        let ne = [tv.ne[0], tq.ne[2], tq.ne[1], tq.ne[3]];
        let params = OpParams::FlashAttn {
            scale,
            max_bias,
            logit_softcap,
        };
        let srcs: Vec<TensorId> = match mask {
            Some(m) => vec![q, k, v, m],
            None => vec![q, k, v],
        };
        self.new_result(DType::F32, ne, Op::FlashAttnExt, params, &srcs)
    }

    /// Causal 1-d convolution over the inner channels:
    /// `sx: [d_conv-1+n_t, d_inner, n_s]`, `c: [d_conv, d_inner]` →
    /// `[d_inner, n_t, n_s]`.
    pub fn ssm_conv(&mut self, sx: TensorId, c: TensorId) -> TensorId {
        let tsx = self.tensor(sx);
        let tc = self.tensor(c);
        assert_eq!(tsx.ne[1], tc.ne[1], "channel count differs");
        let n_t = tsx.ne[0] - tc.ne[0] + 1;
        assert!(n_t > 0);
        let ne = [tsx.ne[1], n_t, tsx.ne[2], 1];
        self.new_result(DType::F32, ne, Op::SsmConv, OpParams::None, &[sx, c])
    }

    /// Selective state-space scan. Output packs `y` (shaped like `x`)
    /// followed by the final states (shaped like `s`) in one flat tensor.
    pub fn ssm_scan(
        &mut self,
        s: TensorId,
        x: TensorId,
        dt: TensorId,
        a: TensorId,
        b: TensorId,
        c: TensorId,
    ) -> TensorId {
        let ts = self.tensor(s);
        let tx = self.tensor(x);
        let tdt = self.tensor(dt);
        let ta = self.tensor(a);
        let tb = self.tensor(b);
        let tc = self.tensor(c);
        let d_state = ts.ne[0];
        let d_inner = ts.ne[1];
        assert_eq!(tx.ne[0], d_inner);
        assert!(tdt.same_shape(tx));
        assert_eq!(ta.ne[0], d_state);
        assert_eq!(ta.ne[1], d_inner);
        assert_eq!(tb.ne[0], d_state);
        assert!(tc.same_shape(tb));
        let n = tx.nelements() + ts.nelements();
        self.new_result(DType::F32, [n, 1, 1, 1], Op::SsmScan, OpParams::None, &[s, x, dt, a, b, c])
    }

    /// RWKV WKV recurrence over `S`-wide heads. `k/v/r: [S, H, T, 1]`,
    /// `tf/td: [S, H, T-broadcast, 1]`, `state: [S, S, H, n_seqs]`;
    /// output `[S·H, T + S·n_seqs, 1, 1]` packing per-token outputs then
    /// the final states.
    pub fn rwkv_wkv(
        &mut self,
        k: TensorId,
        v: TensorId,
        r: TensorId,
        tf: TensorId,
        td: TensorId,
        state: TensorId,
    ) -> TensorId {
        let tk = self.tensor(k);
        let tstate = self.tensor(state);
        let s = tk.ne[0];
        let h = tk.ne[1];
        let t = tk.ne[2];
        assert!(self.tensor(v).same_shape(tk));
        assert!(self.tensor(r).same_shape(tk));
        assert_eq!(tstate.ne[0], s);
        assert_eq!(tstate.ne[1], s);
        assert_eq!(tstate.ne[2], h);
        let n_seqs = tstate.ne[3];
        let ne = [s * h, t + s * n_seqs, 1, 1];
        self.new_result(DType::F32, ne, Op::RwkvWkv, OpParams::None, &[k, v, r, tf, td, state])
    }

    // ---- losses ------------------------------------------------------------

    /// Scalar cross-entropy between logits `a` and target probabilities
    /// `b`, averaged over rows.
    pub fn cross_entropy_loss(&mut self, a: TensorId, b: TensorId) -> TensorId {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        self.new_result(
            DType::F32,
            [1, 1, 1, 1],
            Op::CrossEntropyLoss,
            OpParams::None,
            &[a, b],
        )
    }

    pub fn cross_entropy_loss_back(
        &mut self,
        a: TensorId,
        b: TensorId,
        g: TensorId,
    ) -> TensorId {
        assert!(self.tensor(a).same_shape(self.tensor(b)));
        assert!(self.tensor(g).is_scalar());
        let (dtype, ne) = {
            let t = self.tensor(a);
            (t.dtype, t.ne)
        };
        self.new_result(dtype, ne, Op::CrossEntropyLossBack, OpParams::None, &[a, b, g])
    }
}

fn conv_out(w: i64, k: i64, s: usize, p: usize, d: usize) -> i64 {
    (w + 2 * p as i64 - d as i64 * (k - 1) - 1) / s as i64 + 1
}

fn pool_out(w: i64, k: usize, s: usize, p: i32) -> i64 {
    (w + 2 * p as i64 - k as i64) / s as i64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn mul_mat_shape_rule() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let a = ctx.new_tensor_2d(DType::F32, 3, 2);
        let b = ctx.new_tensor_2d(DType::F32, 3, 5);
        let d = ctx.mul_mat(a, b);
        assert_eq!(ctx.tensor(d).ne, [2, 5, 1, 1]);
    }

    #[test]
    #[should_panic]
    fn mul_mat_rejects_mismatched_inner() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let a = ctx.new_tensor_2d(DType::F32, 3, 2);
        let b = ctx.new_tensor_2d(DType::F32, 4, 5);
        ctx.mul_mat(a, b);
    }

    #[test]
    fn conv_shapes() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let kernel = ctx.new_tensor_4d(DType::F32, 3, 3, 2, 4);
        let image = ctx.new_tensor_4d(DType::F32, 8, 8, 2, 1);
        let out = ctx.conv_2d(kernel, image, 1, 1, 1, 1, 1, 1);
        assert_eq!(ctx.tensor(out).ne, [4, 8, 8, 1]);
    }

    #[test]
    fn flash_attn_output_is_permuted() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let q = ctx.new_tensor_4d(DType::F32, 16, 7, 4, 1);
        let k = ctx.new_tensor_4d(DType::F32, 16, 10, 4, 1);
        let v = ctx.new_tensor_4d(DType::F32, 16, 10, 4, 1);
        let out = ctx.flash_attn_ext(q, k, v, None, 0.25, 0.0, 0.0);
        assert_eq!(ctx.tensor(out).ne, [16, 4, 7, 1]);
    }
}
