//! Backward-graph construction: walk the forward nodes in reverse
//! topological order and insert the gradient expression of each op by
//! structural rewriting.
//!
//! Two identity sets drive gradient accumulation: `zero_table` holds grads
//! still at their initial zero value (first contribution replaces instead
//! of adding), `acc_table` holds grads that must accumulate in place
//! (parameter grads when the caller requested accumulation across
//! evaluations).

use crate::context::Context;
use crate::errors::SlipResult;
use crate::graph::visit::VisitSet;
use crate::graph::Graph;
use crate::tensor::{Op, OpParams, TensorFlags, TensorId, UnaryOp, MAX_DIMS};
use crate::types::DType;

/// Attach gradient tensors to every tensor that needs one, synthesize the
/// gradient expressions of `gf` into `gb`, and expand `gb` with the
/// parameter gradients.
pub fn build_backward(
    ctx: &mut Context,
    gf: &Graph,
    gb: &mut Graph,
    accumulate: bool,
) -> SlipResult<()> {
    // replay the forward topology into gb
    for &node in &gf.nodes {
        gb.build_forward_expand(ctx, node)?;
    }

    // propagate "needs gradient" forward: params seed it, consumers inherit
    let mut needs = vec![false; ctx.n_tensors()];
    for &node in &gf.nodes {
        let t = ctx.tensor(node);
        let from_src = t
            .src
            .iter()
            .flatten()
            .any(|s| needs[s.0 as usize]);
        needs[node.0 as usize] = t.is_param() || from_src;
    }

    let mut zero_table = VisitSet::new(gf.capacity());
    let mut acc_table = VisitSet::new(gf.capacity());

    for &node in &gf.nodes {
        if !needs[node.0 as usize] {
            continue;
        }
        let t = ctx.tensor(node);
        assert_eq!(
            t.dtype,
            DType::F32,
            "gradients are tracked for f32 tensors only (op {})",
            t.op.name()
        );
        let (ne, is_param, is_loss) = (t.ne, t.is_param(), t.flags.contains(TensorFlags::LOSS));
        let grad = ctx.new_tensor(DType::F32, &ne);
        ctx.zero(grad);
        ctx.tensor_mut(node).grad = Some(grad);
        if is_loss {
            ctx.fill_f32(grad, 1.0);
        } else {
            zero_table.insert(grad);
        }
        if accumulate && is_param {
            acc_table.insert(grad);
        }
    }

    // if nothing was flagged as the loss, seed the final node
    let any_loss = gf.nodes.iter().any(|&n| {
        ctx.tensor(n).flags.contains(TensorFlags::LOSS) && ctx.tensor(n).grad.is_some()
    });
    if !any_loss {
        if let Some(&last) = gf.nodes.last() {
            if let Some(g) = ctx.tensor(last).grad {
                ctx.fill_f32(g, 1.0);
                // seeded now; further contributions must add
                zero_table = rebuild_without(ctx, gf, &zero_table, g);
            }
        }
    }

    for &node in gf.nodes.iter().rev() {
        if ctx.tensor(node).grad.is_some() {
            compute_backward(ctx, node, &mut zero_table, &mut acc_table);
        }
    }

    for &node in &gf.nodes {
        if ctx.tensor(node).is_param() {
            let grad = ctx
                .tensor(node)
                .grad
                .expect("parameter without gradient after backward");
            gb.build_forward_expand(ctx, grad)?;
        }
    }
    Ok(())
}

/// The visit set has no removal; rebuild it minus one handle.
fn rebuild_without(ctx: &Context, gf: &Graph, old: &VisitSet, drop: TensorId) -> VisitSet {
    let mut fresh = VisitSet::new(gf.capacity());
    for &node in &gf.nodes {
        if let Some(g) = ctx.tensor(node).grad {
            if g != drop && old.contains(g) {
                fresh.insert(g);
            }
        }
    }
    fresh
}

/// Fold `delta` into the gradient slot of `src` under the three
/// accumulation rules.
fn add_or_set(
    ctx: &mut Context,
    src: TensorId,
    delta: TensorId,
    zero_table: &mut VisitSet,
    acc_table: &mut VisitSet,
) {
    let Some(grad) = ctx.tensor(src).grad else {
        return;
    };
    assert!(
        ctx.tensor(grad).same_shape(ctx.tensor(delta)),
        "gradient shape mismatch: {:?} vs {:?}",
        ctx.tensor(grad).ne,
        ctx.tensor(delta).ne
    );
    let new_grad = if acc_table.contains(grad) {
        let r = ctx.add_inplace(grad, delta);
        acc_table.insert(r);
        r
    } else if zero_table.contains(grad) {
        delta
    } else {
        ctx.add(grad, delta)
    };
    ctx.tensor_mut(src).grad = Some(new_grad);
}

fn wants_grad(ctx: &Context, src: TensorId) -> bool {
    ctx.tensor(src).grad.is_some()
}

/// Reduce `delta` to the shape of `src` when the forward op broadcast it.
fn shrink_to(ctx: &mut Context, delta: TensorId, src: TensorId) -> TensorId {
    if ctx.tensor(delta).same_shape(ctx.tensor(src)) {
        delta
    } else {
        ctx.repeat_back(delta, src)
    }
}

fn compute_backward(
    ctx: &mut Context,
    id: TensorId,
    zero_table: &mut VisitSet,
    acc_table: &mut VisitSet,
) {
    let (op, params, src, grad) = {
        let t = ctx.tensor(id);
        (t.op, t.params, t.src, t.grad.unwrap())
    };
    let g = grad;
    let s = |i: usize| src[i].unwrap();

    match op {
        Op::None => {}
        // slicing views would need an acc-style scatter; refuse rather
        // than drop the contribution
        Op::View => panic!("backward not implemented: view"),
        Op::Dup | Op::Cont => {
            if wants_grad(ctx, s(0)) {
                let ne = ctx.tensor(s(0)).ne;
                let delta = ctx.reshape(g, &ne);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Add => {
            if wants_grad(ctx, s(0)) {
                add_or_set(ctx, s(0), g, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let delta = shrink_to(ctx, g, s(1));
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::Add1 => {
            if wants_grad(ctx, s(0)) {
                add_or_set(ctx, s(0), g, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let delta = ctx.sum(g);
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::Acc => {
            if wants_grad(ctx, s(0)) {
                add_or_set(ctx, s(0), g, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let OpParams::SetSlice {
                    nb1,
                    nb2,
                    nb3,
                    offset,
                    ..
                } = params
                else {
                    unreachable!()
                };
                let ne = ctx.tensor(s(1)).ne;
                let v = ctx.view_4d(g, ne[0], ne[1], ne[2], ne[3], nb1, nb2, nb3, offset);
                let delta = ctx.cont(v);
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::Sub => {
            if wants_grad(ctx, s(0)) {
                add_or_set(ctx, s(0), g, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let n = ctx.neg(g);
                let delta = shrink_to(ctx, n, s(1));
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::Mul => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.mul(g, s(1));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let ga = ctx.mul(g, s(0));
                let delta = shrink_to(ctx, ga, s(1));
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::Div => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.div(g, s(1));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let gy = ctx.mul(g, id);
                let q = ctx.div(gy, s(1));
                let nq = ctx.neg(q);
                let delta = shrink_to(ctx, nq, s(1));
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::Sqr => {
            if wants_grad(ctx, s(0)) {
                let t = ctx.mul(g, s(0));
                let delta = ctx.scale(t, 2.0);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Sqrt => {
            if wants_grad(ctx, s(0)) {
                let t = ctx.div(g, id);
                let delta = ctx.scale(t, 0.5);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Log => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.div(g, s(0));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Sin => {
            if wants_grad(ctx, s(0)) {
                let c = ctx.cos(s(0));
                let delta = ctx.mul(g, c);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Cos => {
            if wants_grad(ctx, s(0)) {
                let sn = ctx.sin(s(0));
                let t = ctx.mul(g, sn);
                let delta = ctx.neg(t);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Sum => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.repeat(g, s(0));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::SumRows => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.repeat(g, s(0));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Mean => {
            if wants_grad(ctx, s(0)) {
                let r = ctx.repeat(g, s(0));
                let ne0 = ctx.tensor(s(0)).ne[0];
                let delta = ctx.scale(r, 1.0 / ne0 as f32);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Repeat => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.repeat_back(g, s(0));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::RepeatBack => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.repeat(g, s(0));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Concat => {
            let OpParams::Concat { dim } = params else {
                unreachable!()
            };
            let gnb = ctx.tensor(g).nb;
            if wants_grad(ctx, s(0)) {
                let ne = ctx.tensor(s(0)).ne;
                let v = ctx.view_4d(g, ne[0], ne[1], ne[2], ne[3], gnb[1], gnb[2], gnb[3], 0);
                let delta = ctx.cont(v);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let ne_a = ctx.tensor(s(0)).ne;
                let ne = ctx.tensor(s(1)).ne;
                let offset = ne_a[dim] as usize * gnb[dim];
                let v = ctx.view_4d(g, ne[0], ne[1], ne[2], ne[3], gnb[1], gnb[2], gnb[3], offset);
                let delta = ctx.cont(v);
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::RmsNorm => {
            let OpParams::Norm { eps } = params else {
                unreachable!()
            };
            if wants_grad(ctx, s(0)) {
                let delta = ctx.rms_norm_back(s(0), g, eps);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::MulMat => {
            // dst = aᵀ·b; ∂a = out_prod(b, g), ∂b = (cont(aᵀ))ᵀ·g
            if wants_grad(ctx, s(0)) {
                let delta = ctx.out_prod(s(1), g);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
            if wants_grad(ctx, s(1)) {
                let at = ctx.transpose(s(0));
                let atc = ctx.cont(at);
                let delta = ctx.mul_mat(atc, g);
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
        }
        Op::Scale => {
            let OpParams::Scale { s: sc } = params else {
                unreachable!()
            };
            if wants_grad(ctx, s(0)) {
                let delta = ctx.scale(g, sc);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Set => {
            let OpParams::SetSlice {
                nb1,
                nb2,
                nb3,
                offset,
                ..
            } = params
            else {
                unreachable!()
            };
            if wants_grad(ctx, s(1)) {
                let ne = ctx.tensor(s(1)).ne;
                let v = ctx.view_4d(g, ne[0], ne[1], ne[2], ne[3], nb1, nb2, nb3, offset);
                let delta = ctx.cont(v);
                add_or_set(ctx, s(1), delta, zero_table, acc_table);
            }
            if wants_grad(ctx, s(0)) {
                // the window written by b contributes nothing to a
                let ne = ctx.tensor(s(1)).ne;
                let z = ctx.new_tensor(DType::F32, &ne);
                ctx.zero(z);
                let delta = ctx.set(g, z, nb1, nb2, nb3, offset, false);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Cpy => {
            if wants_grad(ctx, s(0)) {
                let ne = ctx.tensor(s(0)).ne;
                let c = ctx.cont(g);
                let delta = ctx.reshape(c, &ne);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Reshape => {
            if wants_grad(ctx, s(0)) {
                let ne = ctx.tensor(s(0)).ne;
                let c = ctx.cont(g);
                let delta = ctx.reshape(c, &ne);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Permute => {
            let OpParams::Permute { axes } = params else {
                unreachable!()
            };
            if wants_grad(ctx, s(0)) {
                let mut inv = [0usize; MAX_DIMS];
                for (i, &a) in axes.iter().enumerate() {
                    inv[a] = i;
                }
                let p = ctx.permute(g, inv);
                let delta = ctx.cont(p);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Transpose => {
            if wants_grad(ctx, s(0)) {
                let t = ctx.transpose(g);
                let delta = ctx.cont(t);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::GetRows => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.get_rows_back(g, s(1), s(0));
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::DiagMaskInf | Op::DiagMaskZero => {
            let OpParams::DiagMask { n_past } = params else {
                unreachable!()
            };
            if wants_grad(ctx, s(0)) {
                let delta = ctx.diag_mask_zero(g, n_past);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::SoftMax => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.soft_max_back(g, id);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Rope => {
            let OpParams::Rope(rp) = params else {
                unreachable!()
            };
            if wants_grad(ctx, s(0)) {
                let ff = src[2];
                let delta = ctx.rope_back(g, s(1), ff, rp);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::RopeBack => {
            let OpParams::Rope(rp) = params else {
                unreachable!()
            };
            if wants_grad(ctx, s(0)) {
                let ff = src[2];
                let delta = ctx.rope_ext(g, s(1), ff, rp);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Pool2d => {
            let OpParams::Pool {
                op: pop,
                k0,
                k1,
                s0,
                s1,
                p0,
                p1,
            } = params
            else {
                unreachable!()
            };
            if wants_grad(ctx, s(0)) {
                let delta = ctx.pool_2d_back(g, s(0), pop, k0, k1, s0, s1, p0, p1);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::Unary => {
            let OpParams::Unary(u) = params else {
                unreachable!()
            };
            unary_backward(ctx, id, u, g, &src, zero_table, acc_table);
        }
        Op::CrossEntropyLoss => {
            if wants_grad(ctx, s(0)) {
                let delta = ctx.cross_entropy_loss_back(s(0), s(1), g);
                add_or_set(ctx, s(0), delta, zero_table, acc_table);
            }
        }
        Op::FlashAttnExt => {
            // the fused attention backward was never reworked; refuse
            // instead of silently dropping the gradient
            panic!("backward not implemented: flash_attn_ext");
        }
        other => panic!("backward not implemented: {}", other.name()),
    }
}

fn unary_backward(
    ctx: &mut Context,
    id: TensorId,
    u: UnaryOp,
    g: TensorId,
    src: &[Option<TensorId>],
    zero_table: &mut VisitSet,
    acc_table: &mut VisitSet,
) {
    let a = src[0].unwrap();
    if ctx.tensor(a).grad.is_none() {
        return;
    }
    let delta = match u {
        UnaryOp::Abs => {
            let sg = ctx.sgn(a);
            ctx.mul(g, sg)
        }
        // piecewise-constant outputs carry no gradient
        UnaryOp::Sgn | UnaryOp::Step => return,
        UnaryOp::Neg => ctx.neg(g),
        UnaryOp::Tanh => {
            let y2 = ctx.sqr(id);
            let gy2 = ctx.mul(g, y2);
            ctx.sub(g, gy2)
        }
        UnaryOp::Relu => {
            let st = ctx.step(a);
            ctx.mul(g, st)
        }
        UnaryOp::Sigmoid => {
            let y2 = ctx.sqr(id);
            let ymy2 = ctx.sub(id, y2);
            ctx.mul(g, ymy2)
        }
        UnaryOp::Silu => ctx.silu_back(a, g),
        UnaryOp::Exp => ctx.mul(g, id),
        other => panic!("backward not implemented: unary {:?}", other),
    };
    add_or_set(ctx, a, delta, zero_table, acc_table);
}
