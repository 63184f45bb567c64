use slipstream::{build_backward, compute_with_ctx, Context, Graph, Status, TensorId};

fn forward_value(ctx: &Context, gf: &Graph, y: TensorId) -> f32 {
    assert_eq!(compute_with_ctx(ctx, gf, 1), Status::Success);
    ctx.f32s(y)[0]
}

/// Central finite difference of the forward graph wrt one element of `t`.
fn finite_diff(ctx: &mut Context, gf: &Graph, y: TensorId, t: TensorId, i: usize) -> f32 {
    let eps = 1e-3f32;
    let orig = ctx.f32s(t)[i];
    ctx.f32s_mut(t)[i] = orig + eps;
    let up = forward_value(ctx, gf, y);
    ctx.f32s_mut(t)[i] = orig - eps;
    let down = forward_value(ctx, gf, y);
    ctx.f32s_mut(t)[i] = orig;
    (up - down) / (2.0 * eps)
}

fn check_param_grads(ctx: &mut Context, gf: &Graph, y: TensorId, params: &[TensorId]) {
    for &param in params {
        let grad = ctx.tensor(param).grad.expect("param grad missing");
        let analytic = ctx.f32s(grad).to_vec();
        for i in 0..analytic.len() {
            let numeric = finite_diff(ctx, gf, y, param, i);
            let tol = 1e-3 * (1.0 + numeric.abs());
            assert!(
                (analytic[i] - numeric).abs() < tol,
                "grad[{}] analytic {} vs numeric {}",
                i,
                analytic[i],
                numeric
            );
        }
    }
}

#[test]
fn backward_of_squared_matmul() {
    // y = sum((A·B)^2); dy/dA = 2(AB)Bᵀ, dy/dB = 2Aᵀ(AB)
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let a = ctx.from_slice_f32(&[3, 2], &[0.5, -1.0, 2.0, 1.5, 0.25, -0.75]);
    let b = ctx.from_slice_f32(&[3, 1], &[1.0, 2.0, -1.0]);
    ctx.set_param(a);
    ctx.set_param(b);
    let mm = ctx.mul_mat(a, b);
    let sq = ctx.sqr(mm);
    let y = ctx.sum(sq);

    let mut gf = Graph::new(32);
    gf.build_forward_expand(&ctx, y).unwrap();
    let mut gb = Graph::new(128);
    build_backward(&mut ctx, &gf, &mut gb, false).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &gb, 2), Status::Success);

    check_param_grads(&mut ctx, &gf, y, &[a, b]);
}

#[test]
fn backward_through_activations() {
    // y = sum(silu(W·x) + tanh(W·x))
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let w = ctx.from_slice_f32(&[4, 3], &[0.1, -0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8, 0.9, 1.0, -1.1, 1.2]);
    let x = ctx.from_slice_f32(&[4, 1], &[0.5, -0.25, 0.75, 1.0]);
    ctx.set_param(w);
    let h = ctx.mul_mat(w, x);
    let s = ctx.silu(h);
    let t = ctx.tanh(h);
    let both = ctx.add(s, t);
    let y = ctx.sum(both);

    let mut gf = Graph::new(32);
    gf.build_forward_expand(&ctx, y).unwrap();
    let mut gb = Graph::new(128);
    build_backward(&mut ctx, &gf, &mut gb, false).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &gb, 1), Status::Success);

    check_param_grads(&mut ctx, &gf, y, &[w]);
}

#[test]
fn branching_gradients_accumulate() {
    // y = sum(relu(x) + x): dy/dx = step(x) + 1
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let x = ctx.from_slice_f32(&[4], &[-1.0, 2.0, -3.0, 4.0]);
    ctx.set_param(x);
    let r = ctx.relu(x);
    let s = ctx.add(r, x);
    let y = ctx.sum(s);

    let mut gf = Graph::new(16);
    gf.build_forward_expand(&ctx, y).unwrap();
    let mut gb = Graph::new(64);
    build_backward(&mut ctx, &gf, &mut gb, false).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &gb, 1), Status::Success);

    let grad = ctx.tensor(x).grad.unwrap();
    assert_eq!(ctx.f32s(grad), &[1.0, 2.0, 1.0, 2.0]);
}

#[test]
fn backward_of_rms_norm_and_softmax() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let x = ctx.from_slice_f32(&[6], &[0.3, -0.6, 1.2, -0.1, 0.8, -1.4]);
    let t = ctx.from_slice_f32(&[6], &[0.1, 0.2, 0.05, 0.15, 0.3, 0.2]);
    ctx.set_param(x);
    let n = ctx.rms_norm(x, 1e-5);
    let sm = ctx.soft_max(n);
    let w = ctx.mul(sm, t);
    let y = ctx.sum(w);

    let mut gf = Graph::new(32);
    gf.build_forward_expand(&ctx, y).unwrap();
    let mut gb = Graph::new(128);
    build_backward(&mut ctx, &gf, &mut gb, false).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &gb, 1), Status::Success);

    check_param_grads(&mut ctx, &gf, y, &[x]);
}

#[test]
fn cross_entropy_gradient_matches() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let logits = ctx.from_slice_f32(&[4, 2], &[0.2, -0.4, 0.6, 0.1, -0.3, 0.5, 0.9, -0.2]);
    let target = ctx.from_slice_f32(&[4, 2], &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    ctx.set_param(logits);
    let y = ctx.cross_entropy_loss(logits, target);

    let mut gf = Graph::new(16);
    gf.build_forward_expand(&ctx, y).unwrap();
    let mut gb = Graph::new(64);
    build_backward(&mut ctx, &gf, &mut gb, false).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &gb, 1), Status::Success);

    check_param_grads(&mut ctx, &gf, y, &[logits]);
}

#[test]
fn every_param_has_grad_after_backward() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let a = ctx.from_slice_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = ctx.from_slice_f32(&[2, 2], &[0.5, 0.5, 0.5, 0.5]);
    ctx.set_param(a);
    ctx.set_param(b);
    let m = ctx.mul(a, b);
    let y = ctx.sum(m);
    let mut gf = Graph::new(16);
    gf.build_forward_expand(&ctx, y).unwrap();
    let mut gb = Graph::new(64);
    build_backward(&mut ctx, &gf, &mut gb, false).unwrap();
    assert!(ctx.tensor(a).grad.is_some());
    assert!(ctx.tensor(b).grad.is_some());
}

#[test]
#[should_panic(expected = "backward not implemented: flash_attn_ext")]
fn flash_attention_backward_refuses() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let q = ctx.new_tensor_4d(slipstream::DType::F32, 8, 2, 1, 1);
    let k = ctx.new_tensor_4d(slipstream::DType::F32, 8, 4, 1, 1);
    let v = ctx.new_tensor_4d(slipstream::DType::F32, 8, 4, 1, 1);
    ctx.set_param(q);
    let att = ctx.flash_attn_ext(q, k, v, None, 1.0, 0.0, 0.0);
    let y = ctx.sum(att);
    let mut gf = Graph::new(16);
    gf.build_forward_expand(&ctx, y).unwrap();
    let mut gb = Graph::new(64);
    let _ = build_backward(&mut ctx, &gf, &mut gb, false);
}
