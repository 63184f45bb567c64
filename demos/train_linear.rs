//! Fit a linear map with the graph engine: forward + backward graphs built
//! once, evaluated repeatedly, parameters stepped by plain SGD.

use anyhow::{ensure, Result};
use slipstream::{build_backward, plan, Context, Graph, Status, ThreadPool, ThreadPoolParams};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let k = 4usize;
    let n = 64usize;
    let true_w = [0.5f32, -1.25, 2.0, 0.75];

    // synthetic dataset: y = w·x with a deterministic pseudo-random x
    let mut xs = vec![0.0f32; k * n];
    let mut ys = vec![0.0f32; n];
    for j in 0..n {
        for i in 0..k {
            xs[j * k + i] = (((j * 31 + i * 17) % 23) as f32 - 11.0) * 0.1;
        }
        ys[j] = (0..k).map(|i| true_w[i] * xs[j * k + i]).sum();
    }

    let mut ctx = Context::with_size(1 << 24)?;
    let x = ctx.from_slice_f32(&[k as i64, n as i64], &xs);
    let target = ctx.from_slice_f32(&[1, n as i64], &ys);
    let w = ctx.from_slice_f32(&[k as i64, 1], &[0.0; 4]);
    ctx.set_param(w);
    ctx.set_name(w, "w");

    let pred = ctx.mul_mat(w, x);
    let diff = ctx.sub(pred, target);
    let sq = ctx.sqr(diff);
    let loss = ctx.sum(sq);
    ctx.set_loss(loss);

    let mut gf = Graph::new(64);
    gf.build_forward_expand(&ctx, loss)?;
    let mut gb = Graph::new(256);
    build_backward(&mut ctx, &gf, &mut gb, false)?;

    let mut pool = ThreadPool::new(ThreadPoolParams::with_threads(4))?;
    let mut p = plan(&ctx, &gb, 4);
    let grad = ctx.tensor(w).grad.expect("w grad");

    let lr = 0.01f32;
    for step in 0..200 {
        ensure!(
            pool.compute(&ctx, &gb, &mut p) == Status::Success,
            "compute failed at step {step}"
        );
        let g: Vec<f32> = ctx.f32s(grad).to_vec();
        for (wi, gi) in ctx.f32s_mut(w).iter_mut().zip(&g) {
            *wi -= lr * gi;
        }
        if step % 50 == 0 {
            println!("step {:3}  loss {:.6}", step, ctx.f32s(loss)[0]);
        }
    }

    println!("learned w: {:?}", ctx.f32s(w));
    println!("true    w: {:?}", true_w);
    Ok(())
}
