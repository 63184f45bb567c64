//! Execution planning: per-op task counts and the worst-case scratch
//! buffer one evaluation needs for a given thread count.

use crate::context::Context;
use crate::graph::Graph;
use crate::tensor::{Op, TensorId};
use crate::types::DType;
use std::sync::Arc;
use tracing::debug;

pub type AbortCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Everything `compute` needs besides the graph itself. `work` is lazily
/// grown at compute time so a plan can be reused across evaluations.
pub struct Plan {
    pub n_threads: usize,
    pub work_size: usize,
    pub(crate) n_tasks: Vec<usize>,
    /// Backing storage for the work area; u64 units keep the base pointer
    /// aligned for staged blocks and per-thread partials.
    pub(crate) work: Vec<u64>,
    pub abort: Option<AbortCallback>,
}

impl Plan {
    pub fn set_abort_callback(&mut self, cb: AbortCallback) {
        self.abort = Some(cb);
    }
}

/// Choose task counts and scratch sizes for evaluating `graph` with
/// `n_threads` workers.
pub fn plan(ctx: &Context, graph: &Graph, n_threads: usize) -> Plan {
    let n_threads = n_threads.max(1);
    let mut work_size = 0usize;
    let mut n_tasks = Vec::with_capacity(graph.nodes.len());

    for &node in &graph.nodes {
        n_tasks.push(node_task_count(ctx, node, n_threads));
        work_size = work_size.max(node_work_size(ctx, node, n_threads));
    }
    if work_size > 0 {
        // one cache line between per-thread regions
        work_size += 64 * n_threads;
    }
    debug!(n_threads, work_size, nodes = graph.nodes.len(), "plan");
    Plan {
        n_threads,
        work_size,
        n_tasks,
        work: Vec::new(),
        abort: None,
    }
}

fn node_task_count(ctx: &Context, id: TensorId, n_threads: usize) -> usize {
    let t = ctx.tensor(id);
    match t.op {
        Op::None | Op::View | Op::Reshape | Op::Permute | Op::Transpose => 1,
        // single-threaded by contract: whole-tensor reductions and
        // diagonal/index ops
        Op::Sum
        | Op::Mean
        | Op::Argmax
        | Op::Diag
        | Op::Arange
        | Op::SsmConv
        | Op::SsmScan
        | Op::RwkvWkv
        | Op::ConvTranspose1d
        | Op::GetRows
        | Op::GetRowsBack
        | Op::Pool1d
        | Op::Pool2d
        | Op::Pool2dBack
        | Op::CrossEntropyLossBack => 1,
        _ => n_threads,
    }
}

fn node_work_size(ctx: &Context, id: TensorId, n_threads: usize) -> usize {
    let t = ctx.tensor(id);
    let f32s = std::mem::size_of::<f32>();
    match t.op {
        Op::MulMat => {
            let a = ctx.tensor(t.src[0].unwrap());
            let b = ctx.tensor(t.src[1].unwrap());
            let vdt = a.dtype.vec_dot_type();
            if b.dtype != vdt {
                vdt.row_size(b.ne[0] as usize) * (b.ne[1] * b.ne[2] * b.ne[3]) as usize
            } else {
                0
            }
        }
        Op::MulMatId => {
            let a = ctx.tensor(t.src[0].unwrap());
            let b = ctx.tensor(t.src[1].unwrap());
            let n_as = a.ne[2] as usize;
            let n_ids = (b.ne[1] * b.ne[2]) as usize;
            let vdt = a.dtype.vec_dot_type();
            let quant = if b.dtype != vdt {
                vdt.row_size(b.ne[0] as usize) * (b.ne[1] * b.ne[2] * b.ne[3]) as usize
            } else {
                0
            };
            // per-expert buckets of (token row, used slot) pairs
            quant + n_as * (n_ids + 1) * 2 * std::mem::size_of::<i64>()
        }
        Op::SoftMax => t.ne[0] as usize * f32s * n_threads,
        Op::FlashAttnExt => {
            let dk = ctx.tensor(t.src[0].unwrap()).ne[0] as usize;
            let dv = ctx.tensor(t.src[2].unwrap()).ne[0] as usize;
            3 * dk.max(dv) * f32s * n_threads
        }
        Op::ConvTranspose1d | Op::ConvTranspose2d => {
            let a = ctx.tensor(t.src[0].unwrap());
            let b = ctx.tensor(t.src[1].unwrap());
            (a.nelements() + b.nelements()) as usize * f32s
        }
        Op::CountEqual => n_threads * std::mem::size_of::<i64>(),
        Op::CrossEntropyLoss => (t.src[0].map(|s| ctx.tensor(s).ne[0]).unwrap_or(0) as usize
            + 1)
            * f32s
            * n_threads,
        Op::Cpy | Op::Dup => {
            // conversions through a quantized end stage one f32 row per
            // thread
            let src_q = t
                .src[0]
                .map(|s| ctx.tensor(s).dtype.is_quantized())
                .unwrap_or(false);
            if t.dtype.is_quantized() || src_q {
                t.ne[0] as usize * f32s * n_threads
            } else {
                0
            }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_pre_pass_sized_for_partner_type() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let a = ctx.new_tensor_2d(DType::Q4_0, 64, 4);
        let b = ctx.new_tensor_2d(DType::F32, 64, 3);
        let d = ctx.mul_mat(a, b);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, d).unwrap();
        let p = plan(&ctx, &g, 2);
        // 3 rows of 64 elements in q8_0
        assert!(p.work_size >= DType::Q8_0.row_size(64) * 3);
    }

    #[test]
    fn dense_matmul_needs_no_scratch() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let a = ctx.new_tensor_2d(DType::F32, 16, 4);
        let b = ctx.new_tensor_2d(DType::F32, 16, 3);
        let d = ctx.mul_mat(a, b);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, d).unwrap();
        let p = plan(&ctx, &g, 4);
        assert_eq!(p.work_size, 0);
        assert_eq!(p.n_tasks, vec![4]);
    }
}
