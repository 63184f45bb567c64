//! Graph capture: depth-first topological visit from the requested roots,
//! splitting tensors into leafs (plain values) and nodes (computations).

pub mod backward;
pub mod planner;
pub(crate) mod visit;

use crate::context::Context;
use crate::errors::{SlipError, SlipResult};
use crate::tensor::{Op, TensorId};
use tracing::debug;
use visit::{Insert, VisitSet};

/// Order in which a node's sources are visited during capture. The stored
/// node order (and therefore the evaluation order) follows from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalOrder {
    #[default]
    LeftToRight,
    RightToLeft,
}

pub struct Graph {
    capacity: usize,
    pub nodes: Vec<TensorId>,
    pub leafs: Vec<TensorId>,
    /// Parallel to `nodes`; filled by the backward builder.
    pub grads: Vec<Option<TensorId>>,
    pub order: EvalOrder,
    visited: VisitSet,
}

impl Graph {
    pub fn new(capacity: usize) -> Graph {
        Graph {
            capacity,
            nodes: Vec::with_capacity(capacity),
            leafs: Vec::with_capacity(capacity),
            grads: Vec::with_capacity(capacity),
            order: EvalOrder::default(),
            visited: VisitSet::new(capacity),
        }
    }

    pub fn with_order(capacity: usize, order: EvalOrder) -> Graph {
        Graph {
            order,
            ..Graph::new(capacity)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.leafs.clear();
        self.grads.clear();
        self.visited.reset();
    }

    /// Capture every tensor reachable from `root` that is not yet in the
    /// graph, in forward topological order.
    pub fn build_forward_expand(&mut self, ctx: &Context, root: TensorId) -> SlipResult<()> {
        let before = self.nodes.len();
        self.visit(ctx, root)?;
        debug!(
            new_nodes = self.nodes.len() - before,
            nodes = self.nodes.len(),
            leafs = self.leafs.len(),
            "graph capture"
        );
        Ok(())
    }

    fn visit(&mut self, ctx: &Context, id: TensorId) -> SlipResult<()> {
        match self.visited.insert(id) {
            Insert::Already => return Ok(()),
            Insert::Full => {
                return Err(SlipError::GraphFull {
                    capacity: self.capacity,
                })
            }
            Insert::Ok => {}
        }

        let srcs: Vec<TensorId> = {
            let t = ctx.tensor(id);
            let iter = t.src.iter().flatten().copied();
            match self.order {
                EvalOrder::LeftToRight => iter.collect(),
                EvalOrder::RightToLeft => {
                    let mut v: Vec<_> = iter.collect();
                    v.reverse();
                    v
                }
            }
        };
        for s in srcs {
            self.visit(ctx, s)?;
        }

        let t = ctx.tensor(id);
        if t.op == Op::None && !t.is_param() && t.grad.is_none() {
            if self.leafs.len() >= self.capacity {
                return Err(SlipError::GraphFull {
                    capacity: self.capacity,
                });
            }
            self.leafs.push(id);
        } else {
            if self.nodes.len() >= self.capacity {
                return Err(SlipError::GraphFull {
                    capacity: self.capacity,
                });
            }
            self.nodes.push(id);
            self.grads.push(ctx.tensor(id).grad);
        }
        Ok(())
    }

    /// Index of a node in evaluation order, if present.
    pub fn node_index(&self, id: TensorId) -> Option<usize> {
        self.nodes.iter().position(|&n| n == id)
    }

    /// Log the captured topology at debug level.
    pub fn dump(&self, ctx: &Context) {
        debug!("graph: {} nodes, {} leafs", self.nodes.len(), self.leafs.len());
        for (i, &n) in self.nodes.iter().enumerate() {
            let t = ctx.tensor(n);
            debug!(
                "node {:3}: {:?} {:>12} '{}' grad={}",
                i,
                t.ne,
                t.op.name(),
                t.name,
                t.grad.is_some(),
            );
        }
        for (i, &l) in self.leafs.iter().enumerate() {
            let t = ctx.tensor(l);
            debug!("leaf {:3}: {:?} '{}'", i, t.ne, t.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::types::DType;

    #[test]
    fn capture_classifies_leafs_and_nodes() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let a = ctx.new_tensor_1d(DType::F32, 8);
        let b = ctx.new_tensor_1d(DType::F32, 8);
        let c = ctx.add(a, b);
        let d = ctx.relu(c);

        let mut g = Graph::new(16);
        g.build_forward_expand(&ctx, d).unwrap();
        assert_eq!(g.leafs, vec![a, b]);
        assert_eq!(g.nodes, vec![c, d]);
    }

    #[test]
    fn revisit_is_idempotent() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let a = ctx.new_tensor_1d(DType::F32, 8);
        let b = ctx.relu(a);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, b).unwrap();
        g.build_forward_expand(&ctx, b).unwrap();
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.leafs.len(), 1);
    }

    #[test]
    fn diamond_topology_is_ordered() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let x = ctx.new_tensor_1d(DType::F32, 4);
        let a = ctx.relu(x);
        let b = ctx.sigmoid(x);
        let y = ctx.add(a, b);
        let mut g = Graph::new(16);
        g.build_forward_expand(&ctx, y).unwrap();
        let ia = g.node_index(a).unwrap();
        let ib = g.node_index(b).unwrap();
        let iy = g.node_index(y).unwrap();
        assert!(ia < iy && ib < iy);
    }

    #[test]
    fn params_are_not_leafs() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let w = ctx.new_tensor_1d(DType::F32, 4);
        ctx.set_param(w);
        let y = ctx.relu(w);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, y).unwrap();
        assert!(g.leafs.is_empty());
        assert_eq!(g.nodes.len(), 2);
    }
}
