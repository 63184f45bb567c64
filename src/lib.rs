//! slipstream: a CPU tensor-graph execution engine.
//!
//! Callers open a [`Context`] (an arena that owns every tensor), build a
//! DAG of tensor operations through the op-builder methods, capture it
//! into a [`Graph`], plan an execution for a thread count, and evaluate it
//! on a persistent [`ThreadPool`]. Weights and results persist through the
//! [`gguf`] container; quantized numeric formats live in [`quant`] behind
//! the [`types::DType`] registry.

pub mod context;
pub mod errors;
pub mod gguf;
pub mod graph;
pub(crate) mod kernels;
pub mod numa;
pub mod pool;
pub mod quant;
pub mod simd;
pub mod tensor;
pub mod types;

pub use context::{Context, ContextParams, Scratch};
pub use errors::{SlipError, SlipResult};
pub use graph::backward::build_backward;
pub use graph::planner::{plan, Plan};
pub use graph::{EvalOrder, Graph};
pub use pool::{compute_with_ctx, SchedPriority, Status, ThreadPool, ThreadPoolParams};
pub use tensor::{
    Op, OpParams, PoolOp, RopeMode, RopeParams, SortOrder, Tensor, TensorFlags, TensorId, UnaryOp,
};
pub use types::DType;
