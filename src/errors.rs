use crate::types::DType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlipError {
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted { requested: usize, available: usize },
    #[error("graph is full (capacity {capacity})")]
    GraphFull { capacity: usize },
    #[error("tensor not found: {0}")]
    TensorNotFound(String),
    #[error("type {0:?} requires an importance matrix for quantization")]
    ImatrixRequired(DType),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("gguf: {0}")]
    Gguf(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SlipResult<T> = Result<T, SlipError>;
