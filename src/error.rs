use std::fmt;
use thiserror::Error;

/// Which embedding table an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    User,
    Item,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::User => write!(f, "user"),
            Table::Item => write!(f, "item"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TowerError {
    #[error("{table} index {index} is out of bounds for a table of {len} rows")]
    IndexOutOfBounds { table: Table, index: usize, len: usize },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch of {size} pairs carries no training signal")]
    EmptyBatch { size: usize },

    #[error("loss became non-finite ({0})")]
    NonFiniteLoss(f32),
}

impl TowerError {
    pub fn config(message: impl Into<String>) -> Self {
        TowerError::Configuration(message.into())
    }

    /// Errors that only invalidate the current batch; the training loop logs
    /// them and moves on.
    pub fn is_batch_local(&self) -> bool {
        matches!(self, TowerError::EmptyBatch { .. } | TowerError::NonFiniteLoss(_))
    }
}

pub type Result<T> = std::result::Result<T, TowerError>;
