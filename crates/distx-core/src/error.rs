//! Error types for the optimizer.
//!
//! Missing statistics and infeasible strategies are never errors: the optimizer
//! falls back to a conservative choice. Only structural problems in the input plan
//! or configuration surface as an [`OptimizerError`].

use crate::expr::{ColumnId, CteId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizerError {
    /// A CTE transitively consumes itself.
    #[error("cyclic CTE reference involving cte {0}")]
    CyclicCte(CteId),

    /// A consumer refers to a CTE id with no producer.
    #[error("unknown CTE {0}")]
    UnknownCte(CteId),

    /// An operator references a column that no child produces.
    #[error("column {column} referenced by {operator} is not produced by its input")]
    DanglingColumn { column: ColumnId, operator: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal optimizer error: {0}")]
    Internal(String),
}

impl OptimizerError {
    /// Whether the error was caused by the caller's input rather than the optimizer.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, OptimizerError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;
