//! Engine error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{MatrixId, MemberId, PositionId, PositionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("matrix {0} has no free position within its configured depth")]
    MatrixFull(MatrixId),

    #[error("placement slot in matrix {0} was claimed concurrently")]
    ConcurrentSlotConflict(MatrixId),

    #[error("matrix {0} not found")]
    MatrixNotFound(MatrixId),

    #[error("matrix {0} already exists")]
    MatrixExists(MatrixId),

    #[error("matrix {0} is disabled")]
    MatrixDisabled(MatrixId),

    #[error("position {position} not found in matrix {matrix}")]
    PositionNotFound {
        matrix: MatrixId,
        position: PositionId,
    },

    #[error("member {0} not found")]
    MemberNotFound(MemberId),

    #[error("member {0} already registered")]
    MemberExists(MemberId),

    #[error("position {position} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        position: PositionId,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("invalid matrix configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
