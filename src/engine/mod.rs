//! Transactional Engine Seam
//!
//! The conflict engine drives the underlying storage engine through a
//! "define operations, then flush a batch" model:
//! - Operations are defined one by one and held by the engine
//! - `execute` ships every pending operation in one round trip
//! - Per-operation failures come back in `CompletedOp`, never abort the batch
//! - A whole-batch failure (e.g. node failure) is an `EngineError`
//!
//! `MemoryEngine` is a complete in-process implementation used by the
//! simulator and the tests.

mod memory;

pub use memory::{MemoryEngine, OutboundEvent, OutboundKind, StoredRow};

use std::fmt;

use thiserror::Error;

use crate::conflict::{CheckProgram, ExceptionsRow, RowImage, RowKey};

/// Stable per-operation sequence number assigned at definition time.
pub type OpSeq = u64;

/// Kind of engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    /// Forced overwrite: insert or update, never fails on presence.
    Write,
    /// Zero-payload realignment of the row towards the peer.
    Refresh,
    /// Locking read, used for read markers.
    Read,
}

/// Payload of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationBody {
    Empty,
    Row(RowImage),
    /// Append to the operation's table as an exceptions row.
    Exception(Box<ExceptionsRow>),
}

/// One operation handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub seq: OpSeq,
    pub table: String,
    pub kind: OperationKind,
    pub key: RowKey,
    pub body: OperationBody,
    /// Interpreted check run against the stored row.
    pub check: Option<CheckProgram>,
    /// Ship this change back to the peer as a reflected operation.
    pub reflect: bool,
}

/// Result of one executed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedOp {
    pub seq: OpSeq,
    pub error: Option<EngineErrorCode>,
}

impl CompletedOp {
    pub fn ok(seq: OpSeq) -> Self {
        Self { seq, error: None }
    }

    pub fn failed(seq: OpSeq, code: EngineErrorCode) -> Self {
        Self {
            seq,
            error: Some(code),
        }
    }
}

/// Engine error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorCode {
    /// Constraint violation: row already exists
    DuplicateKey,
    /// No data found
    RowNotFound,
    /// Interpreted check program rejected the operation
    ConflictFnViolation,
    /// Operation defined on a row already refreshed in this transaction
    OpAfterRefresh,
    /// Temporary failure; the transaction may succeed if retried
    Temporary(u32),
    /// Any other permanent failure
    Permanent(u32),
}

impl EngineErrorCode {
    pub const DUPLICATE_KEY: u32 = 630;
    pub const ROW_NOT_FOUND: u32 = 626;
    pub const CONFLICT_FN_VIOLATION: u32 = 9999;
    pub const OP_AFTER_REFRESH: u32 = 920;

    /// Numeric error code.
    pub fn code(&self) -> u32 {
        match self {
            Self::DuplicateKey => Self::DUPLICATE_KEY,
            Self::RowNotFound => Self::ROW_NOT_FOUND,
            Self::ConflictFnViolation => Self::CONFLICT_FN_VIOLATION,
            Self::OpAfterRefresh => Self::OP_AFTER_REFRESH,
            Self::Temporary(code) | Self::Permanent(code) => *code,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DuplicateKey => "DUPLICATE_KEY",
            Self::RowNotFound => "ROW_NOT_FOUND",
            Self::ConflictFnViolation => "CONFLICT_FN_VIOLATION",
            Self::OpAfterRefresh => "OP_AFTER_REFRESH",
            Self::Temporary(_) => "TEMPORARY",
            Self::Permanent(_) => "PERMANENT",
        }
    }
}

impl fmt::Display for EngineErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Whole-batch engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error {code}: {message}")]
pub struct EngineError {
    pub code: EngineErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: EngineErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// How `execute` finishes the round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    /// Execute pending operations, keep the transaction open
    NoCommit,
    /// Execute pending operations and commit
    Commit { force_send: bool },
}

/// Underlying transactional engine.
pub trait Engine {
    /// Queue an operation for the next `execute`.
    fn define(&mut self, op: Operation) -> Result<(), EngineError>;

    /// Flush every pending operation in one round trip.
    fn execute(&mut self, exec: ExecType) -> Result<Vec<CompletedOp>, EngineError>;

    /// Discard pending operations and the open transaction.
    fn rollback(&mut self);

    /// Number of defined but not yet executed operations.
    fn pending(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineErrorCode::DuplicateKey.code(), 630);
        assert_eq!(EngineErrorCode::RowNotFound.code(), 626);
        assert_eq!(EngineErrorCode::ConflictFnViolation.code(), 9999);
        assert_eq!(EngineErrorCode::OpAfterRefresh.code(), 920);
        assert_eq!(EngineErrorCode::Temporary(266).code(), 266);
    }

    #[test]
    fn test_temporary_classification() {
        assert!(EngineErrorCode::Temporary(266).is_temporary());
        assert!(!EngineErrorCode::Permanent(4000).is_temporary());
        assert!(!EngineErrorCode::RowNotFound.is_temporary());
    }

    #[test]
    fn test_display() {
        assert_eq!(EngineErrorCode::RowNotFound.to_string(), "ROW_NOT_FOUND (626)");
        let err = EngineError::new(EngineErrorCode::Temporary(410), "redo log full");
        assert!(err.to_string().contains("redo log full"));
    }
}
