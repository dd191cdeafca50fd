//! Apply Error Types
//!
//! Conflicts themselves are never errors: they are resolved locally and show
//! up only as counters and exceptions rows. Everything that reaches this type
//! either asks the caller to retry the whole epoch transaction (temporary) or
//! stops the applier (fatal).

use thiserror::Error;

use crate::engine::{EngineError, EngineErrorCode};

/// Apply error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ApplyError({kind:?}): {message}")]
pub struct ApplyError {
    /// Error kind
    pub kind: ApplyErrorKind,
    /// Error message
    pub message: String,
}

/// Apply error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorKind {
    /// Underlying engine reported a temporary error; retry the transaction
    Temporary,

    /// Transactional conflict detection needs the epoch transaction replayed
    TransactionRetry,

    /// Missing role, bad conflict function, invalid applier settings
    Configuration,

    /// Refresh requested on a row with large-object columns
    UnsupportedRefresh,

    /// Origin metadata or row images could not be decoded
    MalformedEvent,

    /// A corrective refresh or exceptions insert failed permanently
    RemediationFailed,

    /// Internal bookkeeping disagrees with engine results
    InvariantViolation,

    /// Non-conflict failure reported by the engine
    Engine,

    /// Role change rejected while conflict state is in flight
    RoleTransition,

    /// Applier already stopped by an earlier fatal error
    Halted,
}

impl ApplyError {
    /// Create a new apply error.
    pub fn new(kind: ApplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::Temporary, message)
    }

    pub fn transaction_retry(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::TransactionRetry, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::Configuration, message)
    }

    pub fn unsupported_refresh(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::UnsupportedRefresh, message)
    }

    pub fn malformed_event(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::MalformedEvent, message)
    }

    pub fn remediation_failed(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::RemediationFailed, message)
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::InvariantViolation, message)
    }

    pub fn role_transition(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::RoleTransition, message)
    }

    pub fn halted(message: impl Into<String>) -> Self {
        Self::new(ApplyErrorKind::Halted, message)
    }

    /// Map a per-operation engine code that is not a conflict.
    pub fn from_code(code: EngineErrorCode, context: &str) -> Self {
        if code.is_temporary() {
            Self::temporary(format!("{}: {}", context, code))
        } else {
            Self::new(ApplyErrorKind::Engine, format!("{}: {}", context, code))
        }
    }

    /// Caller should roll back and replay the whole epoch transaction.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self.kind,
            ApplyErrorKind::Temporary | ApplyErrorKind::TransactionRetry
        )
    }

    /// Check if this error stops the applier.
    pub fn is_fatal(&self) -> bool {
        !self.is_temporary() && self.kind != ApplyErrorKind::RoleTransition
    }
}

impl From<EngineError> for ApplyError {
    fn from(err: EngineError) -> Self {
        Self::from_code(err.code, &err.message)
    }
}

/// Result type for apply operations
pub type ApplyResult<T> = Result<T, ApplyError>;
