//! Conflict Causes
//!
//! The cause of a conflict is derived only from the engine's error
//! classification, never from message text:
//! - constraint violation => RowAlreadyExists
//! - no data found => RowDoesNotExist
//! - conflict check program failure => RowInConflict

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::EngineErrorCode;

/// Why an applied operation conflicted with local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCause {
    /// Local row has moved on from what the change expected
    RowInConflict,
    /// Insert found an existing row
    RowAlreadyExists,
    /// Update or delete found no row
    RowDoesNotExist,
}

impl ConflictCause {
    /// Map an engine error code to a conflict cause.
    ///
    /// Returns `None` when the error is not a conflict at all.
    pub fn from_engine_error(code: EngineErrorCode) -> Option<Self> {
        match code {
            EngineErrorCode::ConflictFnViolation => Some(Self::RowInConflict),
            EngineErrorCode::DuplicateKey => Some(Self::RowAlreadyExists),
            EngineErrorCode::RowNotFound => Some(Self::RowDoesNotExist),
            EngineErrorCode::OpAfterRefresh
            | EngineErrorCode::Temporary(_)
            | EngineErrorCode::Permanent(_) => None,
        }
    }

    /// Stable name used in counters and exceptions rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RowInConflict => "ROW_IN_CONFLICT",
            Self::RowAlreadyExists => "ROW_ALREADY_EXISTS",
            Self::RowDoesNotExist => "ROW_DOES_NOT_EXIST",
        }
    }
}

impl fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_codes_map_to_causes() {
        assert_eq!(
            ConflictCause::from_engine_error(EngineErrorCode::ConflictFnViolation),
            Some(ConflictCause::RowInConflict)
        );
        assert_eq!(
            ConflictCause::from_engine_error(EngineErrorCode::DuplicateKey),
            Some(ConflictCause::RowAlreadyExists)
        );
        assert_eq!(
            ConflictCause::from_engine_error(EngineErrorCode::RowNotFound),
            Some(ConflictCause::RowDoesNotExist)
        );
    }

    #[test]
    fn test_other_codes_are_not_conflicts() {
        assert_eq!(ConflictCause::from_engine_error(EngineErrorCode::OpAfterRefresh), None);
        assert_eq!(ConflictCause::from_engine_error(EngineErrorCode::Temporary(266)), None);
        assert_eq!(ConflictCause::from_engine_error(EngineErrorCode::Permanent(4000)), None);
    }

    #[test]
    fn test_cause_names() {
        assert_eq!(ConflictCause::RowInConflict.to_string(), "ROW_IN_CONFLICT");
        assert_eq!(ConflictCause::RowAlreadyExists.as_str(), "ROW_ALREADY_EXISTS");
        assert_eq!(ConflictCause::RowDoesNotExist.as_str(), "ROW_DOES_NOT_EXIST");
    }
}
