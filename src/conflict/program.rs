//! Interpreted Conflict Check Programs
//!
//! A check program is attached to an update, delete or read before it is
//! handed to the engine. The engine runs it against the row it currently
//! holds and fails the operation with a conflict-specific code if any
//! instruction does not hold. Programs are plain data so they can be built
//! by pure functions and compared in tests.

use std::cmp::Ordering;

use super::change::{RowImage, Value};

/// A single check against the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInstruction {
    /// Stored column must equal the given value.
    ColumnEquals { column: String, value: Value },
    /// Stored column must be strictly less than the given value.
    ColumnLessThan { column: String, value: Value },
    /// Row must not have been committed locally after the given epoch.
    RowEpochAtMost { epoch: u64 },
    /// Row must have been last written by the replication applier, not by a
    /// local client.
    AuthorIsReplica,
}

/// Engine-maintained hidden attributes of a stored row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowMeta {
    /// Local epoch in which the row was last committed.
    pub commit_epoch: u64,
    /// Last writer was the replication applier.
    pub replicated: bool,
}

impl CheckInstruction {
    fn holds(&self, row: &RowImage, meta: &RowMeta) -> bool {
        match self {
            CheckInstruction::ColumnEquals { column, value } => {
                row.get(column).map_or(false, |stored| stored == value)
            }
            CheckInstruction::ColumnLessThan { column, value } => row
                .get(column)
                .and_then(|stored| stored.compare(value))
                .map_or(false, |ord| ord == Ordering::Less),
            CheckInstruction::RowEpochAtMost { epoch } => meta.commit_epoch <= *epoch,
            CheckInstruction::AuthorIsReplica => meta.replicated,
        }
    }
}

/// An interpreted program; every instruction must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckProgram {
    instructions: Vec<CheckInstruction>,
}

impl CheckProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, instruction: CheckInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn instructions(&self) -> &[CheckInstruction] {
        &self.instructions
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Run the program against the stored row and its hidden attributes.
    pub fn passes(&self, row: &RowImage, meta: &RowMeta) -> bool {
        self.instructions
            .iter()
            .all(|instruction| instruction.holds(row, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(commit_epoch: u64) -> RowMeta {
        RowMeta {
            commit_epoch,
            replicated: false,
        }
    }

    fn row(ts: i64) -> RowImage {
        RowImage::new().with("ts", Value::Int(ts)).with("v", Value::Text("x".into()))
    }

    #[test]
    fn test_empty_program_passes() {
        assert!(CheckProgram::new().passes(&row(1), &meta(100)));
    }

    #[test]
    fn test_column_equals() {
        let program = CheckProgram::new().push(CheckInstruction::ColumnEquals {
            column: "ts".into(),
            value: Value::Int(5),
        });
        assert!(program.passes(&row(5), &meta(0)));
        assert!(!program.passes(&row(6), &meta(0)));
    }

    #[test]
    fn test_column_less_than() {
        let program = CheckProgram::new().push(CheckInstruction::ColumnLessThan {
            column: "ts".into(),
            value: Value::Int(10),
        });
        assert!(program.passes(&row(9), &meta(0)));
        assert!(!program.passes(&row(10), &meta(0)));
        assert!(!program.passes(&row(11), &meta(0)));
    }

    #[test]
    fn test_missing_column_fails() {
        let program = CheckProgram::new().push(CheckInstruction::ColumnEquals {
            column: "missing".into(),
            value: Value::Null,
        });
        assert!(!program.passes(&row(1), &meta(0)));
    }

    #[test]
    fn test_type_mismatch_fails_less_than() {
        let program = CheckProgram::new().push(CheckInstruction::ColumnLessThan {
            column: "v".into(),
            value: Value::Int(10),
        });
        assert!(!program.passes(&row(1), &meta(0)));
    }

    #[test]
    fn test_row_epoch_at_most() {
        let program = CheckProgram::new().push(CheckInstruction::RowEpochAtMost { epoch: 7 });
        assert!(program.passes(&row(1), &meta(7)));
        assert!(!program.passes(&row(1), &meta(8)));
    }

    #[test]
    fn test_author_is_replica() {
        let program = CheckProgram::new().push(CheckInstruction::AuthorIsReplica);
        let replicated = RowMeta {
            commit_epoch: 1,
            replicated: true,
        };
        assert!(program.passes(&row(1), &replicated));
        assert!(!program.passes(&row(1), &meta(1)));
    }

    #[test]
    fn test_all_instructions_must_hold() {
        let program = CheckProgram::new()
            .push(CheckInstruction::ColumnEquals {
                column: "ts".into(),
                value: Value::Int(1),
            })
            .push(CheckInstruction::RowEpochAtMost { epoch: 3 });
        assert!(program.passes(&row(1), &meta(3)));
        assert!(!program.passes(&row(1), &meta(4)));
        assert!(!program.passes(&row(2), &meta(3)));
    }
}
