//! Conflict Functions
//!
//! A conflict function is the per-table algorithm that decides how conflicts
//! are detected and resolved. The set is closed: each variant carries its
//! policy flags as data and builds its check program with a pure function,
//! so adding an algorithm is an exhaustive-match error everywhere it must be
//! handled.
//!
//! Symmetric functions (MAX, MAX_DELETE_WIN, OLD) compare column values and
//! run the same way on both clusters. Asymmetric functions (the EPOCH
//! family) compare the row's local commit epoch against the highest epoch
//! the peer is known to have applied, and need an explicit role.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::change::{OpKind, RowImage, Value};
use super::errors::{ApplyError, ApplyResult};
use super::program::{CheckInstruction, CheckProgram};

/// Policy flags of a conflict function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictFlags {
    /// Conflicts mark the whole origin transaction as in conflict.
    pub transactional: bool,
    /// Behavior depends on the configured conflict role.
    pub uses_role_variable: bool,
    /// Primary reflects applied secondary operations back to the Secondary.
    pub reflects_secondary_ops: bool,
    /// A delete finding no row is resolved like any other conflict.
    pub treats_delete_delete_as_conflict: bool,
    /// Every conflict refreshes the row, whatever its cause.
    pub always_refresh_rows: bool,
}

/// Per-table conflict detection algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConflictFunction {
    /// Update wins if its timestamp column is greater than the stored one.
    Max { column: String },
    /// As `Max`, but deletes always win.
    MaxDeleteWin { column: String },
    /// Change applies only if the stored column still holds the before value.
    Old { column: String },
    /// Primary detects rows changed locally since the peer's last applied epoch.
    Epoch,
    /// `Epoch` with whole-transaction conflict tracking.
    EpochTrans,
    /// `Epoch` plus reflection of secondary operations.
    Epoch2,
    /// `Epoch2` with whole-transaction conflict tracking.
    Epoch2Trans,
}

/// Inputs to check-program construction.
#[derive(Debug, Clone, Copy)]
pub struct CheckInput<'a> {
    pub kind: OpKind,
    pub before: Option<&'a RowImage>,
    pub after: Option<&'a RowImage>,
    pub write_set: &'a [String],
    /// Highest local epoch the peer is known to have applied.
    pub max_replicated_epoch: u64,
}

impl ConflictFunction {
    /// Configuration name of the function.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Max { .. } => "NDB$MAX",
            Self::MaxDeleteWin { .. } => "NDB$MAX_DELETE_WIN",
            Self::Old { .. } => "NDB$OLD",
            Self::Epoch => "NDB$EPOCH",
            Self::EpochTrans => "NDB$EPOCH_TRANS",
            Self::Epoch2 => "NDB$EPOCH2",
            Self::Epoch2Trans => "NDB$EPOCH2_TRANS",
        }
    }

    pub fn flags(&self) -> ConflictFlags {
        match self {
            Self::Max { .. } | Self::MaxDeleteWin { .. } | Self::Old { .. } => {
                ConflictFlags::default()
            }
            Self::Epoch => ConflictFlags {
                uses_role_variable: true,
                always_refresh_rows: true,
                ..Default::default()
            },
            Self::EpochTrans => ConflictFlags {
                transactional: true,
                uses_role_variable: true,
                treats_delete_delete_as_conflict: true,
                always_refresh_rows: true,
                ..Default::default()
            },
            Self::Epoch2 => ConflictFlags {
                uses_role_variable: true,
                reflects_secondary_ops: true,
                always_refresh_rows: true,
                ..Default::default()
            },
            Self::Epoch2Trans => ConflictFlags {
                transactional: true,
                uses_role_variable: true,
                reflects_secondary_ops: true,
                treats_delete_delete_as_conflict: true,
                always_refresh_rows: true,
            },
        }
    }

    /// Column argument of the value-comparing functions.
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Max { column } | Self::MaxDeleteWin { column } | Self::Old { column } => {
                Some(column)
            }
            Self::Epoch | Self::EpochTrans | Self::Epoch2 | Self::Epoch2Trans => None,
        }
    }

    pub fn is_asymmetric(&self) -> bool {
        self.flags().uses_role_variable
    }

    /// Build the check program for a change.
    ///
    /// Inserts never get a program: there is no prior row to check against.
    pub fn build_check(&self, input: CheckInput<'_>) -> ApplyResult<Option<CheckProgram>> {
        if input.kind == OpKind::Insert {
            return Ok(None);
        }

        let program = match self {
            Self::Max { column } => match input.kind {
                OpKind::Update => Some(less_than_after(column, input)?),
                OpKind::Delete => Some(equals_before(column, input)?),
                _ => None,
            },
            Self::MaxDeleteWin { column } => match input.kind {
                OpKind::Update => Some(less_than_after(column, input)?),
                _ => None,
            },
            Self::Old { column } => match input.kind {
                OpKind::Update | OpKind::Delete => Some(equals_before(column, input)?),
                _ => None,
            },
            Self::Epoch | Self::EpochTrans | Self::Epoch2 | Self::Epoch2Trans => {
                Some(CheckProgram::new().push(CheckInstruction::RowEpochAtMost {
                    epoch: input.max_replicated_epoch,
                }))
            }
        };

        Ok(program)
    }

    /// Check program for an operation the Primary reflected back.
    ///
    /// The reflected operation only lands if the stored row was last written
    /// by replication; a later local write will reach the Primary on its own.
    pub fn reflected_check(kind: OpKind) -> Option<CheckProgram> {
        match kind {
            OpKind::Insert => None,
            OpKind::Update | OpKind::Delete | OpKind::Read => {
                Some(CheckProgram::new().push(CheckInstruction::AuthorIsReplica))
            }
        }
    }
}

fn image_value(
    image: Option<&RowImage>,
    column: &str,
    which: &str,
    kind: OpKind,
) -> ApplyResult<Value> {
    image
        .and_then(|image| image.get(column))
        .cloned()
        .ok_or_else(|| {
            ApplyError::malformed_event(format!(
                "{} {}-image lacks conflict column '{}'",
                kind, which, column
            ))
        })
}

fn less_than_after(column: &str, input: CheckInput<'_>) -> ApplyResult<CheckProgram> {
    let value = image_value(input.after, column, "after", input.kind)?;
    Ok(CheckProgram::new().push(CheckInstruction::ColumnLessThan {
        column: column.to_string(),
        value,
    }))
}

fn equals_before(column: &str, input: CheckInput<'_>) -> ApplyResult<CheckProgram> {
    let value = image_value(input.before, column, "before", input.kind)?;
    Ok(CheckProgram::new().push(CheckInstruction::ColumnEquals {
        column: column.to_string(),
        value,
    }))
}

impl fmt::Display for ConflictFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.column().unwrap_or(""))
    }
}

impl FromStr for ConflictFunction {
    type Err = ApplyError;

    /// Parse `NAME(arg)`, e.g. `NDB$MAX(ts)` or `NDB$EPOCH2()`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, arg) = match s.find('(') {
            Some(open) => {
                let rest = &s[open + 1..];
                let close = rest.rfind(')').ok_or_else(|| {
                    ApplyError::configuration(format!("conflict function '{}' lacks ')'", s))
                })?;
                if !rest[close + 1..].trim().is_empty() {
                    return Err(ApplyError::configuration(format!(
                        "trailing characters after conflict function '{}'",
                        s
                    )));
                }
                (s[..open].trim(), rest[..close].trim())
            }
            None => (s, ""),
        };

        let column = || -> ApplyResult<String> {
            if arg.is_empty() || arg.contains(',') {
                return Err(ApplyError::configuration(format!(
                    "conflict function {} takes exactly one column argument",
                    name
                )));
            }
            Ok(arg.to_string())
        };
        let no_args = |function: ConflictFunction| -> ApplyResult<ConflictFunction> {
            // An optional numeric argument (extra GCI bits) is accepted and ignored.
            if !arg.is_empty() && arg.parse::<u32>().is_err() {
                return Err(ApplyError::configuration(format!(
                    "conflict function {} takes no column argument",
                    name
                )));
            }
            Ok(function)
        };

        match name.to_ascii_uppercase().as_str() {
            "NDB$MAX" => Ok(Self::Max { column: column()? }),
            "NDB$MAX_DELETE_WIN" => Ok(Self::MaxDeleteWin { column: column()? }),
            "NDB$OLD" => Ok(Self::Old { column: column()? }),
            "NDB$EPOCH" => no_args(Self::Epoch),
            "NDB$EPOCH_TRANS" => no_args(Self::EpochTrans),
            "NDB$EPOCH2" => no_args(Self::Epoch2),
            "NDB$EPOCH2_TRANS" => no_args(Self::Epoch2Trans),
            other => Err(ApplyError::configuration(format!(
                "unknown conflict function '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ConflictFunction {
    type Error = ApplyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConflictFunction> for String {
    fn from(function: ConflictFunction) -> Self {
        function.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(ts: i64) -> RowImage {
        RowImage::new().with("ts", Value::Int(ts))
    }

    fn input<'a>(
        kind: OpKind,
        before: Option<&'a RowImage>,
        after: Option<&'a RowImage>,
    ) -> CheckInput<'a> {
        CheckInput {
            kind,
            before,
            after,
            write_set: &[],
            max_replicated_epoch: 12,
        }
    }

    #[test]
    fn test_parse_functions() {
        assert_eq!(
            "NDB$MAX(ts)".parse::<ConflictFunction>().unwrap(),
            ConflictFunction::Max { column: "ts".into() }
        );
        assert_eq!(
            "NDB$OLD( ts )".parse::<ConflictFunction>().unwrap(),
            ConflictFunction::Old { column: "ts".into() }
        );
        assert_eq!(
            "ndb$max_delete_win(ts)".parse::<ConflictFunction>().unwrap(),
            ConflictFunction::MaxDeleteWin { column: "ts".into() }
        );
        assert_eq!("NDB$EPOCH()".parse::<ConflictFunction>().unwrap(), ConflictFunction::Epoch);
        assert_eq!(
            "NDB$EPOCH_TRANS(32)".parse::<ConflictFunction>().unwrap(),
            ConflictFunction::EpochTrans
        );
        assert_eq!("NDB$EPOCH2".parse::<ConflictFunction>().unwrap(), ConflictFunction::Epoch2);
        assert_eq!(
            "NDB$EPOCH2_TRANS()".parse::<ConflictFunction>().unwrap(),
            ConflictFunction::Epoch2Trans
        );
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!("NDB$MAX()".parse::<ConflictFunction>().is_err());
        assert!("NDB$MAX(a,b)".parse::<ConflictFunction>().is_err());
        assert!("NDB$EPOCH(ts)".parse::<ConflictFunction>().is_err());
        assert!("NDB$MAX(ts".parse::<ConflictFunction>().is_err());
        assert!("NDB$NEWEST(ts)".parse::<ConflictFunction>().is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let function = ConflictFunction::Old { column: "ts".into() };
        assert_eq!(function.to_string(), "NDB$OLD(ts)");
        assert_eq!(function.to_string().parse::<ConflictFunction>().unwrap(), function);
        assert_eq!(ConflictFunction::Epoch2.to_string(), "NDB$EPOCH2()");
    }

    #[test]
    fn test_flags() {
        let max = ConflictFunction::Max { column: "ts".into() }.flags();
        assert!(!max.transactional && !max.uses_role_variable && !max.always_refresh_rows);

        let epoch = ConflictFunction::Epoch.flags();
        assert!(epoch.uses_role_variable && epoch.always_refresh_rows);
        assert!(!epoch.treats_delete_delete_as_conflict);

        let trans = ConflictFunction::EpochTrans.flags();
        assert!(trans.transactional && trans.treats_delete_delete_as_conflict);

        let epoch2 = ConflictFunction::Epoch2.flags();
        assert!(epoch2.reflects_secondary_ops && !epoch2.transactional);

        let epoch2_trans = ConflictFunction::Epoch2Trans.flags();
        assert!(epoch2_trans.reflects_secondary_ops && epoch2_trans.transactional);
    }

    #[test]
    fn test_insert_never_gets_a_program() {
        let after = image(5);
        for function in [
            ConflictFunction::Max { column: "ts".into() },
            ConflictFunction::Old { column: "ts".into() },
            ConflictFunction::Epoch,
        ] {
            let program = function
                .build_check(input(OpKind::Insert, None, Some(&after)))
                .unwrap();
            assert!(program.is_none());
        }
    }

    #[test]
    fn test_max_update_compares_after_image() {
        let (before, after) = (image(1), image(5));
        let program = ConflictFunction::Max { column: "ts".into() }
            .build_check(input(OpKind::Update, Some(&before), Some(&after)))
            .unwrap()
            .unwrap();
        assert_eq!(
            program.instructions(),
            &[CheckInstruction::ColumnLessThan {
                column: "ts".into(),
                value: Value::Int(5)
            }]
        );
    }

    #[test]
    fn test_max_delete_compares_before_image() {
        let before = image(3);
        let program = ConflictFunction::Max { column: "ts".into() }
            .build_check(input(OpKind::Delete, Some(&before), None))
            .unwrap()
            .unwrap();
        assert_eq!(
            program.instructions(),
            &[CheckInstruction::ColumnEquals {
                column: "ts".into(),
                value: Value::Int(3)
            }]
        );
    }

    #[test]
    fn test_max_delete_win_does_not_check_deletes() {
        let before = image(3);
        let program = ConflictFunction::MaxDeleteWin { column: "ts".into() }
            .build_check(input(OpKind::Delete, Some(&before), None))
            .unwrap();
        assert!(program.is_none());
    }

    #[test]
    fn test_old_update_compares_before_image() {
        let (before, after) = (image(1), image(5));
        let program = ConflictFunction::Old { column: "ts".into() }
            .build_check(input(OpKind::Update, Some(&before), Some(&after)))
            .unwrap()
            .unwrap();
        assert_eq!(
            program.instructions(),
            &[CheckInstruction::ColumnEquals {
                column: "ts".into(),
                value: Value::Int(1)
            }]
        );
    }

    #[test]
    fn test_missing_conflict_column_is_malformed() {
        let before = RowImage::new();
        let err = ConflictFunction::Old { column: "ts".into() }
            .build_check(input(OpKind::Delete, Some(&before), None))
            .unwrap_err();
        assert!(err.message.contains("ts"));
    }

    #[test]
    fn test_epoch_program_uses_max_replicated_epoch() {
        let before = image(1);
        let program = ConflictFunction::EpochTrans
            .build_check(input(OpKind::Delete, Some(&before), None))
            .unwrap()
            .unwrap();
        assert_eq!(
            program.instructions(),
            &[CheckInstruction::RowEpochAtMost { epoch: 12 }]
        );
    }

    #[test]
    fn test_reflected_check() {
        assert!(ConflictFunction::reflected_check(OpKind::Insert).is_none());
        assert_eq!(
            ConflictFunction::reflected_check(OpKind::Update)
                .unwrap()
                .instructions(),
            &[CheckInstruction::AuthorIsReplica]
        );
    }

    #[test]
    fn test_serde_uses_function_string() {
        let json = serde_json::to_string(&ConflictFunction::Max { column: "ts".into() }).unwrap();
        assert_eq!(json, "\"NDB$MAX(ts)\"");
        let parsed: ConflictFunction = serde_json::from_str("\"NDB$EPOCH2_TRANS()\"").unwrap();
        assert_eq!(parsed, ConflictFunction::Epoch2Trans);
    }
}
