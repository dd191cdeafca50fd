//! Conflict Preparer
//!
//! Turns one remote change into an engine operation before it is defined:
//! - Tables without a conflict function get a plain operation
//! - Rows of a transaction already in conflict are remediated on the spot
//!   and never applied; so are rows written after a conflicting
//!   transaction's write to the same key, whose transaction is marked too
//! - Everything else gets a conflict-tagged operation, usually carrying a
//!   check program so the engine itself rejects the write when the local
//!   row has moved on

use crate::engine::{OpSeq, OperationBody, OperationKind};
use crate::observability::{log_event_with_fields, Event};

use super::cause::ConflictCause;
use super::change::{ChangeRecord, OpKind, Value};
use super::errors::{ApplyError, ApplyResult};
use super::exceptions::ExceptionsData;
use super::executor::{DefineOperation, OperationTag, PendingOperation};
use super::function::{CheckInput, ConflictFunction};
use super::remediator::RowRemediator;
use super::role::ConflictRole;
use super::table::{TableDef, APPLY_STATUS_TABLE};
use super::tracker::ConflictStateTracker;

/// Result of preparing one change.
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareOutcome {
    /// Operation defined into the current batch
    Defined {
        seq: OpSeq,
        uses_forced_overwrite: bool,
    },
    /// Change discarded; its row was remediated instead
    HandledImmediately,
    /// Change cannot be applied
    Rejected(ApplyError),
}

/// Prepares remote changes against the tracker's current state.
pub struct ConflictPreparer<'a> {
    tracker: &'a mut ConflictStateTracker,
}

impl<'a> ConflictPreparer<'a> {
    pub fn new(tracker: &'a mut ConflictStateTracker) -> Self {
        Self { tracker }
    }

    pub fn prepare(
        &mut self,
        change: &ChangeRecord,
        table: Option<&TableDef>,
        definer: &mut dyn DefineOperation,
    ) -> PrepareOutcome {
        match self.try_prepare(change, table, definer) {
            Ok(outcome) => outcome,
            Err(err) => PrepareOutcome::Rejected(err),
        }
    }

    fn try_prepare(
        &mut self,
        change: &ChangeRecord,
        table: Option<&TableDef>,
        definer: &mut dyn DefineOperation,
    ) -> ApplyResult<PrepareOutcome> {
        change.validate()?;

        if change.table == APPLY_STATUS_TABLE {
            self.observe_apply_status(change)?;
            return define_plain(change, OperationKind::Write, definer);
        }

        let Some((table, function)) =
            table.and_then(|t| t.conflict_function.as_ref().map(|f| (t, f)))
        else {
            return define_plain(change, natural_kind(change), definer);
        };
        let flags = function.flags();

        if flags.transactional {
            if let Some(transaction_id) = change.origin.transaction_id {
                if self.tracker.is_in_conflict(transaction_id) {
                    return self.reject_row(change, table, function, transaction_id, definer);
                }
                if self
                    .tracker
                    .follows_conflicting_writer(&change.table, &change.key, transaction_id)
                {
                    self.tracker
                        .record_row(&change.table, &change.key, transaction_id);
                    self.tracker.mark_in_conflict(transaction_id);
                    return self.reject_row(change, table, function, transaction_id, definer);
                }
            }
        }

        let role = self.tracker.role();
        if flags.uses_role_variable {
            match role {
                ConflictRole::None => {
                    return Err(ApplyError::configuration(format!(
                        "table '{}' uses {} which requires a conflict role",
                        table.name,
                        function.name()
                    )))
                }
                ConflictRole::Pass => {
                    return define_plain(change, natural_kind(change), definer);
                }
                ConflictRole::Primary | ConflictRole::Secondary => {}
            }
        }

        if change.origin.refresh() {
            self.tracker.count_refresh_op();
        }

        let mut op = PendingOperation::new(&change.table, natural_kind(change), change.key.clone())
            .with_body(body(change));
        let mut uses_forced_overwrite = false;

        if flags.reflects_secondary_ops && role.is_secondary() {
            if change.origin.reflected() {
                self.tracker.count_reflect_op_prepare();
                op = op.with_check(ConflictFunction::reflected_check(change.effective_kind()));
            } else {
                op.kind = forced_kind(change.effective_kind());
                uses_forced_overwrite = true;
            }
        } else if !(function.is_asymmetric() && role.is_secondary()) {
            let check = function.build_check(CheckInput {
                kind: change.effective_kind(),
                before: change.before.as_ref(),
                after: change.after.as_ref(),
                write_set: &change.write_set,
                max_replicated_epoch: self.tracker.state().max_replicated_epoch,
            })?;
            op = op.with_check(check);
            if flags.reflects_secondary_ops && role.is_primary() {
                op = op.reflecting();
            }
        }

        if flags.transactional {
            if let Some(transaction_id) = change.origin.transaction_id {
                self.tracker
                    .record_row(&change.table, &change.key, transaction_id);
            }
        }

        let data = ExceptionsData::from_change(change, function);
        let seq = definer.define_operation(op.tagged(OperationTag::Conflict(Box::new(data))))?;
        Ok(PrepareOutcome::Defined {
            seq,
            uses_forced_overwrite,
        })
    }

    /// Remediate a row of a transaction already in conflict instead of
    /// applying it.
    fn reject_row(
        &mut self,
        change: &ChangeRecord,
        table: &TableDef,
        function: &ConflictFunction,
        transaction_id: u64,
        definer: &mut dyn DefineOperation,
    ) -> ApplyResult<PrepareOutcome> {
        let epoch = self.tracker.require_epoch()?;
        let cause = ConflictCause::RowInConflict;
        let data = ExceptionsData::from_change(change, function).with_cause(cause);

        RowRemediator::new(self.tracker.server_id(), epoch).remediate(table, cause, &data, definer)?;
        self.tracker.count_trans_row_reject();
        log_event_with_fields(
            Event::TransactionRowRejected,
            &[
                ("table", table.name.as_str()),
                ("key", change.key.to_string().as_str()),
                ("transaction_id", transaction_id.to_string().as_str()),
                ("op", data.kind.as_str()),
            ],
        );
        Ok(PrepareOutcome::HandledImmediately)
    }

    fn observe_apply_status(&mut self, change: &ChangeRecord) -> ApplyResult<()> {
        let Some(after) = change.after.as_ref() else {
            return Ok(());
        };
        let column = |name: &str| -> ApplyResult<u64> {
            match after.get(name) {
                Some(Value::Int(v)) if *v >= 0 => Ok(*v as u64),
                other => Err(ApplyError::malformed_event(format!(
                    "{} row has invalid '{}': {:?}",
                    APPLY_STATUS_TABLE, name, other
                ))),
            }
        };
        let server_id = u32::try_from(column("server_id")?).map_err(|_| {
            ApplyError::malformed_event(format!("{} server_id out of range", APPLY_STATUS_TABLE))
        })?;
        let epoch = column("epoch")?;
        self.tracker.observe_apply_status(server_id, epoch);
        Ok(())
    }
}

fn define_plain(
    change: &ChangeRecord,
    kind: OperationKind,
    definer: &mut dyn DefineOperation,
) -> ApplyResult<PrepareOutcome> {
    let op = PendingOperation::new(&change.table, kind, change.key.clone()).with_body(body(change));
    let seq = definer.define_operation(op)?;
    Ok(PrepareOutcome::Defined {
        seq,
        uses_forced_overwrite: kind == OperationKind::Write,
    })
}

fn body(change: &ChangeRecord) -> OperationBody {
    match &change.after {
        Some(after) => OperationBody::Row(after.clone()),
        None => OperationBody::Empty,
    }
}

fn natural_kind(change: &ChangeRecord) -> OperationKind {
    match change.effective_kind() {
        OpKind::Insert => OperationKind::Insert,
        OpKind::Update => OperationKind::Update,
        OpKind::Delete => OperationKind::Delete,
        OpKind::Read => OperationKind::Read,
    }
}

/// Operation that cannot fail on the row's presence or absence.
fn forced_kind(kind: OpKind) -> OperationKind {
    match kind {
        OpKind::Insert | OpKind::Update => OperationKind::Write,
        OpKind::Delete => OperationKind::Delete,
        OpKind::Read => OperationKind::Read,
    }
}
