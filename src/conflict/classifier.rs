//! Conflict Error Classifier
//!
//! Decides what a failed conflict-tagged operation means. The outcome is a
//! pure function of the engine error, the operation's context, the role and
//! the conflict function's flags; counters and remediation follow from it.

use crate::engine::EngineErrorCode;
use crate::observability::{log_event_with_fields, Event};

use super::cause::ConflictCause;
use super::change::OpKind;
use super::errors::{ApplyError, ApplyResult};
use super::exceptions::ExceptionsData;
use super::executor::{ClassifyResult, ConflictHandler, DefineOperation};
use super::remediator::RowRemediator;
use super::role::ConflictRole;
use super::table::TableRegistry;
use super::tracker::ConflictStateTracker;

/// Decision for one failed operation, before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not a conflict: the error stops the applier
    NotAConflict,
    /// Refresh landed on a row already refreshed in this transaction
    RepeatedRefresh,
    /// Conflict on a refresh sent by the peer; the peer's state wins
    RefreshOp,
    /// Reflected operation did not apply; dropped
    ReflectedOpDiscarded,
    /// Secondary of an asymmetric pair waits for the Primary
    SecondaryIgnores,
    /// Delete found no row and the function does not resolve that case
    DeleteDeleteIgnored,
    /// Resolve the conflict
    Resolve(ConflictCause),
}

/// Classify a failed conflict-tagged operation.
pub fn verdict(error: EngineErrorCode, data: &ExceptionsData, role: ConflictRole) -> Verdict {
    if error == EngineErrorCode::OpAfterRefresh {
        return Verdict::RepeatedRefresh;
    }
    let Some(cause) = ConflictCause::from_engine_error(error) else {
        return Verdict::NotAConflict;
    };
    if data.refresh_op {
        return Verdict::RefreshOp;
    }
    if data.reflected_op {
        return Verdict::ReflectedOpDiscarded;
    }
    if role.is_secondary() && data.function.is_asymmetric() {
        return Verdict::SecondaryIgnores;
    }
    if data.kind == OpKind::Delete
        && cause == ConflictCause::RowDoesNotExist
        && !data.function.flags().treats_delete_delete_as_conflict
    {
        return Verdict::DeleteDeleteIgnored;
    }
    Verdict::Resolve(cause)
}

/// `ConflictHandler` resolving conflicts against the applier's state.
pub struct ConflictClassifier<'a> {
    tracker: &'a mut ConflictStateTracker,
    tables: &'a TableRegistry,
}

impl<'a> ConflictClassifier<'a> {
    pub fn new(tracker: &'a mut ConflictStateTracker, tables: &'a TableRegistry) -> Self {
        Self { tracker, tables }
    }

    pub fn classify(
        &mut self,
        error: EngineErrorCode,
        data: &ExceptionsData,
        definer: &mut dyn DefineOperation,
    ) -> ClassifyResult {
        match self.resolve(error, data, definer) {
            Ok(()) => ClassifyResult::Ignored,
            Err(err) => ClassifyResult::Fatal(err),
        }
    }

    fn resolve(
        &mut self,
        error: EngineErrorCode,
        data: &ExceptionsData,
        definer: &mut dyn DefineOperation,
    ) -> ApplyResult<()> {
        let cause = match verdict(error, data, self.tracker.role()) {
            Verdict::NotAConflict => {
                return Err(ApplyError::from_code(
                    error,
                    &format!("applying {} on {}{}", data.kind, data.table, data.key),
                ))
            }
            Verdict::RepeatedRefresh | Verdict::RefreshOp | Verdict::SecondaryIgnores => {
                return Ok(())
            }
            Verdict::ReflectedOpDiscarded => {
                self.tracker.count_reflect_op_discard();
                log_event_with_fields(
                    Event::ReflectedOpDiscarded,
                    &[
                        ("table", data.table.as_str()),
                        ("key", data.key.to_string().as_str()),
                        ("error", error.name()),
                    ],
                );
                return Ok(());
            }
            Verdict::DeleteDeleteIgnored => {
                self.tracker.count_delete_delete();
                self.log_delete_delete(data);
                return Ok(());
            }
            Verdict::Resolve(cause) => cause,
        };

        let delete_delete = data.kind == OpKind::Delete && cause == ConflictCause::RowDoesNotExist;
        if delete_delete {
            self.tracker.count_delete_delete();
            self.log_delete_delete(data);
        }

        let transaction_id = data
            .transaction_id
            .filter(|_| data.function.flags().transactional);
        match transaction_id {
            Some(_) => self
                .tracker
                .count_trans_violation(cause, data.function.name(), delete_delete),
            None => self.tracker.count_violation(cause, data.function.name()),
        }
        log_event_with_fields(
            Event::ConflictDetected,
            &[
                ("table", data.table.as_str()),
                ("key", data.key.to_string().as_str()),
                ("op", data.kind.as_str()),
                ("cause", cause.as_str()),
                ("function", data.function.name()),
            ],
        );

        if let Some(transaction_id) = transaction_id {
            self.tracker.mark_in_conflict(transaction_id);
        }

        let table = self.tables.get(&data.table).ok_or_else(|| {
            ApplyError::invariant_violation(format!(
                "conflict reported on unconfigured table '{}'",
                data.table
            ))
        })?;
        let epoch = self.tracker.require_epoch()?;
        let data = data.clone().with_cause(cause);
        RowRemediator::new(self.tracker.server_id(), epoch).remediate(table, cause, &data, definer)?;
        Ok(())
    }

    fn log_delete_delete(&self, data: &ExceptionsData) {
        log_event_with_fields(
            Event::DeleteDeleteRace,
            &[
                ("table", data.table.as_str()),
                ("key", data.key.to_string().as_str()),
                ("function", data.function.name()),
            ],
        );
    }
}

impl ConflictHandler for ConflictClassifier<'_> {
    fn handle_conflict(
        &mut self,
        error: EngineErrorCode,
        data: &ExceptionsData,
        definer: &mut dyn DefineOperation,
    ) -> ClassifyResult {
        self.classify(error, data, definer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{
        ApplyErrorKind, BatchExecutor, ChangeRecord, ConflictFunction, EpochInfo, OperationTag,
        RowImage, RowKey, TableDef, Value,
    };
    use crate::engine::MemoryEngine;

    fn data(function: ConflictFunction, change: ChangeRecord) -> ExceptionsData {
        ExceptionsData::from_change(&change, &function)
    }

    fn update() -> ChangeRecord {
        let image = RowImage::new().with("ts", Value::Int(1));
        ChangeRecord::update("t1", RowKey::int(1), image.clone(), image)
    }

    fn delete() -> ChangeRecord {
        ChangeRecord::delete("t1", RowKey::int(1), RowImage::new().with("ts", Value::Int(1)))
    }

    fn setup(
        role: ConflictRole,
        function: ConflictFunction,
    ) -> (ConflictStateTracker, TableRegistry, BatchExecutor<MemoryEngine>) {
        let mut tracker = ConflictStateTracker::new(1, role);
        tracker
            .begin_epoch(EpochInfo {
                origin_server_id: 2,
                origin_epoch: 3,
            })
            .unwrap();
        let tables = TableRegistry::from_defs(&[TableDef::new("t1")
            .with_function(function)
            .with_default_exceptions()])
        .unwrap();
        (tracker, tables, BatchExecutor::new(MemoryEngine::new()))
    }

    // =========================================================================
    // Verdicts
    // =========================================================================

    #[test]
    fn test_verdict_maps_causes() {
        let d = data(ConflictFunction::Old { column: "ts".into() }, update());
        assert_eq!(
            verdict(EngineErrorCode::ConflictFnViolation, &d, ConflictRole::None),
            Verdict::Resolve(ConflictCause::RowInConflict)
        );
        assert_eq!(
            verdict(EngineErrorCode::DuplicateKey, &d, ConflictRole::None),
            Verdict::Resolve(ConflictCause::RowAlreadyExists)
        );
        assert_eq!(
            verdict(EngineErrorCode::RowNotFound, &d, ConflictRole::None),
            Verdict::Resolve(ConflictCause::RowDoesNotExist)
        );
        assert_eq!(
            verdict(EngineErrorCode::Permanent(4000), &d, ConflictRole::None),
            Verdict::NotAConflict
        );
        assert_eq!(
            verdict(EngineErrorCode::OpAfterRefresh, &d, ConflictRole::None),
            Verdict::RepeatedRefresh
        );
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let d = data(ConflictFunction::EpochTrans, delete());
        let first = verdict(EngineErrorCode::RowNotFound, &d, ConflictRole::Primary);
        for _ in 0..10 {
            assert_eq!(verdict(EngineErrorCode::RowNotFound, &d, ConflictRole::Primary), first);
        }
    }

    #[test]
    fn test_verdict_delete_delete_policy_per_function() {
        let plain = data(ConflictFunction::Epoch, delete());
        assert_eq!(
            verdict(EngineErrorCode::RowNotFound, &plain, ConflictRole::Primary),
            Verdict::DeleteDeleteIgnored
        );
        let trans = data(ConflictFunction::EpochTrans, delete());
        assert_eq!(
            verdict(EngineErrorCode::RowNotFound, &trans, ConflictRole::Primary),
            Verdict::Resolve(ConflictCause::RowDoesNotExist)
        );
    }

    #[test]
    fn test_verdict_secondary_and_reflected() {
        let d = data(ConflictFunction::Epoch2, update());
        assert_eq!(
            verdict(EngineErrorCode::ConflictFnViolation, &d, ConflictRole::Secondary),
            Verdict::SecondaryIgnores
        );
        let reflected = data(ConflictFunction::Epoch2, update().reflected());
        assert_eq!(
            verdict(EngineErrorCode::ConflictFnViolation, &reflected, ConflictRole::Secondary),
            Verdict::ReflectedOpDiscarded
        );
        let refresh = data(ConflictFunction::Epoch2, update().refresh());
        assert_eq!(
            verdict(EngineErrorCode::RowNotFound, &refresh, ConflictRole::Primary),
            Verdict::RefreshOp
        );
    }

    // =========================================================================
    // Side effects
    // =========================================================================

    #[test]
    fn test_conflict_counted_and_remediated() {
        let function = ConflictFunction::Old { column: "ts".into() };
        let (mut tracker, tables, mut executor) = setup(ConflictRole::None, function.clone());
        let d = data(function, update());

        let result = ConflictClassifier::new(&mut tracker, &tables).classify(
            EngineErrorCode::ConflictFnViolation,
            &d,
            &mut executor,
        );
        assert_eq!(result, ClassifyResult::Ignored);
        assert_eq!(tracker.state().current.violation_count.row_in_conflict, 1);
        assert_eq!(tracker.state().current.violations_by_function["NDB$OLD"], 1);
        assert_eq!(executor.tag(1), Some(&OperationTag::Refresh));
        assert_eq!(executor.tag(2), Some(&OperationTag::Exception));
    }

    #[test]
    fn test_transactional_conflict_marks_transaction() {
        let (mut tracker, tables, mut executor) =
            setup(ConflictRole::Primary, ConflictFunction::EpochTrans);
        let d = data(ConflictFunction::EpochTrans, update().with_transaction(42));

        ConflictClassifier::new(&mut tracker, &tables).classify(
            EngineErrorCode::ConflictFnViolation,
            &d,
            &mut executor,
        );
        assert!(tracker.is_in_conflict(42));
        assert_eq!(tracker.state().current.trans_row_conflict_count, 1);
        assert_eq!(tracker.state().current.trans_conflict_count, 1);
    }

    #[test]
    fn test_delete_delete_counted_without_refresh() {
        let (mut tracker, tables, mut executor) =
            setup(ConflictRole::Primary, ConflictFunction::Epoch);
        let d = data(ConflictFunction::Epoch, delete());

        let result = ConflictClassifier::new(&mut tracker, &tables).classify(
            EngineErrorCode::RowNotFound,
            &d,
            &mut executor,
        );
        assert_eq!(result, ClassifyResult::Ignored);
        assert_eq!(tracker.state().current.delete_delete_count, 1);
        assert_eq!(tracker.state().current.violation_count.sum(), 0);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_reflected_discard_counted() {
        let (mut tracker, tables, mut executor) =
            setup(ConflictRole::Secondary, ConflictFunction::Epoch2);
        let d = data(ConflictFunction::Epoch2, update().reflected());

        let result = ConflictClassifier::new(&mut tracker, &tables).classify(
            EngineErrorCode::ConflictFnViolation,
            &d,
            &mut executor,
        );
        assert_eq!(result, ClassifyResult::Ignored);
        assert_eq!(tracker.state().current.reflect_op_discard_count, 1);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_non_conflict_error_is_fatal() {
        let (mut tracker, tables, mut executor) =
            setup(ConflictRole::Primary, ConflictFunction::Epoch);
        let d = data(ConflictFunction::Epoch, update());

        let result = ConflictClassifier::new(&mut tracker, &tables).classify(
            EngineErrorCode::Permanent(4000),
            &d,
            &mut executor,
        );
        let ClassifyResult::Fatal(err) = result else {
            panic!("expected Fatal, got {:?}", result);
        };
        assert_eq!(err.kind, ApplyErrorKind::Engine);
        assert_eq!(tracker.state().current.violation_count.sum(), 0);
    }

    #[test]
    fn test_blob_refresh_is_fatal() {
        let mut tracker = ConflictStateTracker::new(1, ConflictRole::Primary);
        tracker
            .begin_epoch(EpochInfo {
                origin_server_id: 2,
                origin_epoch: 3,
            })
            .unwrap();
        let tables = TableRegistry::from_defs(&[TableDef::new("t1")
            .with_function(ConflictFunction::Epoch)
            .with_blob_columns(&["doc"])])
        .unwrap();
        let mut executor = BatchExecutor::new(MemoryEngine::new());
        let d = data(ConflictFunction::Epoch, update());

        let result = ConflictClassifier::new(&mut tracker, &tables).classify(
            EngineErrorCode::ConflictFnViolation,
            &d,
            &mut executor,
        );
        let ClassifyResult::Fatal(err) = result else {
            panic!("expected Fatal, got {:?}", result);
        };
        assert_eq!(err.kind, ApplyErrorKind::UnsupportedRefresh);
    }
}
