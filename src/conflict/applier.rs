//! Applier Context
//!
//! The single applier that owns the epoch transaction. For each origin epoch:
//! 1. `begin_epoch`
//! 2. `apply` every change (flushed automatically every `batch_size` ops)
//! 3. `commit_epoch`
//!
//! Temporary errors roll the epoch back and leave the applier ready for a
//! replay of the same epoch. Fatal errors roll back and halt the applier;
//! every later call fails until a new applier is built.

use crate::config::ApplierConfig;
use crate::engine::Engine;
use crate::observability::{log_event_with_fields, Event};

use super::change::{ChangeRecord, RawChangeEvent};
use super::classifier::ConflictClassifier;
use super::errors::{ApplyError, ApplyErrorKind, ApplyResult};
use super::executor::BatchExecutor;
use super::preparer::{ConflictPreparer, PrepareOutcome};
use super::role::ConflictRole;
use super::table::TableRegistry;
use super::tracker::{ConflictStateTracker, EpochInfo, StatusHandle};

/// Drives epochs of remote changes through the conflict engine.
pub struct Applier<E: Engine> {
    batch_size: usize,
    tables: TableRegistry,
    tracker: ConflictStateTracker,
    executor: BatchExecutor<E>,
    halted: Option<ApplyError>,
}

impl<E: Engine> Applier<E> {
    pub fn new(config: &ApplierConfig, engine: E) -> ApplyResult<Self> {
        config.validate()?;
        Ok(Self {
            batch_size: config.batch_size,
            tables: config.registry()?,
            tracker: ConflictStateTracker::new(config.server_id, config.role),
            executor: BatchExecutor::new(engine),
            halted: None,
        })
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.tracker.status_handle()
    }

    pub fn role(&self) -> ConflictRole {
        self.tracker.role()
    }

    pub fn tracker(&self) -> &ConflictStateTracker {
        &self.tracker
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    pub fn engine(&self) -> &E {
        self.executor.engine()
    }

    /// Direct engine access, for local writes between epochs.
    pub fn engine_mut(&mut self) -> &mut E {
        self.executor.engine_mut()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// The error that halted the applier.
    pub fn halt_reason(&self) -> Option<&ApplyError> {
        self.halted.as_ref()
    }

    /// Change the conflict role; rejected while an epoch is in flight.
    pub fn set_role(&mut self, role: ConflictRole) -> ApplyResult<()> {
        self.ensure_running()?;
        self.tracker.set_role(role)
    }

    pub fn begin_epoch(&mut self, epoch: EpochInfo) -> ApplyResult<()> {
        self.ensure_running()?;
        if let Err(err) = self.tracker.begin_epoch(epoch) {
            return Err(self.fail(err));
        }
        log_event_with_fields(
            Event::EpochBegin,
            &[
                ("origin_epoch", epoch.origin_epoch.to_string().as_str()),
                ("origin_server_id", epoch.origin_server_id.to_string().as_str()),
                ("applier_id", self.tracker.applier_id().to_string().as_str()),
            ],
        );
        Ok(())
    }

    /// Prepare one change into the current batch.
    pub fn apply(&mut self, change: &ChangeRecord) -> ApplyResult<PrepareOutcome> {
        self.ensure_running()?;
        if let Err(err) = self.tracker.require_epoch() {
            return Err(self.fail(err));
        }

        let table = self.tables.get(&change.table);
        let outcome =
            ConflictPreparer::new(&mut self.tracker).prepare(change, table, &mut self.executor);
        match outcome {
            PrepareOutcome::Rejected(err) => Err(self.fail(err)),
            outcome => {
                if self.executor.pending() >= self.batch_size {
                    self.execute_pending()?;
                }
                Ok(outcome)
            }
        }
    }

    /// Decode and apply a raw change event.
    pub fn apply_event(&mut self, event: RawChangeEvent) -> ApplyResult<PrepareOutcome> {
        self.ensure_running()?;
        match ChangeRecord::from_event(event) {
            Ok(change) => self.apply(&change),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Flush the current batch without committing.
    ///
    /// Returns the number of failed operations that were resolved.
    pub fn execute_pending(&mut self) -> ApplyResult<usize> {
        self.ensure_running()?;
        let result = {
            let mut classifier = ConflictClassifier::new(&mut self.tracker, &self.tables);
            self.executor.execute_no_commit(false, &mut classifier)
        };
        match result {
            Ok(resolved) => {
                self.tracker.publish();
                Ok(resolved)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Flush, then commit the epoch transaction.
    pub fn commit_epoch(&mut self) -> ApplyResult<()> {
        self.execute_pending()?;

        if let Err(err) = self.tracker.prepare_commit() {
            return Err(self.fail(err));
        }

        let result = {
            let mut classifier = ConflictClassifier::new(&mut self.tracker, &self.tables);
            self.executor.execute_commit(true, false, &mut classifier)
        };
        if let Err(err) = result {
            return Err(self.fail(err));
        }

        match self.tracker.commit_epoch() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Discard the epoch transaction.
    pub fn rollback_epoch(&mut self) {
        self.rollback("requested");
    }

    /// Apply a whole epoch, replaying it on temporary errors.
    ///
    /// Returns the number of attempts used.
    pub fn run_epoch(
        &mut self,
        epoch: EpochInfo,
        changes: &[ChangeRecord],
        max_attempts: u32,
    ) -> ApplyResult<u32> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_epoch(epoch, changes) {
                Ok(()) => return Ok(attempt),
                Err(err) if err.is_temporary() && attempt < max_attempts => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn try_epoch(&mut self, epoch: EpochInfo, changes: &[ChangeRecord]) -> ApplyResult<()> {
        self.begin_epoch(epoch)?;
        for change in changes {
            self.apply(change)?;
        }
        self.commit_epoch()
    }

    fn ensure_running(&self) -> ApplyResult<()> {
        match &self.halted {
            Some(err) => Err(ApplyError::halted(format!(
                "applier halted by earlier error: {}",
                err.message
            ))),
            None => Ok(()),
        }
    }

    fn rollback(&mut self, reason: &str) {
        let epoch = self.tracker.state().current_epoch;
        self.executor.discard_pending();
        self.tracker.abort_epoch();
        log_event_with_fields(
            Event::EpochRollback,
            &[
                (
                    "origin_epoch",
                    epoch
                        .map(|e| e.origin_epoch.to_string())
                        .unwrap_or_default()
                        .as_str(),
                ),
                ("reason", reason),
            ],
        );
    }

    /// Roll back after an error and halt on fatal ones.
    fn fail(&mut self, err: ApplyError) -> ApplyError {
        if err.kind == ApplyErrorKind::RoleTransition {
            return err;
        }

        self.rollback(err.message.as_str());
        if err.is_fatal() {
            log_event_with_fields(
                Event::ApplierHalted,
                &[
                    ("kind", format!("{:?}", err.kind).as_str()),
                    ("message", err.message.as_str()),
                ],
            );
            self.halted = Some(err.clone());
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictFunction, RowImage, RowKey, TableDef, Value};
    use crate::engine::{EngineErrorCode, MemoryEngine};

    fn epoch(n: u64) -> EpochInfo {
        EpochInfo {
            origin_server_id: 2,
            origin_epoch: n,
        }
    }

    fn row(v: i64) -> RowImage {
        RowImage::new().with("ts", Value::Int(v))
    }

    fn applier(role: ConflictRole, function: ConflictFunction) -> Applier<MemoryEngine> {
        let config = ApplierConfig::new(1)
            .with_role(role)
            .with_table(TableDef::new("t1").with_function(function).with_default_exceptions());
        Applier::new(&config, MemoryEngine::new()).unwrap()
    }

    #[test]
    fn test_apply_requires_epoch() {
        let mut a = applier(ConflictRole::Primary, ConflictFunction::Epoch);
        let err = a
            .apply(&ChangeRecord::insert("t1", RowKey::int(1), row(1)))
            .unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::InvariantViolation);
        assert!(a.is_halted());
    }

    #[test]
    fn test_clean_epoch_commits() {
        let mut a = applier(ConflictRole::Primary, ConflictFunction::Max { column: "ts".into() });
        a.begin_epoch(epoch(1)).unwrap();
        a.apply(&ChangeRecord::insert("t1", RowKey::int(1), row(1))).unwrap();
        a.commit_epoch().unwrap();

        assert_eq!(a.engine().row("t1", &RowKey::int(1)).unwrap().values, row(1));
        let status = a.status_handle().snapshot();
        assert_eq!(status.highest_committed_origin_epoch, Some(1));
        assert!(!status.epoch_in_progress);
    }

    #[test]
    fn test_auto_flush_at_batch_size() {
        let config = ApplierConfig::new(1).with_batch_size(2).with_table(TableDef::new("t1"));
        let mut a = Applier::new(&config, MemoryEngine::new()).unwrap();
        a.begin_epoch(epoch(1)).unwrap();
        a.apply(&ChangeRecord::insert("t1", RowKey::int(1), row(1))).unwrap();
        assert_eq!(a.executor.pending(), 1);
        a.apply(&ChangeRecord::insert("t1", RowKey::int(2), row(1))).unwrap();
        assert_eq!(a.executor.pending(), 0);
        assert!(a.engine().in_transaction());
    }

    #[test]
    fn test_temporary_error_rolls_back_and_replays() {
        let mut a = applier(ConflictRole::Primary, ConflictFunction::Max { column: "ts".into() });
        a.engine_mut().fail_next_execute(EngineErrorCode::Temporary(266));
        let changes = vec![ChangeRecord::insert("t1", RowKey::int(1), row(1))];

        let attempts = a.run_epoch(epoch(1), &changes, 3).unwrap();
        assert_eq!(attempts, 2);
        assert!(!a.is_halted());
        assert_eq!(a.engine().commit_count(), 1);
    }

    #[test]
    fn test_fatal_error_halts() {
        let mut a = applier(ConflictRole::None, ConflictFunction::Epoch);
        a.begin_epoch(epoch(1)).unwrap();
        let err = a
            .apply(&ChangeRecord::insert("t1", RowKey::int(1), row(1)))
            .unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::Configuration);
        assert!(a.is_halted());
        assert!(!a.engine().in_transaction());

        let err = a.begin_epoch(epoch(2)).unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::Halted);
    }

    #[test]
    fn test_role_change_rejection_does_not_halt() {
        let mut a = applier(ConflictRole::Primary, ConflictFunction::EpochTrans);
        a.engine_mut().advance_epoch();
        a.engine_mut().local_write("t1", RowKey::int(1), row(5));
        a.begin_epoch(epoch(1)).unwrap();
        a.apply(
            &ChangeRecord::update("t1", RowKey::int(1), row(5), row(6)).with_transaction(70),
        )
        .unwrap();
        a.execute_pending().unwrap();
        assert!(a.tracker().is_in_conflict(70));

        let err = a.set_role(ConflictRole::Secondary).unwrap_err();
        assert_eq!(err.kind, ApplyErrorKind::RoleTransition);
        assert!(!a.is_halted());
        a.commit_epoch().unwrap();
        a.set_role(ConflictRole::Secondary).unwrap();
    }
}
