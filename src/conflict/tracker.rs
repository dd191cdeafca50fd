//! Conflict State Tracker
//!
//! Single owned state of the applier context:
//! - Per origin transaction: `Clean -> InConflict`, one way within an epoch
//! - Row-level dependencies between transactions of the same epoch
//! - Current (this attempt) and total conflict counters
//! - The conflict role
//!
//! Monitoring never reads this state directly. The tracker publishes a
//! `ConflictStatus` copy into a `StatusHandle` at epoch boundaries and role
//! changes; readers take the copy under a short-held mutex.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use uuid::Uuid;

use crate::observability::{log_event_with_fields, Event};

use super::cause::ConflictCause;
use super::change::RowKey;
use super::errors::{ApplyError, ApplyResult};
use super::role::ConflictRole;

/// Origin epoch of the transaction being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochInfo {
    pub origin_server_id: u32,
    pub origin_epoch: u64,
}

/// Conflict state of one origin transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TransactionConflictState {
    #[default]
    Clean,
    InConflict,
}

/// Violation counts per cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CauseCounts {
    #[serde(rename = "ROW_IN_CONFLICT")]
    pub row_in_conflict: u64,
    #[serde(rename = "ROW_ALREADY_EXISTS")]
    pub row_already_exists: u64,
    #[serde(rename = "ROW_DOES_NOT_EXIST")]
    pub row_does_not_exist: u64,
}

impl CauseCounts {
    pub fn get(&self, cause: ConflictCause) -> u64 {
        match cause {
            ConflictCause::RowInConflict => self.row_in_conflict,
            ConflictCause::RowAlreadyExists => self.row_already_exists,
            ConflictCause::RowDoesNotExist => self.row_does_not_exist,
        }
    }

    pub fn sum(&self) -> u64 {
        self.row_in_conflict + self.row_already_exists + self.row_does_not_exist
    }

    fn increment(&mut self, cause: ConflictCause) {
        match cause {
            ConflictCause::RowInConflict => self.row_in_conflict += 1,
            ConflictCause::RowAlreadyExists => self.row_already_exists += 1,
            ConflictCause::RowDoesNotExist => self.row_does_not_exist += 1,
        }
    }

    fn add(&mut self, other: &CauseCounts) {
        self.row_in_conflict += other.row_in_conflict;
        self.row_already_exists += other.row_already_exists;
        self.row_does_not_exist += other.row_does_not_exist;
    }
}

/// Counters kept per epoch attempt and in total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictCounters {
    pub violation_count: CauseCounts,
    /// Violations keyed by conflict function name.
    pub violations_by_function: BTreeMap<String, u64>,
    pub reflect_op_prepare_count: u64,
    pub reflect_op_discard_count: u64,
    pub refresh_op_count: u64,
    pub delete_delete_count: u64,
    /// Rows whose own check failed under a transactional function.
    pub trans_row_conflict_count: u64,
    /// Rows discarded because their transaction was already in conflict.
    pub trans_row_reject_count: u64,
    /// Transactions marked in conflict.
    pub trans_conflict_count: u64,
}

impl ConflictCounters {
    pub fn has_conflicts(&self) -> bool {
        self.violation_count.sum() > 0 || self.trans_conflict_count > 0
    }

    fn add(&mut self, other: &ConflictCounters) {
        self.violation_count.add(&other.violation_count);
        for (function, count) in &other.violations_by_function {
            *self.violations_by_function.entry(function.clone()).or_default() += count;
        }
        self.reflect_op_prepare_count += other.reflect_op_prepare_count;
        self.reflect_op_discard_count += other.reflect_op_discard_count;
        self.refresh_op_count += other.refresh_op_count;
        self.delete_delete_count += other.delete_delete_count;
        self.trans_row_conflict_count += other.trans_row_conflict_count;
        self.trans_row_reject_count += other.trans_row_reject_count;
        self.trans_conflict_count += other.trans_conflict_count;
    }
}

/// Epoch-scoped applier state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochState {
    pub current_epoch: Option<EpochInfo>,
    pub in_progress: bool,
    /// Commit of `current_epoch` was refused; the same epoch is replayed next.
    pub retry_pending: bool,
    pub current: ConflictCounters,
    pub total: ConflictCounters,
    pub retry_trans_count: u64,
    pub trans_detect_iter_count: u64,
    pub trans_conflict_commit_count: u64,
    /// Resume position after a restart.
    pub highest_committed_origin_epoch: Option<u64>,
    /// Highest local epoch the peer is known to have applied.
    pub max_replicated_epoch: u64,
    pub last_conflict_epoch: Option<u64>,
    pending_max_replicated_epoch: Option<u64>,
    pending_origin_epoch: Option<u64>,
}

/// Read-only copy of the applier state for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictStatus {
    pub applier_id: Uuid,
    pub server_id: u32,
    pub role: ConflictRole,
    pub current_epoch: Option<EpochInfo>,
    pub epoch_in_progress: bool,
    pub retry_pending: bool,
    pub transactions_in_conflict: usize,
    pub current: ConflictCounters,
    pub total: ConflictCounters,
    pub retry_trans_count: u64,
    pub trans_detect_iter_count: u64,
    pub trans_conflict_commit_count: u64,
    pub highest_committed_origin_epoch: Option<u64>,
    pub max_replicated_epoch: u64,
    pub last_conflict_epoch: Option<u64>,
}

impl ConflictStatus {
    /// Render with the stable flat counter names operators alert on.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = Map::new();
        out.insert("applier_id".into(), json!(self.applier_id.to_string()));
        out.insert("server_id".into(), json!(self.server_id));
        out.insert("role".into(), json!(self.role.as_str()));
        out.insert("current_epoch".into(), json!(self.current_epoch));
        out.insert("epoch_in_progress".into(), json!(self.epoch_in_progress));
        out.insert("retry_pending".into(), json!(self.retry_pending));
        out.insert(
            "transactions_in_conflict".into(),
            json!(self.transactions_in_conflict),
        );
        insert_counters(&mut out, "current", &self.current);
        insert_counters(&mut out, "total", &self.total);
        out.insert("retry_trans_count".into(), json!(self.retry_trans_count));
        out.insert(
            "trans_detect_iter_count".into(),
            json!(self.trans_detect_iter_count),
        );
        out.insert(
            "trans_conflict_commit_count".into(),
            json!(self.trans_conflict_commit_count),
        );
        out.insert(
            "highest_committed_origin_epoch".into(),
            json!(self.highest_committed_origin_epoch),
        );
        out.insert("max_replicated_epoch".into(), json!(self.max_replicated_epoch));
        out.insert("last_conflict_epoch".into(), json!(self.last_conflict_epoch));
        serde_json::Value::Object(out)
    }
}

fn insert_counters(out: &mut Map<String, serde_json::Value>, prefix: &str, c: &ConflictCounters) {
    let mut put = |name: &str, value: serde_json::Value| {
        out.insert(format!("{}_{}", prefix, name), value);
    };
    put("violation_count", json!(c.violation_count));
    put("violations_by_function", json!(c.violations_by_function));
    put("reflect_op_prepare_count", json!(c.reflect_op_prepare_count));
    put("reflect_op_discard_count", json!(c.reflect_op_discard_count));
    put("refresh_op_count", json!(c.refresh_op_count));
    put("delete_delete_count", json!(c.delete_delete_count));
    put("trans_row_conflict_count", json!(c.trans_row_conflict_count));
    put("trans_row_reject_count", json!(c.trans_row_reject_count));
    put("trans_conflict_count", json!(c.trans_conflict_count));
}

/// Cloneable read handle on the last published status.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<ConflictStatus>>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> ConflictStatus {
        match self.inner.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, status: ConflictStatus) {
        match self.inner.lock() {
            Ok(mut guard) => *guard = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }
}

#[derive(Debug, Default)]
struct DependencyTracker {
    last_writer: HashMap<(String, RowKey), u64>,
    dependents: HashMap<u64, BTreeSet<u64>>,
    rows_prepared: HashMap<u64, u64>,
}

impl DependencyTracker {
    fn record_row(&mut self, table: &str, key: &RowKey, transaction_id: u64) {
        *self.rows_prepared.entry(transaction_id).or_default() += 1;
        let previous = self
            .last_writer
            .insert((table.to_string(), key.clone()), transaction_id);
        if let Some(previous) = previous.filter(|p| *p != transaction_id) {
            self.dependents.entry(previous).or_default().insert(transaction_id);
        }
    }

    fn rows_prepared(&self, transaction_id: u64) -> u64 {
        self.rows_prepared.get(&transaction_id).copied().unwrap_or(0)
    }

    /// Every transaction depending on `transaction_id`, transitively.
    fn dependents_of(&self, transaction_id: u64) -> Vec<u64> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([transaction_id]);
        while let Some(next) = queue.pop_front() {
            for dependent in self.dependents.get(&next).into_iter().flatten() {
                if *dependent != transaction_id && seen.insert(*dependent) {
                    queue.push_back(*dependent);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Last transaction that wrote `(table, key)` in this epoch, if another.
    fn previous_writer(&self, table: &str, key: &RowKey, transaction_id: u64) -> Option<u64> {
        self.last_writer
            .get(&(table.to_string(), key.clone()))
            .copied()
            .filter(|w| *w != transaction_id)
    }

    fn clear(&mut self) {
        self.last_writer.clear();
        self.dependents.clear();
        self.rows_prepared.clear();
    }
}

/// Conflict state of the single applier context.
#[derive(Debug)]
pub struct ConflictStateTracker {
    applier_id: Uuid,
    server_id: u32,
    role: ConflictRole,
    state: EpochState,
    transactions: HashMap<u64, TransactionConflictState>,
    dependencies: DependencyTracker,
    /// Transactional detections of the attempt; a replay starts from these.
    detected: ConflictCounters,
    need_retry: bool,
    status: StatusHandle,
}

impl ConflictStateTracker {
    pub fn new(server_id: u32, role: ConflictRole) -> Self {
        let tracker = Self {
            applier_id: Uuid::new_v4(),
            server_id,
            role,
            state: EpochState::default(),
            transactions: HashMap::new(),
            dependencies: DependencyTracker::default(),
            detected: ConflictCounters::default(),
            need_retry: false,
            status: StatusHandle::default(),
        };
        tracker.publish();
        tracker
    }

    pub fn applier_id(&self) -> Uuid {
        self.applier_id
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn role(&self) -> ConflictRole {
        self.role
    }

    pub fn state(&self) -> &EpochState {
        &self.state
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Number of transactions currently marked in conflict.
    pub fn in_conflict_count(&self) -> usize {
        self.transactions
            .values()
            .filter(|s| **s == TransactionConflictState::InConflict)
            .count()
    }

    /// Change the conflict role.
    ///
    /// Refused while an epoch is in progress or a retry of the last epoch
    /// is pending: operations prepared under one role must be classified
    /// under the same role.
    pub fn set_role(&mut self, to: ConflictRole) -> ApplyResult<()> {
        let in_flight = self.state.in_progress || self.state.retry_pending;
        match self.role.transition(to, in_flight) {
            Ok(role) => {
                let from = self.role;
                self.role = role;
                log_event_with_fields(
                    Event::RoleChanged,
                    &[("from", from.as_str()), ("to", role.as_str())],
                );
                self.publish();
                Ok(())
            }
            Err(err) => {
                log_event_with_fields(
                    Event::RoleChangeRejected,
                    &[
                        ("from", self.role.as_str()),
                        ("to", to.as_str()),
                        ("reason", err.message.as_str()),
                    ],
                );
                Err(err)
            }
        }
    }

    /// Start applying an origin epoch.
    ///
    /// Replaying the epoch whose commit was refused keeps the per-transaction
    /// map. Its counters restart from the transactional detections of the
    /// refused attempt; everything else is counted again by the replay.
    pub fn begin_epoch(&mut self, epoch: EpochInfo) -> ApplyResult<()> {
        if self.state.in_progress {
            return Err(ApplyError::invariant_violation(format!(
                "epoch {} begun while epoch {:?} is in progress",
                epoch.origin_epoch, self.state.current_epoch
            )));
        }

        let replay = self.state.retry_pending && self.state.current_epoch == Some(epoch);
        if replay {
            self.state.trans_detect_iter_count += 1;
            self.state.current = self.detected.clone();
        } else {
            self.reset_for_next_epoch();
            self.state.current = ConflictCounters::default();
        }

        self.dependencies.clear();
        self.need_retry = false;
        self.state.retry_pending = false;
        self.state.pending_max_replicated_epoch = None;
        self.state.pending_origin_epoch = None;
        self.state.current_epoch = Some(epoch);
        self.state.in_progress = true;
        self.publish();
        Ok(())
    }

    /// Clear the per-transaction map; cumulative counters are kept.
    pub fn reset_for_next_epoch(&mut self) {
        self.transactions.clear();
        self.dependencies.clear();
        self.detected = ConflictCounters::default();
        self.need_retry = false;
        self.state.retry_pending = false;
    }

    /// The epoch being applied.
    pub fn require_epoch(&self) -> ApplyResult<EpochInfo> {
        match self.state.current_epoch {
            Some(epoch) if self.state.in_progress => Ok(epoch),
            _ => Err(ApplyError::invariant_violation("no epoch transaction in progress")),
        }
    }

    pub fn transaction_state(&self, transaction_id: u64) -> TransactionConflictState {
        self.transactions
            .get(&transaction_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_in_conflict(&self, transaction_id: u64) -> bool {
        self.transaction_state(transaction_id) == TransactionConflictState::InConflict
    }

    /// Register a prepared row of a transaction under a transactional function.
    pub fn record_row(&mut self, table: &str, key: &RowKey, transaction_id: u64) {
        self.dependencies.record_row(table, key, transaction_id);
    }

    /// Whether the last other writer of `(table, key)` in this epoch is in
    /// conflict. A transaction writing such a row depends on it.
    pub fn follows_conflicting_writer(
        &self,
        table: &str,
        key: &RowKey,
        transaction_id: u64,
    ) -> bool {
        self.dependencies
            .previous_writer(table, key, transaction_id)
            .is_some_and(|writer| self.is_in_conflict(writer))
    }

    /// Mark a transaction, and every transaction depending on it, in conflict.
    ///
    /// Idempotent. Returns the number of newly marked transactions.
    pub fn mark_in_conflict(&mut self, transaction_id: u64) -> usize {
        if self.is_in_conflict(transaction_id) {
            return 0;
        }

        let mut marked = vec![transaction_id];
        marked.extend(
            self.dependencies
                .dependents_of(transaction_id)
                .into_iter()
                .filter(|t| !self.is_in_conflict(*t)),
        );

        for t in &marked {
            self.transactions.insert(*t, TransactionConflictState::InConflict);
            self.state.current.trans_conflict_count += 1;
            self.detected.trans_conflict_count += 1;

            // The failing row itself is never applied; anything else already
            // prepared for the transaction was.
            let applied_rows = match self.dependencies.rows_prepared(*t) {
                n if *t == transaction_id => n.saturating_sub(1),
                n => n,
            };
            if applied_rows > 0 {
                self.need_retry = true;
            }

            log_event_with_fields(
                Event::TransactionInConflict,
                &[
                    ("transaction_id", t.to_string().as_str()),
                    ("root_transaction_id", transaction_id.to_string().as_str()),
                ],
            );
        }

        marked.len()
    }

    pub fn count_violation(&mut self, cause: ConflictCause, function: &str) {
        self.state.current.violation_count.increment(cause);
        *self
            .state
            .current
            .violations_by_function
            .entry(function.to_string())
            .or_default() += 1;
    }

    /// Count a row whose own check failed under a transactional function.
    ///
    /// Its transaction stays in conflict for a replay, which then rejects
    /// the row instead of detecting it again.
    pub fn count_trans_violation(
        &mut self,
        cause: ConflictCause,
        function: &str,
        delete_delete: bool,
    ) {
        self.count_violation(cause, function);
        self.state.current.trans_row_conflict_count += 1;

        self.detected.violation_count.increment(cause);
        *self
            .detected
            .violations_by_function
            .entry(function.to_string())
            .or_default() += 1;
        self.detected.trans_row_conflict_count += 1;
        if delete_delete {
            self.detected.delete_delete_count += 1;
        }
    }

    pub fn count_reflect_op_prepare(&mut self) {
        self.state.current.reflect_op_prepare_count += 1;
    }

    pub fn count_reflect_op_discard(&mut self) {
        self.state.current.reflect_op_discard_count += 1;
    }

    pub fn count_refresh_op(&mut self) {
        self.state.current.refresh_op_count += 1;
    }

    pub fn count_delete_delete(&mut self) {
        self.state.current.delete_delete_count += 1;
    }

    pub fn count_trans_row_reject(&mut self) {
        self.state.current.trans_row_reject_count += 1;
    }

    /// Record an apply-status row applied in this epoch.
    pub fn observe_apply_status(&mut self, server_id: u32, epoch: u64) {
        let slot = if server_id == self.server_id {
            &mut self.state.pending_max_replicated_epoch
        } else {
            &mut self.state.pending_origin_epoch
        };
        *slot = Some(slot.map_or(epoch, |current| current.max(epoch)));
    }

    /// Refuse the commit if transactional detection found conflicts after
    /// rows of the affected transactions were already applied.
    pub fn prepare_commit(&mut self) -> ApplyResult<()> {
        let epoch = self.require_epoch()?;
        if !self.need_retry {
            return Ok(());
        }

        self.need_retry = false;
        self.state.retry_pending = true;
        self.state.in_progress = false;
        self.state.retry_trans_count += 1;
        log_event_with_fields(
            Event::EpochRetry,
            &[
                ("origin_epoch", epoch.origin_epoch.to_string().as_str()),
                ("transactions_in_conflict", self.in_conflict_count().to_string().as_str()),
            ],
        );
        self.publish();
        Err(ApplyError::transaction_retry(format!(
            "epoch {} must be replayed: transactions in conflict had rows applied",
            epoch.origin_epoch
        )))
    }

    /// Fold the epoch into the totals after the engine committed it.
    pub fn commit_epoch(&mut self) -> ApplyResult<()> {
        let epoch = self.require_epoch()?;
        let current = std::mem::take(&mut self.state.current);

        if current.has_conflicts() {
            self.state.last_conflict_epoch = Some(epoch.origin_epoch);
        }
        if self.in_conflict_count() > 0 {
            self.state.trans_conflict_commit_count += 1;
        }
        self.state.total.add(&current);

        let committed = self
            .state
            .pending_origin_epoch
            .take()
            .map_or(epoch.origin_epoch, |e| e.max(epoch.origin_epoch));
        self.state.highest_committed_origin_epoch = Some(
            self.state
                .highest_committed_origin_epoch
                .map_or(committed, |h| h.max(committed)),
        );
        if let Some(replicated) = self.state.pending_max_replicated_epoch.take() {
            self.state.max_replicated_epoch = self.state.max_replicated_epoch.max(replicated);
        }

        self.state.in_progress = false;
        self.reset_for_next_epoch();

        log_event_with_fields(
            Event::EpochCommit,
            &[
                ("origin_epoch", epoch.origin_epoch.to_string().as_str()),
                ("origin_server_id", epoch.origin_server_id.to_string().as_str()),
                ("violations", current.violation_count.sum().to_string().as_str()),
            ],
        );
        self.publish();
        Ok(())
    }

    /// Discard the epoch attempt after a rollback.
    ///
    /// A refused commit keeps the transaction map and the transactional
    /// detections for the replay of the same epoch.
    pub fn abort_epoch(&mut self) {
        self.state.pending_max_replicated_epoch = None;
        self.state.pending_origin_epoch = None;
        self.state.in_progress = false;
        if self.state.retry_pending {
            self.state.current = self.detected.clone();
            self.publish();
            return;
        }
        self.state.current = ConflictCounters::default();
        self.reset_for_next_epoch();
        self.publish();
    }

    pub fn snapshot(&self) -> ConflictStatus {
        ConflictStatus {
            applier_id: self.applier_id,
            server_id: self.server_id,
            role: self.role,
            current_epoch: self.state.current_epoch,
            epoch_in_progress: self.state.in_progress,
            retry_pending: self.state.retry_pending,
            transactions_in_conflict: self.in_conflict_count(),
            current: self.state.current.clone(),
            total: self.state.total.clone(),
            retry_trans_count: self.state.retry_trans_count,
            trans_detect_iter_count: self.state.trans_detect_iter_count,
            trans_conflict_commit_count: self.state.trans_conflict_commit_count,
            highest_committed_origin_epoch: self.state.highest_committed_origin_epoch,
            max_replicated_epoch: self.state.max_replicated_epoch,
            last_conflict_epoch: self.state.last_conflict_epoch,
        }
    }

    /// Copy the current state into the status handle.
    pub fn publish(&self) {
        self.status.publish(self.snapshot());
    }
}
