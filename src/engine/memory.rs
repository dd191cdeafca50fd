//! In-memory transactional engine
//!
//! Rows carry the hidden attributes the conflict check programs read (local
//! commit epoch, replicated author). A transaction is a staged copy of the
//! committed tables; `Commit` swaps it in and stamps every touched row with
//! the current local epoch.
//!
//! Refresh follows the usual storage-engine rule: once a row has been
//! refreshed in a transaction, any further operation on it fails with
//! `OpAfterRefresh`.

use std::collections::{BTreeMap, BTreeSet};

use crate::conflict::{ExceptionsRow, RowImage, RowKey, RowMeta};

use super::{
    CompletedOp, Engine, EngineError, EngineErrorCode, ExecType, Operation, OperationBody,
    OperationKind,
};

type Tables = BTreeMap<String, BTreeMap<RowKey, StoredRow>>;

/// A committed or staged row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub values: RowImage,
    pub meta: RowMeta,
}

/// What a committed transaction ships to the peer besides ordinary changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    /// Row realignment; `row` is the state being forced on the peer
    Refresh,
    /// Operation tagged for reflection back to the Secondary
    Reflected(OperationKind),
}

/// One outbound change recorded at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub table: String,
    pub key: RowKey,
    pub kind: OutboundKind,
    /// Row state at the time of the operation; `None` if the row is absent.
    pub row: Option<RowImage>,
}

#[derive(Debug, Default)]
struct Transaction {
    tables: Tables,
    touched: BTreeSet<(String, RowKey)>,
    refreshed: BTreeSet<(String, RowKey)>,
    exceptions: Vec<(String, ExceptionsRow)>,
    outbound: Vec<OutboundEvent>,
}

impl Transaction {
    fn begin(committed: &Tables) -> Self {
        Self {
            tables: committed.clone(),
            ..Default::default()
        }
    }

    fn apply(
        &mut self,
        op: &Operation,
        faults: &BTreeMap<String, EngineErrorCode>,
    ) -> Option<EngineErrorCode> {
        if let Some(code) = faults.get(&op.table) {
            return Some(*code);
        }

        let marker = (op.table.clone(), op.key.clone());
        if self.refreshed.contains(&marker) {
            return Some(EngineErrorCode::OpAfterRefresh);
        }

        if let OperationBody::Exception(row) = &op.body {
            self.exceptions.push((op.table.clone(), (**row).clone()));
            return None;
        }

        let payload = match &op.body {
            OperationBody::Row(values) => values.clone(),
            _ => RowImage::new(),
        };
        let rows = self.tables.entry(op.table.clone()).or_default();
        let replicated = RowMeta {
            commit_epoch: 0,
            replicated: true,
        };

        match op.kind {
            OperationKind::Insert => {
                if rows.contains_key(&op.key) {
                    return Some(EngineErrorCode::DuplicateKey);
                }
                rows.insert(
                    op.key.clone(),
                    StoredRow {
                        values: payload,
                        meta: replicated,
                    },
                );
            }
            OperationKind::Update => {
                let Some(row) = rows.get_mut(&op.key) else {
                    return Some(EngineErrorCode::RowNotFound);
                };
                if !check_passes(op, row) {
                    return Some(EngineErrorCode::ConflictFnViolation);
                }
                row.values.merge(&payload);
                row.meta.replicated = true;
            }
            OperationKind::Delete => {
                let Some(row) = rows.get(&op.key) else {
                    return Some(EngineErrorCode::RowNotFound);
                };
                if !check_passes(op, row) {
                    return Some(EngineErrorCode::ConflictFnViolation);
                }
                rows.remove(&op.key);
            }
            OperationKind::Write => match rows.get_mut(&op.key) {
                Some(row) => {
                    row.values.merge(&payload);
                    row.meta.replicated = true;
                }
                None => {
                    rows.insert(
                        op.key.clone(),
                        StoredRow {
                            values: payload,
                            meta: replicated,
                        },
                    );
                }
            },
            OperationKind::Refresh => {
                let current = rows.get(&op.key).map(|row| row.values.clone());
                self.outbound.push(OutboundEvent {
                    table: op.table.clone(),
                    key: op.key.clone(),
                    kind: OutboundKind::Refresh,
                    row: current,
                });
                self.refreshed.insert(marker.clone());
            }
            OperationKind::Read => {
                let Some(row) = rows.get(&op.key) else {
                    return Some(EngineErrorCode::RowNotFound);
                };
                if !check_passes(op, row) {
                    return Some(EngineErrorCode::ConflictFnViolation);
                }
                return None;
            }
        }

        if op.reflect {
            let row = self
                .tables
                .get(&op.table)
                .and_then(|rows| rows.get(&op.key))
                .map(|row| row.values.clone());
            self.outbound.push(OutboundEvent {
                table: op.table.clone(),
                key: op.key.clone(),
                kind: OutboundKind::Reflected(op.kind),
                row,
            });
        }
        self.touched.insert(marker);
        None
    }
}

fn check_passes(op: &Operation, row: &StoredRow) -> bool {
    op.check
        .as_ref()
        .map_or(true, |program| program.passes(&row.values, &row.meta))
}

/// In-memory engine with fault injection.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    committed: Tables,
    exceptions: BTreeMap<String, Vec<ExceptionsRow>>,
    outbound: Vec<OutboundEvent>,
    txn: Option<Transaction>,
    pending: Vec<Operation>,
    epoch: u64,
    commits: u64,
    fail_next_execute: Option<EngineErrorCode>,
    table_faults: BTreeMap<String, EngineErrorCode>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at a given local epoch.
    pub fn at_epoch(epoch: u64) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn advance_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Commit a write made by a local client in the current epoch.
    pub fn local_write(&mut self, table: &str, key: RowKey, values: RowImage) {
        let rows = self.committed.entry(table.to_string()).or_default();
        let meta = RowMeta {
            commit_epoch: self.epoch,
            replicated: false,
        };
        match rows.get_mut(&key) {
            Some(row) => {
                row.values.merge(&values);
                row.meta = meta;
            }
            None => {
                rows.insert(key, StoredRow { values, meta });
            }
        }
    }

    /// Commit a delete made by a local client.
    pub fn local_delete(&mut self, table: &str, key: &RowKey) {
        if let Some(rows) = self.committed.get_mut(table) {
            rows.remove(key);
        }
    }

    /// Committed row, if any.
    pub fn row(&self, table: &str, key: &RowKey) -> Option<&StoredRow> {
        self.committed.get(table).and_then(|rows| rows.get(key))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.committed.get(table).map_or(0, BTreeMap::len)
    }

    /// Committed exceptions rows of an exceptions table.
    pub fn exceptions(&self, table: &str) -> &[ExceptionsRow] {
        self.exceptions.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Committed outbound refresh and reflected events.
    pub fn outbound(&self) -> &[OutboundEvent] {
        &self.outbound
    }

    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Fail the next `execute` as a whole.
    pub fn fail_next_execute(&mut self, code: EngineErrorCode) {
        self.fail_next_execute = Some(code);
    }

    /// Fail every operation on `table` with `code`.
    pub fn fail_table(&mut self, table: &str, code: EngineErrorCode) {
        self.table_faults.insert(table.to_string(), code);
    }

    pub fn clear_table_fault(&mut self, table: &str) {
        self.table_faults.remove(table);
    }

    fn commit(&mut self, mut txn: Transaction) {
        for (table, key) in &txn.touched {
            if let Some(row) = txn.tables.get_mut(table).and_then(|rows| rows.get_mut(key)) {
                row.meta.commit_epoch = self.epoch;
            }
        }
        self.committed = txn.tables;
        for (table, row) in txn.exceptions {
            self.exceptions.entry(table).or_default().push(row);
        }
        self.outbound.append(&mut txn.outbound);
        self.commits += 1;
    }
}

impl Engine for MemoryEngine {
    fn define(&mut self, op: Operation) -> Result<(), EngineError> {
        self.pending.push(op);
        Ok(())
    }

    fn execute(&mut self, exec: ExecType) -> Result<Vec<CompletedOp>, EngineError> {
        if let Some(code) = self.fail_next_execute.take() {
            self.rollback();
            return Err(EngineError::new(code, "injected execute failure"));
        }

        let mut txn = match self.txn.take() {
            Some(txn) => txn,
            None => Transaction::begin(&self.committed),
        };

        let ops = std::mem::take(&mut self.pending);
        let completed = ops
            .iter()
            .map(|op| match txn.apply(op, &self.table_faults) {
                None => CompletedOp::ok(op.seq),
                Some(code) => CompletedOp::failed(op.seq, code),
            })
            .collect();

        match exec {
            ExecType::NoCommit => self.txn = Some(txn),
            ExecType::Commit { .. } => self.commit(txn),
        }

        Ok(completed)
    }

    fn rollback(&mut self) {
        self.txn = None;
        self.pending.clear();
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{CheckInstruction, CheckProgram, Value};

    fn op(seq: u64, kind: OperationKind, key: i64, body: OperationBody) -> Operation {
        Operation {
            seq,
            table: "t1".into(),
            kind,
            key: RowKey::int(key),
            body,
            check: None,
            reflect: false,
        }
    }

    fn values(v: i64) -> RowImage {
        RowImage::new().with("v", Value::Int(v))
    }

    #[test]
    fn test_insert_then_duplicate() {
        let mut engine = MemoryEngine::new();
        engine
            .define(op(1, OperationKind::Insert, 1, OperationBody::Row(values(1))))
            .unwrap();
        engine
            .define(op(2, OperationKind::Insert, 1, OperationBody::Row(values(2))))
            .unwrap();
        let completed = engine.execute(ExecType::Commit { force_send: false }).unwrap();
        assert_eq!(completed[0], CompletedOp::ok(1));
        assert_eq!(completed[1], CompletedOp::failed(2, EngineErrorCode::DuplicateKey));
        assert_eq!(engine.row("t1", &RowKey::int(1)).unwrap().values, values(1));
    }

    #[test]
    fn test_update_missing_row() {
        let mut engine = MemoryEngine::new();
        engine
            .define(op(1, OperationKind::Update, 9, OperationBody::Row(values(1))))
            .unwrap();
        let completed = engine.execute(ExecType::NoCommit).unwrap();
        assert_eq!(completed[0].error, Some(EngineErrorCode::RowNotFound));
    }

    #[test]
    fn test_check_program_failure() {
        let mut engine = MemoryEngine::at_epoch(5);
        engine.local_write("t1", RowKey::int(1), values(1));

        let mut update = op(1, OperationKind::Update, 1, OperationBody::Row(values(2)));
        update.check = Some(CheckProgram::new().push(CheckInstruction::RowEpochAtMost { epoch: 4 }));
        engine.define(update).unwrap();
        let completed = engine.execute(ExecType::NoCommit).unwrap();
        assert_eq!(completed[0].error, Some(EngineErrorCode::ConflictFnViolation));
    }

    #[test]
    fn test_commit_stamps_epoch_and_author() {
        let mut engine = MemoryEngine::at_epoch(3);
        engine
            .define(op(1, OperationKind::Write, 1, OperationBody::Row(values(1))))
            .unwrap();
        engine.execute(ExecType::Commit { force_send: true }).unwrap();
        let row = engine.row("t1", &RowKey::int(1)).unwrap();
        assert_eq!(row.meta.commit_epoch, 3);
        assert!(row.meta.replicated);
        assert_eq!(engine.commit_count(), 1);
    }

    #[test]
    fn test_op_after_refresh() {
        let mut engine = MemoryEngine::new();
        engine.local_write("t1", RowKey::int(1), values(1));
        engine
            .define(op(1, OperationKind::Refresh, 1, OperationBody::Empty))
            .unwrap();
        engine
            .define(op(2, OperationKind::Refresh, 1, OperationBody::Empty))
            .unwrap();
        engine
            .define(op(3, OperationKind::Delete, 1, OperationBody::Empty))
            .unwrap();
        let completed = engine.execute(ExecType::Commit { force_send: false }).unwrap();
        assert_eq!(completed[0].error, None);
        assert_eq!(completed[1].error, Some(EngineErrorCode::OpAfterRefresh));
        assert_eq!(completed[2].error, Some(EngineErrorCode::OpAfterRefresh));
        assert_eq!(engine.outbound().len(), 1);
        assert_eq!(engine.outbound()[0].kind, OutboundKind::Refresh);
        assert_eq!(engine.outbound()[0].row, Some(values(1)));
        assert!(engine.row("t1", &RowKey::int(1)).is_some());
    }

    #[test]
    fn test_rollback_discards_staged_state() {
        let mut engine = MemoryEngine::new();
        engine
            .define(op(1, OperationKind::Insert, 1, OperationBody::Row(values(1))))
            .unwrap();
        engine.execute(ExecType::NoCommit).unwrap();
        assert!(engine.in_transaction());
        engine.rollback();
        assert!(!engine.in_transaction());
        assert!(engine.row("t1", &RowKey::int(1)).is_none());
    }

    #[test]
    fn test_injected_execute_failure() {
        let mut engine = MemoryEngine::new();
        engine.fail_next_execute(EngineErrorCode::Temporary(266));
        engine
            .define(op(1, OperationKind::Insert, 1, OperationBody::Row(values(1))))
            .unwrap();
        let err = engine.execute(ExecType::NoCommit).unwrap_err();
        assert!(err.code.is_temporary());
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_table_fault() {
        let mut engine = MemoryEngine::new();
        engine.fail_table("t1", EngineErrorCode::Permanent(4000));
        engine
            .define(op(1, OperationKind::Write, 1, OperationBody::Row(values(1))))
            .unwrap();
        let completed = engine.execute(ExecType::NoCommit).unwrap();
        assert_eq!(completed[0].error, Some(EngineErrorCode::Permanent(4000)));
    }

    #[test]
    fn test_reflected_write_recorded() {
        let mut engine = MemoryEngine::new();
        let mut write = op(1, OperationKind::Write, 1, OperationBody::Row(values(7)));
        write.reflect = true;
        engine.define(write).unwrap();
        engine.execute(ExecType::Commit { force_send: false }).unwrap();
        assert_eq!(
            engine.outbound()[0].kind,
            OutboundKind::Reflected(OperationKind::Write)
        );
        assert_eq!(engine.outbound()[0].row, Some(values(7)));
    }
}
