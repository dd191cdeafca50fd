//! Exceptions Records
//!
//! `ExceptionsData` is the side record stashed with every conflict-tagged
//! operation at definition time, so the full context of a change can be
//! recovered after the batch executes.
//!
//! `ExceptionsRow` is what an operator sees: one append-only row per
//! resolved conflict, written to the table's exceptions table inside the
//! same transaction as the corrective refresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{OpSeq, OperationBody, OperationKind};

use super::cause::ConflictCause;
use super::change::{ChangeRecord, OpKind, RowImage, RowKey};
use super::errors::ApplyResult;
use super::executor::{DefineOperation, OperationTag, PendingOperation};
use super::function::ConflictFunction;
use super::table::TableDef;
use super::tracker::EpochInfo;

/// Context of a conflict-tagged operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionsData {
    pub table: String,
    pub key: RowKey,
    /// Kind reported for the conflicting operation (reads remapped).
    pub kind: OpKind,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    pub write_set: Vec<String>,
    /// Filled in once the conflict is classified.
    pub cause: Option<ConflictCause>,
    pub transaction_id: Option<u64>,
    pub function: ConflictFunction,
    /// The change was an operation reflected back by the Primary.
    pub reflected_op: bool,
    /// The change was a refresh generated by the peer's resolution.
    pub refresh_op: bool,
}

impl ExceptionsData {
    pub fn from_change(change: &ChangeRecord, function: &ConflictFunction) -> Self {
        Self {
            table: change.table.clone(),
            key: change.key.clone(),
            kind: change.effective_kind(),
            before: change.before.clone(),
            after: change.after.clone(),
            write_set: change.write_set.clone(),
            cause: None,
            transaction_id: change.origin.transaction_id,
            function: function.clone(),
            reflected_op: change.origin.reflected(),
            refresh_op: change.origin.refresh(),
        }
    }

    pub fn with_cause(mut self, cause: ConflictCause) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// One row of an exceptions table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionsRow {
    pub server_id: u32,
    pub origin_server_id: u32,
    pub origin_epoch: u64,
    pub table: String,
    pub key: RowKey,
    pub op_kind: OpKind,
    pub cause: ConflictCause,
    pub transaction_id: Option<u64>,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    pub write_set: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ExceptionsRow {
    pub fn new(server_id: u32, epoch: EpochInfo, cause: ConflictCause, data: &ExceptionsData) -> Self {
        Self {
            server_id,
            origin_server_id: epoch.origin_server_id,
            origin_epoch: epoch.origin_epoch,
            table: data.table.clone(),
            key: data.key.clone(),
            op_kind: data.kind,
            cause,
            transaction_id: data.transaction_id,
            before: data.before.clone(),
            after: data.after.clone(),
            write_set: data.write_set.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Appends exceptions rows to a table's exceptions table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionsSink {
    table: String,
}

impl ExceptionsSink {
    /// Sink for a table, if it has an exceptions table configured.
    pub fn for_table(def: &TableDef) -> Option<Self> {
        def.exceptions_table_name().map(|table| Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Define the append in the current transaction.
    pub fn append(&self, definer: &mut dyn DefineOperation, row: ExceptionsRow) -> ApplyResult<OpSeq> {
        let op = PendingOperation::new(&self.table, OperationKind::Insert, row.key.clone())
            .with_body(OperationBody::Exception(Box::new(row)))
            .tagged(OperationTag::Exception);
        definer.define_operation(op)
    }
}
