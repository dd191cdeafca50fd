//! Batched Operation Executor
//!
//! Operations are defined into the engine one by one and flushed in a single
//! round trip. Each definition gets a stable sequence number; the executor
//! keeps a side table from sequence number to `OperationTag` so the context
//! of a conflict-tagged operation can be recovered after execution.
//!
//! After a flush every completed operation defined since the previous flush
//! is classified:
//! - Untagged: duplicate-key and not-found may be ignored by the caller,
//!   anything else fails the batch
//! - Conflict-tagged: handed to the `ConflictHandler`
//! - Refresh / exceptions writes: a repeated refresh is ignored, anything
//!   else means remediation failed
//!
//! Operations the handler defines while classifying are flushed before the
//! call returns. A `BatchScope` guard discards everything pending on every
//! error path, so a partial batch is never left behind in the engine.

use std::collections::BTreeMap;

use crate::engine::{
    CompletedOp, Engine, EngineErrorCode, ExecType, OpSeq, Operation, OperationBody,
    OperationKind,
};

use super::change::RowKey;
use super::errors::{ApplyError, ApplyResult};
use super::exceptions::ExceptionsData;
use super::program::CheckProgram;

/// Side-table entry recorded for each defined operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationTag {
    /// Plain write outside conflict handling
    Untagged,
    /// Write carrying conflict-detection context
    Conflict(Box<ExceptionsData>),
    /// Corrective refresh
    Refresh,
    /// Exceptions row append
    Exception,
}

/// An operation before it is assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub table: String,
    pub kind: OperationKind,
    pub key: RowKey,
    pub body: OperationBody,
    pub check: Option<CheckProgram>,
    pub reflect: bool,
    pub tag: OperationTag,
}

impl PendingOperation {
    pub fn new(table: impl Into<String>, kind: OperationKind, key: RowKey) -> Self {
        Self {
            table: table.into(),
            kind,
            key,
            body: OperationBody::Empty,
            check: None,
            reflect: false,
            tag: OperationTag::Untagged,
        }
    }

    /// Zero-payload refresh of a row.
    pub fn refresh(table: impl Into<String>, key: RowKey) -> Self {
        Self::new(table, OperationKind::Refresh, key).tagged(OperationTag::Refresh)
    }

    pub fn with_body(mut self, body: OperationBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_check(mut self, check: Option<CheckProgram>) -> Self {
        self.check = check;
        self
    }

    pub fn reflecting(mut self) -> Self {
        self.reflect = true;
        self
    }

    pub fn tagged(mut self, tag: OperationTag) -> Self {
        self.tag = tag;
        self
    }

    fn into_operation(self, seq: OpSeq) -> (Operation, OperationTag) {
        let op = Operation {
            seq,
            table: self.table,
            kind: self.kind,
            key: self.key,
            body: self.body,
            check: self.check,
            reflect: self.reflect,
        };
        (op, self.tag)
    }
}

/// Anything operations can be defined into.
pub trait DefineOperation {
    fn define_operation(&mut self, op: PendingOperation) -> ApplyResult<OpSeq>;
}

/// Outcome of classifying one conflicting operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyResult {
    /// Resolved (or deliberately not acted upon); the batch continues
    Ignored,
    /// Stop the batch
    Fatal(ApplyError),
}

/// Receives the failures of conflict-tagged operations.
pub trait ConflictHandler {
    fn handle_conflict(
        &mut self,
        error: EngineErrorCode,
        data: &ExceptionsData,
        definer: &mut dyn DefineOperation,
    ) -> ClassifyResult;
}

/// Defines operations and flushes them in batches.
#[derive(Debug)]
pub struct BatchExecutor<E: Engine> {
    engine: E,
    next_seq: OpSeq,
    /// Operations below this sequence number have been classified.
    classified_upto: OpSeq,
    tags: BTreeMap<OpSeq, OperationTag>,
}

impl<E: Engine> BatchExecutor<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            next_seq: 1,
            classified_upto: 1,
            tags: BTreeMap::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Operations defined but not yet executed.
    pub fn pending(&self) -> usize {
        self.engine.pending()
    }

    /// Side-table entry of an operation not yet classified.
    pub fn tag(&self, seq: OpSeq) -> Option<&OperationTag> {
        self.tags.get(&seq)
    }

    /// Flush pending operations, keeping the transaction open.
    ///
    /// Returns the number of failed operations that were ignored.
    pub fn execute_no_commit(
        &mut self,
        ignore_row_errors: bool,
        handler: &mut dyn ConflictHandler,
    ) -> ApplyResult<usize> {
        let mut scope = BatchScope::new(self);
        let ignored = scope.executor.flush(ignore_row_errors, handler)?;
        scope.complete();
        Ok(ignored)
    }

    /// Flush pending operations, then commit the transaction.
    pub fn execute_commit(
        &mut self,
        force_send: bool,
        ignore_row_errors: bool,
        handler: &mut dyn ConflictHandler,
    ) -> ApplyResult<usize> {
        let mut scope = BatchScope::new(self);
        let ignored = scope.executor.flush(ignore_row_errors, handler)?;
        let completed = scope
            .executor
            .engine
            .execute(ExecType::Commit { force_send })?;
        if !completed.is_empty() {
            return Err(ApplyError::invariant_violation(format!(
                "commit executed {} operations left after the final flush",
                completed.len()
            )));
        }
        scope.complete();
        Ok(ignored)
    }

    /// Drop pending operations and the open transaction.
    pub fn discard_pending(&mut self) {
        self.engine.rollback();
        self.tags.clear();
        self.classified_upto = self.next_seq;
    }

    fn flush(
        &mut self,
        ignore_row_errors: bool,
        handler: &mut dyn ConflictHandler,
    ) -> ApplyResult<usize> {
        if self.engine.pending() == 0 {
            return Ok(0);
        }

        let completed = self.engine.execute(ExecType::NoCommit)?;
        let mut ignored = self.classify(&completed, ignore_row_errors, handler)?;

        // Refreshes and exceptions rows defined by the handler.
        while self.engine.pending() > 0 {
            let extra = self.engine.execute(ExecType::NoCommit).map_err(|err| {
                if err.code.is_temporary() {
                    ApplyError::from(err)
                } else {
                    ApplyError::remediation_failed(format!(
                        "flushing corrective operations failed: {}",
                        err
                    ))
                }
            })?;
            ignored += self.classify(&extra, ignore_row_errors, handler)?;
        }

        Ok(ignored)
    }

    fn classify(
        &mut self,
        completed: &[CompletedOp],
        ignore_row_errors: bool,
        handler: &mut dyn ConflictHandler,
    ) -> ApplyResult<usize> {
        let (first, last) = (self.classified_upto, self.next_seq);
        self.classified_upto = last;

        let mut ignored = 0;
        for done in completed.iter().filter(|c| c.seq >= first && c.seq < last) {
            let tag = self.tags.remove(&done.seq).ok_or_else(|| {
                ApplyError::invariant_violation(format!(
                    "completed operation {} has no side-table entry",
                    done.seq
                ))
            })?;
            let Some(code) = done.error else {
                continue;
            };
            if code.is_temporary() {
                return Err(ApplyError::from_code(code, "operation failed"));
            }

            match tag {
                OperationTag::Conflict(data) => match handler.handle_conflict(code, &data, self) {
                    ClassifyResult::Ignored => ignored += 1,
                    ClassifyResult::Fatal(err) => return Err(err),
                },
                OperationTag::Untagged => match code {
                    EngineErrorCode::DuplicateKey
                    | EngineErrorCode::RowNotFound
                    | EngineErrorCode::OpAfterRefresh
                        if ignore_row_errors =>
                    {
                        ignored += 1
                    }
                    EngineErrorCode::ConflictFnViolation => {
                        return Err(ApplyError::invariant_violation(format!(
                            "operation {} without conflict context failed its check",
                            done.seq
                        )))
                    }
                    _ => return Err(ApplyError::from_code(code, "operation failed")),
                },
                OperationTag::Refresh if code == EngineErrorCode::OpAfterRefresh => ignored += 1,
                OperationTag::Refresh | OperationTag::Exception => {
                    return Err(ApplyError::remediation_failed(format!(
                        "corrective operation {} failed: {}",
                        done.seq, code
                    )))
                }
            }
        }

        Ok(ignored)
    }
}

impl<E: Engine> DefineOperation for BatchExecutor<E> {
    fn define_operation(&mut self, op: PendingOperation) -> ApplyResult<OpSeq> {
        let seq = self.next_seq;
        let (op, tag) = op.into_operation(seq);
        self.engine.define(op)?;
        self.next_seq += 1;
        self.tags.insert(seq, tag);
        Ok(seq)
    }
}

/// Discards the batch unless explicitly completed.
struct BatchScope<'a, E: Engine> {
    executor: &'a mut BatchExecutor<E>,
    completed: bool,
}

impl<'a, E: Engine> BatchScope<'a, E> {
    fn new(executor: &'a mut BatchExecutor<E>) -> Self {
        Self {
            executor,
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
    }
}

impl<E: Engine> Drop for BatchScope<'_, E> {
    fn drop(&mut self) {
        if !self.completed {
            self.executor.discard_pending();
        }
    }
}
