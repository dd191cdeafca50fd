//! Conflict detection and resolution
//!
//! Remote changes from a peer cluster are applied in origin-epoch
//! transactions. Each change is prepared into a batch with a check program
//! chosen by its table's conflict function; the engine runs the checks and
//! reports per-operation failures. Failures that are conflicts are resolved
//! inside the same transaction (refresh the row, log an exceptions row) and
//! counted. Nothing short of a temporary or fatal error aborts the epoch.
//!
//! # Components
//!
//! - `BatchExecutor`: batching, side table of per-operation conflict data
//! - `ConflictPreparer`: turns a change into an operation
//! - `ConflictClassifier`: decides what a failed operation means
//! - `RowRemediator`: defines the refresh and exceptions writes
//! - `ConflictStateTracker`: epoch and transaction conflict state, counters
//! - `Applier`: the single context driving epochs through all of the above

mod applier;
mod cause;
mod change;
mod classifier;
mod errors;
mod exceptions;
mod executor;
mod function;
mod preparer;
mod program;
mod remediator;
mod role;
mod table;
mod tracker;

pub use applier::Applier;
pub use cause::ConflictCause;
pub use change::{
    ChangeRecord, OpKind, OriginMetadata, RawChangeEvent, RowImage, RowKey, Value,
    ANYVALUE_READ_OP, ANYVALUE_REFLECT_OP, ANYVALUE_REFRESH_OP, ANYVALUE_RESERVED,
};
pub use classifier::{verdict, ConflictClassifier, Verdict};
pub use errors::{ApplyError, ApplyErrorKind, ApplyResult};
pub use exceptions::{ExceptionsData, ExceptionsRow, ExceptionsSink};
pub use executor::{
    BatchExecutor, ClassifyResult, ConflictHandler, DefineOperation, OperationTag,
    PendingOperation,
};
pub use function::{CheckInput, ConflictFlags, ConflictFunction};
pub use preparer::{ConflictPreparer, PrepareOutcome};
pub use program::{CheckInstruction, CheckProgram, RowMeta};
pub use remediator::{Remediation, RowRemediator};
pub use role::ConflictRole;
pub use table::{TableDef, TableRegistry, APPLY_STATUS_TABLE, EXCEPTIONS_SUFFIX};
pub use tracker::{
    CauseCounts, ConflictCounters, ConflictStateTracker, ConflictStatus, EpochInfo, EpochState,
    StatusHandle, TransactionConflictState,
};
