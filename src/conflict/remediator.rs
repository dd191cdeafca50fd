//! Row Remediator
//!
//! Resolves one classified conflict inside the epoch transaction:
//! 1. Refresh the row when the cause is `RowInConflict` or the function
//!    always refreshes
//! 2. Append an exceptions row when the table has an exceptions table
//!
//! Both writes are defined through the executor and flushed with the batch
//! that produced the conflict. Their own failures are classified there.

use crate::observability::{log_event_with_fields, Event};

use super::cause::ConflictCause;
use super::errors::{ApplyError, ApplyResult};
use super::exceptions::{ExceptionsData, ExceptionsRow, ExceptionsSink};
use super::executor::{DefineOperation, PendingOperation};
use super::table::TableDef;
use super::tracker::EpochInfo;

/// What remediation defined for a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Remediation {
    pub refreshed: bool,
    pub exception_logged: bool,
}

/// Defines the corrective writes for conflicting rows.
#[derive(Debug, Clone, Copy)]
pub struct RowRemediator {
    server_id: u32,
    epoch: EpochInfo,
}

impl RowRemediator {
    pub fn new(server_id: u32, epoch: EpochInfo) -> Self {
        Self { server_id, epoch }
    }

    pub fn remediate(
        &self,
        table: &TableDef,
        cause: ConflictCause,
        data: &ExceptionsData,
        definer: &mut dyn DefineOperation,
    ) -> ApplyResult<Remediation> {
        let refresh =
            cause == ConflictCause::RowInConflict || data.function.flags().always_refresh_rows;
        let mut remediation = Remediation::default();

        if refresh {
            if table.has_blobs() {
                return Err(ApplyError::unsupported_refresh(format!(
                    "row {}{} cannot be refreshed: table has large-object columns ({})",
                    table.name,
                    data.key,
                    table.blob_columns.join(", ")
                )));
            }
            definer.define_operation(PendingOperation::refresh(&table.name, data.key.clone()))?;
            remediation.refreshed = true;
            log_event_with_fields(
                Event::RowRefreshed,
                &[
                    ("table", table.name.as_str()),
                    ("key", data.key.to_string().as_str()),
                    ("cause", cause.as_str()),
                ],
            );
        }

        if let Some(sink) = ExceptionsSink::for_table(table) {
            let row = ExceptionsRow::new(self.server_id, self.epoch, cause, data);
            sink.append(definer, row)?;
            remediation.exception_logged = true;
            log_event_with_fields(
                Event::ExceptionLogged,
                &[
                    ("table", table.name.as_str()),
                    ("exceptions_table", sink.table()),
                    ("key", data.key.to_string().as_str()),
                    ("cause", cause.as_str()),
                ],
            );
        }

        Ok(remediation)
    }
}
