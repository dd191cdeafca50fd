//! Observable events of the conflict applier
//!
//! Events are explicit and typed. Each one carries the severity it is
//! logged at.

use std::fmt;

use super::logger::Severity;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Configuration
    /// Applier configuration loaded
    ConfigLoaded,

    // Epoch transactions
    /// Epoch transaction begins
    EpochBegin,
    /// Epoch transaction committed
    EpochCommit,
    /// Epoch transaction must be replayed
    EpochRetry,
    /// Epoch transaction rolled back
    EpochRollback,

    // Conflict handling
    /// Conflict detected on a row
    ConflictDetected,
    /// Corrective refresh defined for a row
    RowRefreshed,
    /// Exceptions row defined
    ExceptionLogged,
    /// Origin transaction marked in conflict
    TransactionInConflict,
    /// Row rejected because its transaction is in conflict
    TransactionRowRejected,
    /// Reflected operation discarded on the Secondary
    ReflectedOpDiscarded,
    /// Delete found no row
    DeleteDeleteRace,

    // Role
    /// Conflict role changed
    RoleChanged,
    /// Conflict role change refused
    RoleChangeRejected,

    // Lifecycle
    /// Applier stopped after a fatal error (FATAL)
    ApplierHalted,
    /// Simulation run finished
    SimulationComplete,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::EpochBegin => "EPOCH_BEGIN",
            Event::EpochCommit => "EPOCH_COMMIT",
            Event::EpochRetry => "EPOCH_RETRY",
            Event::EpochRollback => "EPOCH_ROLLBACK",

            Event::ConflictDetected => "CONFLICT_DETECTED",
            Event::RowRefreshed => "ROW_REFRESHED",
            Event::ExceptionLogged => "EXCEPTION_LOGGED",
            Event::TransactionInConflict => "TRANSACTION_IN_CONFLICT",
            Event::TransactionRowRejected => "TRANSACTION_ROW_REJECTED",
            Event::ReflectedOpDiscarded => "REFLECTED_OP_DISCARDED",
            Event::DeleteDeleteRace => "DELETE_DELETE_RACE",

            Event::RoleChanged => "ROLE_CHANGED",
            Event::RoleChangeRejected => "ROLE_CHANGE_REJECTED",

            Event::ApplierHalted => "APPLIER_HALTED",
            Event::SimulationComplete => "SIMULATION_COMPLETE",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::ApplierHalted)
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::ApplierHalted => Severity::Fatal,
            Event::ConflictDetected
            | Event::TransactionInConflict
            | Event::EpochRetry
            | Event::EpochRollback
            | Event::RoleChangeRejected => Severity::Warn,
            Event::RowRefreshed
            | Event::ExceptionLogged
            | Event::TransactionRowRejected
            | Event::ReflectedOpDiscarded
            | Event::DeleteDeleteRace => Severity::Trace,
            Event::ConfigLoaded
            | Event::EpochBegin
            | Event::EpochCommit
            | Event::RoleChanged
            | Event::SimulationComplete => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Event; 16] = [
        Event::ConfigLoaded,
        Event::EpochBegin,
        Event::EpochCommit,
        Event::EpochRetry,
        Event::EpochRollback,
        Event::ConflictDetected,
        Event::RowRefreshed,
        Event::ExceptionLogged,
        Event::TransactionInConflict,
        Event::TransactionRowRejected,
        Event::ReflectedOpDiscarded,
        Event::DeleteDeleteRace,
        Event::RoleChanged,
        Event::RoleChangeRejected,
        Event::ApplierHalted,
        Event::SimulationComplete,
    ];

    #[test]
    fn test_all_events_have_string_representation() {
        for event in ALL {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::ApplierHalted.is_fatal());
        assert_eq!(Event::ApplierHalted.severity(), Severity::Fatal);
        for event in ALL.iter().filter(|e| **e != Event::ApplierHalted) {
            assert!(!event.is_fatal());
            assert!(event.severity() < Severity::Fatal);
        }
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::ConflictDetected), "CONFLICT_DETECTED");
        assert_eq!(format!("{}", Event::EpochCommit), "EPOCH_COMMIT");
    }
}
