//! Observability subsystem
//!
//! Structured JSON logging of typed applier events. Counters live with the
//! conflict state tracker and are published through its status handle.
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on conflict handling
//! 3. No async or background threads
//! 4. Deterministic output
//!
//! # Usage
//!
//! ```ignore
//! use aerodb_conflict::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::ConflictDetected, &[("table", "t1")]);
//! ```

mod events;
mod logger;

pub use events::Event;
pub use logger::{LogTarget, Logger, Severity};

/// Log an event at its own severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log an event with fields at its own severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        // This just verifies no panic
        log_event(Event::EpochBegin);
        log_event(Event::EpochCommit);
    }

    #[test]
    fn test_log_event_with_fields() {
        log_event_with_fields(Event::ConfigLoaded, &[("server_id", "1")]);
    }
}
