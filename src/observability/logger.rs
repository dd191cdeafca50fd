//! Structured JSON logger
//!
//! - One log line = one event
//! - `event` first, `severity` second, remaining fields sorted by key
//! - Synchronous, no buffering
//! - Error and above go to stderr; the rest to stdout unless the target is
//!   switched to stderr for commands that print their own output

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Debug-level detail
    Trace = 0,
    /// Normal operations
    Info = 1,
    /// Recoverable issues, including resolved conflicts
    Warn = 2,
    /// Operation failures
    Error = 3,
    /// Applier halted
    Fatal = 4,
}

impl Severity {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Below Error to stdout, Error and above to stderr
    Split,
    /// Every line to stderr
    Stderr,
}

static STDERR_ONLY: AtomicBool = AtomicBool::new(false);

/// A structured logger that outputs JSON lines.
pub struct Logger;

impl Logger {
    /// Set the process-wide log target
    pub fn set_target(target: LogTarget) {
        STDERR_ONLY.store(target == LogTarget::Stderr, Ordering::Relaxed);
    }

    pub fn target() -> LogTarget {
        if STDERR_ONLY.load(Ordering::Relaxed) {
            LogTarget::Stderr
        } else {
            LogTarget::Split
        }
    }

    fn writes_to_stderr(severity: Severity, target: LogTarget) -> bool {
        target == LogTarget::Stderr || severity >= Severity::Error
    }

    /// Log an event with the given severity and fields
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if Self::writes_to_stderr(severity, Self::target()) {
            Self::log_to_writer(severity, event, fields, &mut io::stderr());
        } else {
            Self::log_to_writer(severity, event, fields, &mut io::stdout());
        }
    }

    fn log_to_writer<W: Write>(
        severity: Severity,
        event: &str,
        fields: &[(&str, &str)],
        writer: &mut W,
    ) {
        let line = Self::format_line(severity, event, fields);
        // One write per line; a failing sink never fails the caller.
        let _ = writer.write_all(line.as_bytes());
        let _ = writer.flush();
    }

    fn format_line(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut output = String::with_capacity(256);

        output.push_str("{\"event\":");
        push_json_string(&mut output, event);
        output.push_str(",\"severity\":\"");
        output.push_str(severity.as_str());
        output.push('"');

        let mut sorted_fields: Vec<_> = fields.iter().collect();
        sorted_fields.sort_by_key(|(k, _)| *k);

        for (key, value) in sorted_fields {
            output.push(',');
            push_json_string(&mut output, key);
            output.push(':');
            push_json_string(&mut output, value);
        }

        output.push_str("}\n");
        output
    }

    pub fn trace(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Trace, event, fields);
    }

    pub fn info(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Info, event, fields);
    }

    pub fn warn(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Warn, event, fields);
    }

    pub fn error(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Error, event, fields);
    }

    pub fn fatal(event: &str, fields: &[(&str, &str)]) {
        Self::log(Severity::Fatal, event, fields);
    }
}

fn push_json_string(output: &mut String, s: &str) {
    match serde_json::to_string(s) {
        Ok(quoted) => output.push_str(&quoted),
        Err(_) => output.push_str("\"\""),
    }
}

/// Capture logs to a buffer for testing
#[cfg(test)]
pub fn capture_log(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
    let mut buffer = Vec::new();
    Logger::log_to_writer(severity, event, fields, &mut buffer);
    String::from_utf8(buffer).unwrap()
}
