//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::conflict::{ApplyError, ApplyErrorKind};

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (files, stdin/stdout)
    IoError,
    /// Simulation input could not be decoded
    InputError,
    /// The applier stopped on a fatal error
    ApplyFailed,
    /// Temporary errors persisted past the retry budget
    RetriesExhausted,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "CONFLICT_CLI_CONFIG_ERROR",
            Self::IoError => "CONFLICT_CLI_IO_ERROR",
            Self::InputError => "CONFLICT_CLI_INPUT_ERROR",
            Self::ApplyFailed => "CONFLICT_CLI_APPLY_FAILED",
            Self::RetriesExhausted => "CONFLICT_CLI_RETRIES_EXHAUSTED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn input_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InputError, msg)
    }

    /// Map an applier error met while running a simulation.
    pub fn from_apply(err: ApplyError) -> Self {
        let code = match err.kind {
            ApplyErrorKind::Configuration => CliErrorCode::ConfigError,
            ApplyErrorKind::MalformedEvent => CliErrorCode::InputError,
            _ if err.is_temporary() => CliErrorCode::RetriesExhausted,
            _ => CliErrorCode::ApplyFailed,
        };
        Self::new(code, err.to_string())
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_errors_mapped() {
        let err = CliError::from_apply(ApplyError::configuration("no role"));
        assert_eq!(err.code(), &CliErrorCode::ConfigError);

        let err = CliError::from_apply(ApplyError::temporary("node failure"));
        assert_eq!(err.code_str(), "CONFLICT_CLI_RETRIES_EXHAUSTED");

        let err = CliError::from_apply(ApplyError::unsupported_refresh("blob"));
        assert_eq!(err.code(), &CliErrorCode::ApplyFailed);
        assert!(err.message().contains("blob"));
    }
}
