//! JSON I/O handling for CLI
//!
//! - Input: a JSON document from a file, or stdin for "-"
//! - Output: single JSON object via stdout
//! - UTF-8 only

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::{CliError, CliResult};

/// Read a JSON document from a file, or from stdin when the path is "-".
pub fn read_input<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let content = if path == Path::new("-") {
        let mut content = String::new();
        io::stdin().lock().read_to_string(&mut content)?;
        content
    } else {
        fs::read_to_string(path).map_err(|e| {
            CliError::io_error(format!("failed to read {}: {}", path.display(), e))
        })?
    };

    if content.trim().is_empty() {
        return Err(CliError::input_error("Empty input"));
    }

    serde_json::from_str(&content)
        .map_err(|e| CliError::input_error(format!("invalid input JSON: {}", e)))
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "ok",
        "data": data
    });

    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    });

    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}
