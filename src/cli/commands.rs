//! CLI command implementations
//!
//! `simulate` drives a real `Applier` over a `MemoryEngine`: local client
//! writes, role changes and injected failures are interleaved with the
//! remote epochs described by the input file.

use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ApplierConfig;
use crate::conflict::{
    Applier, ChangeRecord, ConflictRole, EpochInfo, RawChangeEvent, RowImage, RowKey,
};
use crate::engine::{EngineErrorCode, MemoryEngine};
use crate::observability::{log_event_with_fields, Event, LogTarget, Logger};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_input, write_error, write_response};

/// Error code used for injected temporary failures.
const INJECTED_TEMPORARY_ERROR: u32 = 266;

/// Simulation input file
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationInput {
    pub epochs: Vec<SimulatedEpoch>,
}

/// One origin epoch plus the local activity preceding it
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedEpoch {
    pub origin_server_id: u32,
    pub origin_epoch: u64,

    /// Role change requested before the epoch
    #[serde(default)]
    pub role: Option<ConflictRole>,

    /// Local client writes committed in a new local epoch before applying
    #[serde(default)]
    pub local_writes: Vec<LocalWrite>,

    /// Fail the first flush of the epoch with a temporary error
    #[serde(default)]
    pub inject_temporary_error: bool,

    #[serde(default)]
    pub changes: Vec<RawChangeEvent>,
}

/// A local client write; no `values` means delete.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalWrite {
    pub table: String,
    pub key: RowKey,
    #[serde(default)]
    pub values: Option<RowImage>,
}

/// Run the CLI
///
/// Stdout carries only the JSON response; log lines go to stderr.
pub fn run() -> CliResult<()> {
    Logger::set_target(LogTarget::Stderr);
    let cli = super::args::Cli::parse_args();
    let result = run_command(cli.command);
    if let Err(err) = &result {
        write_error(err.code_str(), err.message())?;
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Simulate { config, input } => simulate(&config, &input),
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Validate a configuration file and print a summary
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    write_response(json!({
        "server_id": config.server_id,
        "role": config.role,
        "batch_size": config.batch_size,
        "transaction_retries": config.transaction_retries,
        "tables": config.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
    }))
}

/// Run a simulation and print the final status
pub fn simulate(config_path: &Path, input_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    let input: SimulationInput = read_input(input_path)?;
    let report = run_simulation(&config, &input)?;
    write_response(report)
}

/// Apply every simulated epoch and report the final state.
pub fn run_simulation(config: &ApplierConfig, input: &SimulationInput) -> CliResult<Value> {
    let mut applier = Applier::new(config, MemoryEngine::new()).map_err(CliError::from_apply)?;
    let max_attempts = config.transaction_retries.saturating_add(1);
    let mut attempts = 0;

    for epoch in &input.epochs {
        if let Some(role) = epoch.role {
            applier.set_role(role).map_err(CliError::from_apply)?;
        }

        if !epoch.local_writes.is_empty() {
            let engine = applier.engine_mut();
            engine.advance_epoch();
            for write in &epoch.local_writes {
                match &write.values {
                    Some(values) => engine.local_write(&write.table, write.key.clone(), values.clone()),
                    None => engine.local_delete(&write.table, &write.key),
                }
            }
        }

        if epoch.inject_temporary_error {
            applier
                .engine_mut()
                .fail_next_execute(EngineErrorCode::Temporary(INJECTED_TEMPORARY_ERROR));
        }

        let changes = epoch
            .changes
            .iter()
            .cloned()
            .map(ChangeRecord::from_event)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CliError::from_apply)?;
        let info = EpochInfo {
            origin_server_id: epoch.origin_server_id,
            origin_epoch: epoch.origin_epoch,
        };
        attempts += applier
            .run_epoch(info, &changes, max_attempts)
            .map_err(CliError::from_apply)?;
    }

    let engine = applier.engine();
    let exceptions: usize = applier
        .tables()
        .iter()
        .filter_map(|t| t.exceptions_table_name())
        .map(|name| engine.exceptions(&name).len())
        .sum();

    log_event_with_fields(
        Event::SimulationComplete,
        &[
            ("epochs", input.epochs.len().to_string().as_str()),
            ("attempts", attempts.to_string().as_str()),
        ],
    );

    Ok(json!({
        "epochs_applied": input.epochs.len(),
        "attempts": attempts,
        "commits": engine.commit_count(),
        "exceptions_rows": exceptions,
        "outbound_events": engine.outbound().len(),
        "conflict_status": applier.status_handle().snapshot().to_json(),
    }))
}

fn load_config(path: &Path) -> CliResult<ApplierConfig> {
    let config = ApplierConfig::load(path).map_err(|e| CliError::config_error(e.message))?;
    log_event_with_fields(
        Event::ConfigLoaded,
        &[
            ("path", path.display().to_string().as_str()),
            ("server_id", config.server_id.to_string().as_str()),
            ("role", config.role.as_str()),
            ("tables", config.tables.len().to_string().as_str()),
        ],
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::super::errors::CliErrorCode;
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(temp_dir: &TempDir, config: Value) -> std::path::PathBuf {
        let config_path = temp_dir.path().join("aerodb-conflict.json");
        fs::write(&config_path, config.to_string()).unwrap();
        config_path
    }

    fn epoch_config() -> ApplierConfig {
        ApplierConfig::from_json(
            &json!({
                "server_id": 1,
                "role": "primary",
                "tables": [{
                    "name": "t1",
                    "conflict_function": "NDB$EPOCH()",
                    "exceptions_table": "default"
                }]
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_check_config_accepts_valid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, json!({"server_id": 1}));
        check_config(&path).unwrap();
    }

    #[test]
    fn test_check_config_rejects_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, json!({"server_id": 0}));
        let err = check_config(&path).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_missing_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = check_config(&temp_dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_simulation_resolves_local_conflict() {
        let input: SimulationInput = serde_json::from_value(json!({
            "epochs": [
                {
                    "origin_server_id": 2,
                    "origin_epoch": 10,
                    "changes": [
                        {"table": "t1", "kind": "insert", "key": [1], "after": {"v": 1}}
                    ]
                },
                {
                    "origin_server_id": 2,
                    "origin_epoch": 11,
                    "local_writes": [
                        {"table": "t1", "key": [1], "values": {"v": 50}}
                    ],
                    "changes": [
                        {"table": "t1", "kind": "update", "key": [1],
                         "before": {"v": 1}, "after": {"v": 2}}
                    ]
                }
            ]
        }))
        .unwrap();

        let report = run_simulation(&epoch_config(), &input).unwrap();
        assert_eq!(report["epochs_applied"], 2);
        assert_eq!(report["commits"], 2);
        assert_eq!(report["exceptions_rows"], 1);
        assert_eq!(
            report["conflict_status"]["total_violation_count"]["ROW_IN_CONFLICT"],
            1
        );
    }

    #[test]
    fn test_simulation_retries_injected_failure() {
        let input: SimulationInput = serde_json::from_value(json!({
            "epochs": [{
                "origin_server_id": 2,
                "origin_epoch": 1,
                "inject_temporary_error": true,
                "changes": [{"table": "t1", "kind": "insert", "key": [1], "after": {"v": 1}}]
            }]
        }))
        .unwrap();

        let report = run_simulation(&epoch_config(), &input).unwrap();
        assert_eq!(report["attempts"], 2);
        assert_eq!(report["commits"], 1);
    }

    #[test]
    fn test_simulation_reports_malformed_event() {
        let input: SimulationInput = serde_json::from_value(json!({
            "epochs": [{
                "origin_server_id": 2,
                "origin_epoch": 1,
                "changes": [{"table": "t1", "kind": "insert", "key": [1],
                             "after": {"v": 1}, "any_value": 2147483649u64}]
            }]
        }))
        .unwrap();

        let err = run_simulation(&epoch_config(), &input).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::InputError);
    }
}
