//! CLI module
//!
//! Provides command-line interface for:
//! - simulate: Apply epochs of changes over an in-memory engine
//! - check-config: Validate an applier configuration

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{
    check_config, run, run_command, run_simulation, simulate, LocalWrite, SimulatedEpoch,
    SimulationInput,
};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_input, write_error, write_response};
