//! CLI argument definitions using clap
//!
//! Commands:
//! - aerodb-conflict simulate --config <path> --input <path>
//! - aerodb-conflict check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Conflict detection and resolution for multi-master replication
#[derive(Parser, Debug)]
#[command(name = "aerodb-conflict")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply epochs of changes against an in-memory engine and print the status
    Simulate {
        /// Path to configuration file
        #[arg(long, default_value = "./aerodb-conflict.json")]
        config: PathBuf,

        /// Simulation input file, or "-" for stdin
        #[arg(long)]
        input: PathBuf,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aerodb-conflict.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
