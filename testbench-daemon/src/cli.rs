//! CLI argument definitions for testbench-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Hardware test sequence runner.
///
/// Loads a sequence definition, runs it against the configured instrument
/// backend and reports progress as it goes.
#[derive(Parser, Debug)]
#[command(name = "testbench-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to testbench.toml configuration file.
    ///
    /// A missing file is only accepted for the default path, in which case
    /// built-in defaults apply.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Sequence definition to run (.json or .toml).
    #[arg(short, long, required_unless_present = "validate")]
    pub sequence: Option<PathBuf>,

    /// Append progress events as JSON lines to this file.
    #[arg(long)]
    pub events: Option<PathBuf>,

    /// Print progress events as JSON lines on stdout.
    #[arg(long)]
    pub stream: bool,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate the configuration (and the sequence, if given) and exit.
    #[arg(long)]
    pub validate: bool,
}

pub const DEFAULT_CONFIG_PATH: &str = "testbench.toml";
