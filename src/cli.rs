//! Command-Line Interface (CLI) argument parsing.
//!
//! The arguments are parsed at startup with `clap` and merged into the
//! layered configuration last, so a flag always wins over the TOML file
//! and the environment.

use clap::Parser;
use std::path::PathBuf;

/// A relay that forwards broker messages as SMS alerts.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Broker WebSocket endpoint, overriding the configured one.
    #[arg(long, value_name = "URI")]
    pub endpoint: Option<String>,

    /// Topic to subscribe to, overriding the configured one.
    #[arg(long, value_name = "TOPIC")]
    pub topic: Option<String>,

    /// Parse and log alerts without calling the SMS provider.
    #[arg(long)]
    pub dry_run: bool,
}
