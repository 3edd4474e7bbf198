//! CLI definitions for hydro-runtime.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hydro_runtime::config::DEFAULT_CONFIG_FILE;

#[derive(Debug, Parser)]
#[command(
    name = "hydro-runtime",
    version,
    about = "Hydroponics controller runtime",
    after_help = "Examples:\n  hydro-runtime run --program nightly-dose\n  hydro-runtime ping --controller rack-1\n  hydro-runtime validate --config ./hydro.toml --program nightly-dose"
)]
pub struct Cli {
    /// Log at debug level.
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one program to completion (Ctrl-C stops it).
    Run {
        /// Runtime configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Program id (`<program_dir>/<id>.json`).
        #[arg(long)]
        program: String,
    },
    /// Health-check one controller.
    Ping {
        /// Runtime configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Controller id.
        #[arg(long)]
        controller: String,
    },
    /// Check the configuration and optionally a program.
    Validate {
        /// Runtime configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Program id to load and validate.
        #[arg(long)]
        program: Option<String>,
    },
}
