//! CLI argument definitions for the uploader daemon.

use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Runs the upload engine against a task database and a storage API.
#[derive(Parser, Debug)]
#[command(name = "uploader", version, about)]
pub struct Args {
    /// Path to the task database (created if absent).
    #[arg(long)]
    pub database: PathBuf,

    /// Base URL of the storage API.
    #[arg(long)]
    pub api_base: Url,

    /// Session auth token sent with every call.
    #[arg(long)]
    pub auth: String,

    /// Directory holding pending upload payloads.
    #[arg(long)]
    pub cache_dir: PathBuf,

    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Default tracing directive derived from the quiet/verbose flags.
    ///
    /// `quiet` wins over any number of `-v`s; an explicit `RUST_LOG`
    /// overrides both (handled by the caller).
    #[must_use]
    pub fn log_directive(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}
