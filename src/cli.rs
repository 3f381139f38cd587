// src/cli.rs

//! CLI argument parsing for the `runjob` helper binary using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for the `runjob` helper.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "runjob",
    version,
    about = "Helper process for the runjob supervision library.",
    long_about = None
)]
pub struct Cli {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RUNJOB_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Supervise one command against a rendezvous directory: run it with the
    /// given redirections, record status, write the die-file on failure.
    ///
    /// This is what background jobs fork and what cluster driver scripts
    /// exec on the compute node; it is not meant to be typed by hand.
    Shepherd(ShepherdArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ShepherdArgs {
    /// Rendezvous directory shared with the controlling process.
    #[arg(long, value_name = "DIR")]
    pub temp_dir: PathBuf,

    /// File to feed the command on stdin.
    #[arg(long, value_name = "PATH")]
    pub in_file: Option<PathBuf>,

    /// File capturing stdout. Defaults to `out` inside the rendezvous.
    #[arg(long, value_name = "PATH")]
    pub out_file: Option<PathBuf>,

    /// File capturing stderr. Defaults to `err` inside the rendezvous.
    #[arg(long, value_name = "PATH", conflicts_with = "merge_err")]
    pub err_file: Option<PathBuf>,

    /// Send stderr to the stdout sink.
    #[arg(long)]
    pub merge_err: bool,

    /// Directory to run the command in.
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Mirror every `PBS_O_<NAME>` environment variable to `<NAME>` before
    /// running (batch schedulers stash the submitter's environment there).
    #[arg(long)]
    pub import_pbs_env: bool,

    /// The command to run.
    #[arg(trailing_var_arg = true, required = true, value_name = "CMD")]
    pub command: Vec<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `Cli::parse()`.
pub fn parse() -> Cli {
    Cli::parse()
}
