// src/main.rs

use std::process::ExitCode;

use runjob::cli::{self, CliCommand};
use runjob::{logging, shepherd};

fn main() -> ExitCode {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("runjob: logging setup failed: {err:?}");
        return ExitCode::FAILURE;
    }

    match args.command {
        CliCommand::Shepherd(shepherd_args) => shepherd::run(shepherd_args),
    }
}
