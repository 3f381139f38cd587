// src/shepherd.rs

//! The shepherd: supervisor half of the `runjob` helper binary.
//!
//! A shepherd hosts the exec helper for one command, against a rendezvous
//! directory owned by the controlling process. On failure it writes the
//! formatted report to the die-file, then exits hard; it never unwinds into
//! library cleanup, so resources owned by the controller are not torn down a
//! second time from here.

use std::process::ExitCode;

use tracing::{debug, error};

use crate::cli::ShepherdArgs;
use crate::exec::{self, ExecRequest};
use crate::report::{self, ReportContext};
use crate::sink::{InputSpec, OutputSpec};
use crate::status;

/// Entry point for `runjob shepherd`.
pub fn run(args: ShepherdArgs) -> ExitCode {
    if args.import_pbs_env {
        import_pbs_environment();
    }

    let out_path = args
        .out_file
        .clone()
        .unwrap_or_else(|| status::default_out_path(&args.temp_dir));
    let err_path = args
        .err_file
        .clone()
        .unwrap_or_else(|| status::default_err_path(&args.temp_dir));

    let mut stdin = match &args.in_file {
        Some(p) => InputSpec::Path(p.clone()),
        None => InputSpec::None,
    };
    let mut stdout = OutputSpec::Path(out_path.clone());
    let mut stderr = if args.merge_err {
        OutputSpec::MergeWithStdout
    } else {
        OutputSpec::Path(err_path.clone())
    };

    let result = exec::run_redirected(ExecRequest {
        command: &args.command,
        stdin: &mut stdin,
        stdout: &mut stdout,
        stderr: &mut stderr,
        tempdir: &args.temp_dir,
        working_dir: args.work_dir.as_deref(),
    });

    match result {
        Ok(record) => {
            debug!(command = ?args.command, exit = record.exit_code, "shepherded job finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let record = status::read(&args.temp_dir).unwrap_or_default();
            let report = report::format_failure(
                &e.to_string(),
                &ReportContext {
                    command: Some(&args.command),
                    start_time: record.start,
                    out_path: Some(&out_path),
                    err_path: if args.merge_err {
                        Some(&out_path)
                    } else {
                        Some(&err_path)
                    },
                    ..ReportContext::default()
                },
            );
            if let Err(write_err) = status::write_die(&args.temp_dir, &report) {
                error!(error = %write_err, "could not write die-file");
            }
            error!(command = ?args.command, error = %e, "shepherded job failed");
            ExitCode::FAILURE
        }
    }
}

/// Mirror `PBS_O_<NAME>` variables to `<NAME>`, so the job sees the
/// environment it was submitted from.
fn import_pbs_environment() {
    let mirrored: Vec<(String, String)> = std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix("PBS_O_")
                .map(|name| (name.to_string(), value))
        })
        .collect();
    for (name, value) in mirrored {
        std::env::set_var(name, value);
    }
}
