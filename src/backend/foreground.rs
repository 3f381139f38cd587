// src/backend/foreground.rs

//! Foreground backend: run the exec helper synchronously in the calling
//! process. By the time the constructor returns, the job is terminal, its
//! status fields are set, and completion hooks have fired.

use tracing::debug;

use crate::errors::{Result, RunjobError};
use crate::exec::{self, ExecRequest};
use crate::job::JobHandle;
use crate::report::{self, ReportContext};
use crate::sink::OutputSpec;
use crate::status;

pub(crate) fn start(handle: &mut JobHandle) -> Result<()> {
    let tempdir = handle.ensure_tempdir()?;

    // Pin the default sinks to the rendezvous files so they are readable
    // after the run.
    if matches!(handle.stdout, OutputSpec::Default) {
        handle.stdout = OutputSpec::Path(status::default_out_path(&tempdir));
    }
    if matches!(handle.stderr, OutputSpec::Default) {
        handle.stderr = OutputSpec::Path(status::default_err_path(&tempdir));
    }

    let result = exec::run_redirected(ExecRequest {
        command: &handle.command,
        stdin: &mut handle.stdin,
        stdout: &mut handle.stdout,
        stderr: &mut handle.stderr,
        tempdir: &tempdir,
        working_dir: handle.working_dir.as_deref(),
    });

    match result {
        Ok(record) => {
            handle.start_time = Some(record.start);
            handle.end_time = Some(record.end);
            handle.raw_status = Some(record.raw_status);
            handle.exit_status = Some(record.exit_code);
            handle.host = Some(record.host);
            handle.finished = true;
            debug!(command = ?handle.command, exit = record.exit_code, "foreground job finished");
            handle.fire_hooks();
            Ok(())
        }
        Err(e) => {
            // Pick up whatever the exec helper managed to record.
            let record = status::read(&tempdir).unwrap_or_default();
            handle.start_time = record.start;
            handle.end_time = record.end;
            if let Some(raw) = record.raw_status {
                handle.raw_status = Some(raw);
                handle.exit_status = Some(status::exit_code_from_raw(raw));
            }
            handle.host = record.host;
            handle.finished = true;

            let report = report::format_failure(
                &e.to_string(),
                &ReportContext {
                    command: Some(&handle.command),
                    start_time: handle.start_time,
                    out_path: handle.out_path().as_deref(),
                    err_path: handle.err_path().as_deref(),
                    ..ReportContext::default()
                },
            );
            if let Err(write_err) = status::write_die(&tempdir, &report) {
                debug!(error = %write_err, "could not write die-file");
            }
            handle.error_string = Some(report.clone());

            // Foreground jobs notify their hooks even on failure; the caller
            // already holds the full picture in error_string.
            handle.fire_hooks();

            if handle.raise_error {
                Err(RunjobError::Died(report))
            } else {
                Ok(())
            }
        }
    }
}
