// src/backend/background.rs

//! Background backend: the job runs under a local shepherd process.
//!
//! The shepherd is the `runjob` helper binary. It hosts the exec helper,
//! writes the die-file when the command fails, and exits hard, so nothing in
//! the controller's address space is shared or torn down twice. The
//! controller keeps the shepherd's PID; liveness is a reap of the held child
//! or, for resumed handles, a signal-0 probe.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::backend::shepherd_binary;
use crate::errors::{Result, RunjobError};
use crate::job::JobHandle;
use crate::sink::{InputSpec, OutputSpec};
use crate::status;

/// Signals tried by [`kill`], gentlest first.
const KILL_SEQUENCE: [Signal; 4] = [
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGKILL,
];

const KILL_PAUSE: Duration = Duration::from_secs(1);
const WAIT_POLL: Duration = Duration::from_millis(500);

pub(crate) fn start(handle: &mut JobHandle) -> Result<()> {
    validate_sinks(handle)?;

    // The tempdir must exist before the spawn so both processes rendezvous
    // on the same path.
    let tempdir = handle.ensure_tempdir()?;
    spool_stdin(handle, &tempdir)?;

    let out_path = handle
        .out_path()
        .unwrap_or_else(|| status::default_out_path(&tempdir));
    let err_merged = matches!(handle.stderr, OutputSpec::MergeWithStdout);
    let err_path = handle
        .err_path()
        .unwrap_or_else(|| status::default_err_path(&tempdir));

    let mut cmd = Command::new(shepherd_binary());
    cmd.arg("shepherd")
        .arg("--temp-dir")
        .arg(&tempdir)
        .arg("--out-file")
        .arg(&out_path);
    if err_merged {
        cmd.arg("--merge-err");
    } else {
        cmd.arg("--err-file").arg(&err_path);
    }
    if let Some(p) = handle.stdin.path() {
        cmd.arg("--in-file").arg(p);
    }
    if let Some(dir) = &handle.working_dir {
        cmd.arg("--work-dir").arg(dir);
    }
    cmd.arg("--").args(&handle.command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let child = cmd.spawn().map_err(|e| {
        RunjobError::Setup(format!(
            "could not spawn shepherd '{}': {} (is the runjob helper installed?)",
            shepherd_binary().display(),
            e
        ))
    })?;

    handle.pid = Some(child.id());
    handle.child = Some(child);
    debug!(pid = handle.pid, command = ?handle.command, "background job started");
    Ok(())
}

/// Non-blocking liveness check of the shepherd.
pub(crate) fn probe(handle: &mut JobHandle) -> Result<bool> {
    if let Some(child) = &mut handle.child {
        return match child.try_wait()? {
            Some(_) => {
                handle.child = None;
                Ok(false)
            }
            None => Ok(true),
        };
    }
    let Some(pid) = handle.pid else {
        return Ok(false);
    };
    if !pid_alive(pid) {
        return Ok(false);
    }
    // A signal-addressable PID can still be a leftover zombie or a recycled
    // id; once the rendezvous records an end, that is authoritative.
    if let Some(td) = handle.tempdir_path() {
        let record = status::read(td)?;
        if record.is_finished() || status::probe_die(td)?.is_some() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Block until the shepherd is gone.
pub(crate) fn wait(handle: &mut JobHandle) -> Result<()> {
    if let Some(child) = &mut handle.child {
        let _ = child.wait()?;
        handle.child = None;
        return Ok(());
    }
    // Resumed handle: the shepherd is not our child, so poll.
    while probe(handle)? {
        std::thread::sleep(WAIT_POLL);
    }
    Ok(())
}

/// Escalating kill: QUIT, INT, TERM, KILL with a pause and a reap between
/// attempts. Returns whether the shepherd is gone afterwards.
///
/// The first three are forwarded to the command by the shepherd's signal
/// handlers; SIGKILL only falls on the shepherd itself and is a last resort.
pub(crate) fn kill(handle: &mut JobHandle) -> Result<bool> {
    let Some(pid) = handle.pid else {
        return Ok(true);
    };

    for sig in KILL_SEQUENCE {
        if !probe(handle)? {
            break;
        }
        debug!(pid, signal = %sig, "signalling background job");
        let _ = signal::kill(Pid::from_raw(pid as i32), sig);
        std::thread::sleep(KILL_PAUSE);
        let _ = probe(handle)?;
    }

    Ok(!probe(handle)?)
}

fn pid_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn validate_sinks(handle: &JobHandle) -> Result<()> {
    for (name, spec) in [("out_file", &handle.stdout), ("err_file", &handle.stderr)] {
        let ok = spec.is_serializable() || matches!(spec, OutputSpec::MergeWithStdout);
        if !ok {
            return Err(RunjobError::Usage(format!(
                "background jobs cannot send {name} to a {} sink; use a file path",
                spec.describe()
            )));
        }
    }
    if matches!(handle.stdin, InputSpec::Stream(_)) {
        return Err(RunjobError::Usage(
            "background jobs cannot take stdin from a live stream; use a file path".to_string(),
        ));
    }
    Ok(())
}

/// Bytes/chunks/producer stdin is materialized into `<tempdir>/in` before
/// the spawn, then handed to the shepherd as a plain path.
fn spool_stdin(handle: &mut JobHandle, tempdir: &Path) -> Result<()> {
    let spool = tempdir.join("in");
    let data: Vec<u8> = match &mut handle.stdin {
        InputSpec::None | InputSpec::Path(_) => return Ok(()),
        InputSpec::Bytes(bytes) => std::mem::take(bytes),
        InputSpec::Chunks(chunks) => chunks.drain(..).flatten().collect(),
        InputSpec::Producer(producer) => {
            let mut all = Vec::new();
            while let Some(chunk) = producer() {
                all.extend(chunk);
            }
            all
        }
        InputSpec::Stream(_) => return Ok(()), // rejected earlier
    };
    std::fs::write(&spool, data)?;
    handle.stdin = InputSpec::Path(spool);
    Ok(())
}
