// src/backend/cluster.rs

//! Cluster backend: submit through `qsub`, observe through the cached
//! `qstat` view, cancel through `qdel`.
//!
//! The submission artifact is a small driver script that re-enters the
//! `runjob` helper on the compute node with the same rendezvous directory
//! the submitter watches; the helper binary must be installed on the nodes.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::backend::shepherd_binary;
use crate::errors::{Result, RunjobError};
use crate::job::JobHandle;
use crate::report;
use crate::sink::OutputSpec;
use crate::status;
use crate::tempdir;

const DRIVER_FILE: &str = "driver.sh";
const SUBMIT_ATTEMPTS: u32 = 4;
const SUBMIT_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// qstat job states that mean "the scheduler still tracks this job".
const LIVE_STATES: [&str; 3] = ["r", "q", "e"];

/// Test hook: when set, its value replaces the next real qsub output, once.
const FORCE_QSUB_ENV: &str = "CXGN_TOOLS_RUN_FORCE_QSUB_FAILURE";

pub(crate) fn start(handle: &mut JobHandle) -> Result<()> {
    find_in_path("qsub").ok_or_else(|| {
        RunjobError::Scheduler("qsub not found in PATH; cannot submit cluster jobs".to_string())
    })?;

    let tempdir = handle.ensure_tempdir()?;

    // Serializability was checked by the options; what remains is making
    // sure every involved path is actually visible from the compute nodes.
    let settings = handle.ctx.settings().clone();
    check_cluster_visible(&settings.accessible_prefixes, &tempdir, "tempdir")?;
    let out_path = handle
        .out_path()
        .unwrap_or_else(|| status::default_out_path(&tempdir));
    let err_merged = matches!(handle.stderr, OutputSpec::MergeWithStdout);
    let err_path = handle
        .err_path()
        .unwrap_or_else(|| status::default_err_path(&tempdir));
    check_cluster_visible(&settings.accessible_prefixes, &out_path, "out_file")?;
    check_cluster_visible(&settings.accessible_prefixes, &err_path, "err_file")?;
    if let Some(dir) = &handle.working_dir {
        check_cluster_visible(&settings.accessible_prefixes, dir, "working_dir")?;
    }
    if let Some(p) = handle.stdin.path() {
        check_cluster_visible(&settings.accessible_prefixes, p, "in_file")?;
    }

    let driver = write_driver(handle, &tempdir, &out_path, err_merged, &err_path)?;

    wait_for_admission(handle)?;

    let job_name = tempdir::job_name_from_command(&handle.command);
    let mut qsub_args: Vec<String> = vec![
        "-V".into(),
        "-r".into(),
        "n".into(),
        "-o".into(),
        "/dev/null".into(),
        "-e".into(),
        err_path.display().to_string(),
        "-N".into(),
        job_name,
    ];
    if let Some(dir) = &handle.working_dir {
        qsub_args.push("-d".into());
        qsub_args.push(dir.display().to_string());
    }
    if let Some(queue) = &handle.queue {
        qsub_args.push("-q".into());
        qsub_args.push(queue.clone());
    }
    if let Some(request) = handle.resources.to_request_string() {
        qsub_args.push("-l".into());
        qsub_args.push(request);
    }
    qsub_args.push(driver.display().to_string());

    let job_id = submit_with_retries(&qsub_args)?;
    debug!(job_id = %job_id, command = ?handle.command, "cluster job submitted");

    handle.ctx.qstat().invalidate();
    handle.job_id = Some(job_id);
    Ok(())
}

/// Whether the scheduler still tracks the job as running/queued/ending.
pub(crate) fn probe(handle: &mut JobHandle) -> Result<bool> {
    let Some(job_id) = handle.job_id.clone() else {
        return Ok(false);
    };
    let ttl = Duration::from_secs(handle.ctx.settings().qstat_cache_secs);
    let state = handle.ctx.qstat().job_state(ttl, &job_id)?;
    Ok(matches!(state.as_deref(), Some(s) if LIVE_STATES.contains(&s)))
}

/// Poll the scheduler until it stops tracking the job.
pub(crate) fn wait(handle: &mut JobHandle) -> Result<()> {
    let pause = Duration::from_secs(handle.ctx.settings().cluster_poll_secs.max(1));
    while probe(handle)? {
        std::thread::sleep(pause);
    }
    Ok(())
}

/// `qdel`, re-`qdel` after 3 s, fatal after 7 more seconds.
pub(crate) fn kill(handle: &mut JobHandle) -> Result<bool> {
    let Some(job_id) = handle.job_id.clone() else {
        return Ok(true);
    };

    let first = run_qdel(&job_id)?;
    std::thread::sleep(Duration::from_secs(3));
    handle.ctx.qstat().invalidate();
    if !probe(handle)? {
        return Ok(true);
    }

    let second = run_qdel(&job_id)?;
    std::thread::sleep(Duration::from_secs(7));
    handle.ctx.qstat().invalidate();
    if !probe(handle)? {
        return Ok(true);
    }

    Err(RunjobError::Scheduler(format!(
        "job {job_id} survived two qdel attempts; qdel said: {}",
        format!("{first} {second}").trim()
    )))
}

/// Wrap a node-side failure report with submitter-side context: the job id,
/// PBS warnings from the error sink, and a `qstat -f` dump.
pub(crate) fn augment_failure(handle: &JobHandle, report: String) -> String {
    let Some(job_id) = handle.job_id.as_deref() else {
        return report;
    };
    let dump = qstat_dump(job_id);
    report::wrap_cluster_failure(
        &report,
        job_id,
        handle.err_path().as_deref(),
        dump.as_deref(),
    )
}

/// Block until the scheduler's queue is below the admission threshold,
/// warning once per process.
fn wait_for_admission(handle: &mut JobHandle) -> Result<()> {
    let settings = handle.ctx.settings();
    let ttl = Duration::from_secs(settings.qstat_cache_secs);
    let backoff_max = settings.overload_backoff_max_secs.max(1);

    loop {
        let queued = handle.ctx.qstat().job_count(ttl)?;
        if queued < handle.max_cluster_jobs {
            return Ok(());
        }
        if handle.ctx.first_overload_warning() {
            warn!(
                queued,
                threshold = handle.max_cluster_jobs,
                "cluster is busy; holding submissions until the queue drains"
            );
        }
        let pause = rand::thread_rng().gen_range(0..=backoff_max);
        debug!(queued, pause_secs = pause, "admission re-check scheduled");
        std::thread::sleep(Duration::from_secs(pause));
    }
}

/// Write the self-contained driver script into the rendezvous directory.
///
/// The script mirrors `PBS_O_*` into the job environment (via the helper's
/// `--import-pbs-env`) and re-runs the command against the same rendezvous,
/// so the node writes status/die/out/err exactly where the submitter looks.
fn write_driver(
    handle: &JobHandle,
    tempdir: &Path,
    out_path: &Path,
    err_merged: bool,
    err_path: &Path,
) -> Result<PathBuf> {
    let mut invocation: Vec<String> = vec![
        shepherd_binary().display().to_string(),
        "shepherd".into(),
        "--import-pbs-env".into(),
        "--temp-dir".into(),
        tempdir.display().to_string(),
        "--out-file".into(),
        out_path.display().to_string(),
    ];
    if err_merged {
        invocation.push("--merge-err".into());
    } else {
        invocation.push("--err-file".into());
        invocation.push(err_path.display().to_string());
    }
    if let Some(p) = handle.stdin.path() {
        invocation.push("--in-file".into());
        invocation.push(p.display().to_string());
    }
    if let Some(dir) = &handle.working_dir {
        invocation.push("--work-dir".into());
        invocation.push(dir.display().to_string());
    }
    invocation.push("--".into());
    invocation.extend(handle.command.iter().cloned());

    let quoted: Vec<String> = invocation.iter().map(|a| shell_quote(a)).collect();
    let script = format!("#!/bin/sh\nexec {}\n", quoted.join(" "));

    let path = tempdir.join(DRIVER_FILE);
    fs::write(&path, script)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Run qsub (or consume the forced-output test hook) until a job id parses,
/// with bounded retries.
fn submit_with_retries(qsub_args: &[String]) -> Result<String> {
    let mut last_output = String::new();
    for attempt in 1..=SUBMIT_ATTEMPTS {
        let output = submission_output(qsub_args)?;
        if let Some(id) = parse_job_id(&output) {
            return Ok(id);
        }
        last_output = output;
        warn!(
            attempt,
            output = %last_output.trim(),
            "qsub output did not contain a job id"
        );
        if attempt < SUBMIT_ATTEMPTS {
            std::thread::sleep(SUBMIT_RETRY_PAUSE);
        }
    }
    Err(RunjobError::Scheduler(format!(
        "no job id in qsub output after {SUBMIT_ATTEMPTS} attempts; last output: {}",
        last_output.trim()
    )))
}

fn submission_output(qsub_args: &[String]) -> Result<String> {
    if let Ok(forced) = std::env::var(FORCE_QSUB_ENV) {
        std::env::remove_var(FORCE_QSUB_ENV);
        debug!(output = %forced, "using forced qsub output");
        return Ok(forced);
    }

    let output = Command::new("qsub")
        .args(qsub_args)
        .output()
        .map_err(|e| RunjobError::Scheduler(format!("could not run qsub: {e}")))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// First line shaped like a Torque job id, e.g. `123.torque.example.org`.
fn parse_job_id(output: &str) -> Option<String> {
    let re = job_id_re();
    output
        .lines()
        .map(str::trim)
        .find(|line| re.is_match(line))
        .map(str::to_string)
}

fn job_id_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.[A-Za-z0-9-]+)+$").expect("static regex"))
}

fn run_qdel(job_id: &str) -> Result<String> {
    let output = Command::new("qdel")
        .arg(job_id)
        .output()
        .map_err(|e| RunjobError::Scheduler(format!("could not run qdel: {e}")))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

fn qstat_dump(job_id: &str) -> Option<String> {
    let output = Command::new("qstat").args(["-f", job_id]).output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Check that `path` is reachable from the compute nodes: under one of the
/// configured prefixes, optionally below a `/net/<host>` automount.
fn check_cluster_visible(prefixes: &[PathBuf], path: &Path, what: &str) -> Result<()> {
    let mut candidate = path.to_path_buf();

    // Strip a `/net/<host>` prefix when present.
    let components: Vec<_> = path.components().collect();
    if components.len() > 2 {
        if let std::path::Component::Normal(first) = components[1] {
            if first == "net" {
                let rest: PathBuf = components[..1]
                    .iter()
                    .chain(components[3..].iter())
                    .collect();
                candidate = rest;
            }
        }
    }

    if prefixes.iter().any(|pre| candidate.starts_with(pre)) {
        return Ok(());
    }

    Err(RunjobError::Usage(format!(
        "{what} '{}' is not on a cluster-visible filesystem (expected a path under one of: {})",
        path.display(),
        prefixes
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Single-quote `arg` for `/bin/sh`.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
