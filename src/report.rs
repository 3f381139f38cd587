// src/report.rs

//! Human-oriented failure reports.
//!
//! Every surfaced error goes through [`format_failure`], which assembles a
//! multi-line report with a `runjob: ` tag on every line: timings, the
//! command, the inner error, and the last lines of any file-backed sinks.
//! Cluster failures additionally lead with the job id, repeat any PBS
//! resource-manager warnings found in the error sink, and append a
//! `qstat -f` dump for context.

use std::fs;
use std::path::Path;

use chrono::{Local, TimeZone};

const TAG: &str = "runjob";
const TAIL_LINES: usize = 20;

/// Inputs to one failure report. All fields are optional except the error
/// text; absent fields simply drop their lines.
#[derive(Debug, Default)]
pub struct ReportContext<'a> {
    pub command: Option<&'a [String]>,
    pub start_time: Option<i64>,
    pub out_path: Option<&'a Path>,
    pub err_path: Option<&'a Path>,
    pub job_id: Option<&'a str>,
    pub qstat_dump: Option<&'a str>,
}

/// Build the tagged multi-line report for `error_text`.
pub fn format_failure(error_text: &str, ctx: &ReportContext<'_>) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(job_id) = ctx.job_id {
        lines.push(format!("cluster job id: {job_id}"));
        if let Some(err_path) = ctx.err_path {
            for warning in pbs_warnings(err_path) {
                lines.push(warning);
            }
        }
    }

    if let Some(start) = ctx.start_time {
        lines.push(format!("start time: {}", format_local(start)));
    }
    lines.push(format!("current time: {}", format_local(now_unix())));

    if let Some(command) = ctx.command {
        lines.push(format!("command: {}", command.join(" ")));
    }

    let inner = error_text.trim_end_matches(['.', '!', '\n', ' ']);
    for line in inner.lines() {
        lines.push(format!("error: {line}"));
    }

    if let Some(err_path) = ctx.err_path {
        lines.push("last few lines of stderr:".to_string());
        push_tail(&mut lines, err_path);
    }
    if let Some(out_path) = ctx.out_path {
        lines.push("last few lines of stdout:".to_string());
        push_tail(&mut lines, out_path);
    }

    if let Some(dump) = ctx.qstat_dump {
        lines.push("scheduler state:".to_string());
        for line in dump.lines() {
            lines.push(format!("  {line}"));
        }
    }

    let mut report = String::new();
    for line in lines {
        report.push_str(TAG);
        report.push_str(": ");
        report.push_str(&line);
        report.push('\n');
    }
    report
}

/// Add submitter-side context around a failure report a cluster node wrote:
/// the job id first, then any PBS warnings from the error sink, the report
/// itself verbatim (it already carries its tags), and the scheduler dump.
pub fn wrap_cluster_failure(
    report: &str,
    job_id: &str,
    err_path: Option<&Path>,
    qstat_dump: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("{TAG}: cluster job id: {job_id}\n"));
    if let Some(err_path) = err_path {
        for warning in pbs_warnings(err_path) {
            out.push_str(&format!("{TAG}: {warning}\n"));
        }
    }
    out.push_str(report);
    if !report.ends_with('\n') {
        out.push('\n');
    }
    if let Some(dump) = qstat_dump {
        out.push_str(&format!("{TAG}: scheduler state:\n"));
        for line in dump.lines() {
            out.push_str(&format!("{TAG}:   {line}\n"));
        }
    }
    out
}

/// Last `n` lines of a file, or a placeholder when it cannot be read.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let all: Vec<&str> = text.lines().collect();
            let from = all.len().saturating_sub(n);
            all[from..].iter().map(|s| s.to_string()).collect()
        }
        Err(e) => vec![format!("(could not read {}: {})", path.display(), e)],
    }
}

fn push_tail(lines: &mut Vec<String>, path: &Path) {
    for line in tail_lines(path, TAIL_LINES) {
        lines.push(format!("  {line}"));
    }
}

/// PBS resource-manager warnings the scheduler wrote into the error sink,
/// e.g. `=>> PBS: job killed: vmem exceeded`.
fn pbs_warnings(err_path: &Path) -> Vec<String> {
    match fs::read_to_string(err_path) {
        Ok(text) => text
            .lines()
            .filter(|l| l.starts_with("=>> PBS:"))
            .map(|l| l.to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn format_local(unix: i64) -> String {
    match Local.timestamp_opt(unix, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        None => format!("(unix {unix})"),
    }
}

fn now_unix() -> i64 {
    crate::sys::unix_now()
}
