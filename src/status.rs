// src/status.rs

//! The rendezvous file protocol.
//!
//! Inside every job tempdir:
//!
//! - `status`: `key:value` lines written by the exec helper. `start:<unix>`
//!   first, then `end:<unix>`, `ret:<raw_status>`, `host:<name>` after the
//!   child exits.
//! - `died`: present iff the job failed; holds the formatted error report.
//! - `out`, `err`: default stdout/stderr sinks.
//!
//! Writers write whole lines and close; readers only read after observing
//! termination, so no locking is needed. The die-file probe lists the
//! directory before touching the file, which defeats positive NFS attribute
//! caches on shared filesystems.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::Result;

pub const STATUS_FILE: &str = "status";
pub const DIE_FILE: &str = "died";
pub const OUT_FILE: &str = "out";
pub const ERR_FILE: &str = "err";

/// Everything the exec helper records about one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRecord {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub raw_status: Option<i32>,
    pub host: Option<String>,
}

impl StatusRecord {
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }
}

/// Exit value encoded in a raw wait status.
pub fn exit_code_from_raw(raw: i32) -> i32 {
    (raw >> 8) & 0xff
}

/// Terminating signal encoded in a raw wait status, if any.
pub fn signal_from_raw(raw: i32) -> Option<i32> {
    let sig = raw & 0x7f;
    (sig != 0).then_some(sig)
}

pub fn status_path(tempdir: &Path) -> PathBuf {
    tempdir.join(STATUS_FILE)
}

pub fn die_path(tempdir: &Path) -> PathBuf {
    tempdir.join(DIE_FILE)
}

pub fn default_out_path(tempdir: &Path) -> PathBuf {
    tempdir.join(OUT_FILE)
}

pub fn default_err_path(tempdir: &Path) -> PathBuf {
    tempdir.join(ERR_FILE)
}

/// Start a fresh status file containing only the start stamp.
pub fn write_start(tempdir: &Path, start: i64) -> Result<()> {
    fs::write(status_path(tempdir), format!("start:{start}\n"))?;
    Ok(())
}

/// Append the end-of-run records.
pub fn append_finish(tempdir: &Path, end: i64, raw_status: i32, host: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(status_path(tempdir))?;
    write!(file, "end:{end}\nret:{raw_status}\nhost:{host}\n")?;
    Ok(())
}

/// Read whatever the status file currently holds. An absent file yields an
/// empty record: the job has not started writing yet.
pub fn read(tempdir: &Path) -> Result<StatusRecord> {
    let path = status_path(tempdir);
    let text = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StatusRecord::default()),
        Err(e) => return Err(e.into()),
    };
    Ok(parse(&text))
}

fn parse(text: &str) -> StatusRecord {
    let mut record = StatusRecord::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "start" => record.start = value.trim().parse().ok(),
            "end" => record.end = value.trim().parse().ok(),
            "ret" => record.raw_status = value.trim().parse().ok(),
            "host" => record.host = Some(value.trim().to_string()),
            _ => {}
        }
    }
    record
}

/// Record a failure message; its existence is the canonical failure signal.
pub fn write_die(tempdir: &Path, message: &str) -> Result<()> {
    fs::write(die_path(tempdir), message)?;
    Ok(())
}

/// Look for the die-file and return its contents if present.
///
/// The directory is scanned first so the lookup sees entries created on
/// another host even when this host's NFS attribute cache is stale.
pub fn probe_die(tempdir: &Path) -> Result<Option<String>> {
    let mut present = false;
    match fs::read_dir(tempdir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                if entry.file_name() == DIE_FILE {
                    present = true;
                    break;
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if !present {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(die_path(tempdir))?))
}
