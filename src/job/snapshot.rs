// src/job/snapshot.rs

//! Persistable handle state.
//!
//! A controlling process can snapshot a handle, write it to disk, and a
//! successor process can reload it and keep observing the same job: liveness
//! probing works from the recorded PID / scheduler id, and the rendezvous
//! directory still carries status, die-file, and sinks. Memory and stream
//! sinks cannot cross a process boundary, so snapshotting a handle that uses
//! them is a usage error.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterResources;
use crate::context::RunContext;
use crate::errors::{Result, RunjobError};
use crate::job::{JobHandle, JobMode};
use crate::sink::{InputSpec, OutputSpec};
use crate::tempdir::Tempdir;

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume observation of a job from another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(rename = "v")]
    pub version: u32,
    pub mode: JobMode,
    pub command: Vec<String>,
    /// `None` means no input was given.
    pub stdin_path: Option<PathBuf>,
    /// `None` means the rendezvous default sink.
    pub out_path: Option<PathBuf>,
    pub err_path: Option<PathBuf>,
    pub err_merged: bool,
    pub working_dir: Option<PathBuf>,
    pub tempdir: Option<PathBuf>,
    pub tempdir_owned: bool,
    pub raise_error: bool,
    pub die_on_destroy: bool,
    pub completion_fired: bool,
    pub told_to_die: bool,
    pub pid: Option<u32>,
    pub job_id: Option<String>,
    pub queue: Option<String>,
    pub resources: ClusterResources,
    pub max_cluster_jobs: usize,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub host: Option<String>,
    pub raw_status: Option<i32>,
    pub exit_status: Option<i32>,
    pub error_string: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub finished: bool,
}

impl JobHandle {
    /// Capture the handle's essential state.
    pub fn snapshot(&self) -> Result<JobSnapshot> {
        let stdin_path = match &self.stdin {
            InputSpec::None => None,
            InputSpec::Path(p) => Some(p.clone()),
            other => {
                return Err(RunjobError::Usage(format!(
                    "cannot serialize a handle whose stdin is a {} source",
                    other.describe()
                )))
            }
        };
        let out_path = serializable_sink(&self.stdout, "stdout")?;
        let (err_path, err_merged) = match &self.stderr {
            OutputSpec::MergeWithStdout => (None, true),
            other => (serializable_sink(other, "stderr")?, false),
        };

        Ok(JobSnapshot {
            version: SNAPSHOT_VERSION,
            mode: self.mode,
            command: self.command.clone(),
            stdin_path,
            out_path,
            err_path,
            err_merged,
            working_dir: self.working_dir.clone(),
            tempdir: self.tempdir.as_ref().map(|td| td.path().to_path_buf()),
            tempdir_owned: self.tempdir.as_ref().map(Tempdir::is_owned).unwrap_or(false),
            raise_error: self.raise_error,
            die_on_destroy: self.die_on_destroy,
            completion_fired: self.completion_fired,
            told_to_die: self.told_to_die,
            pid: self.pid,
            job_id: self.job_id.clone(),
            queue: self.queue.clone(),
            resources: self.resources.clone(),
            max_cluster_jobs: self.max_cluster_jobs,
            start_time: self.start_time,
            end_time: self.end_time,
            host: self.host.clone(),
            raw_status: self.raw_status,
            exit_status: self.exit_status,
            error_string: self.error_string.clone(),
            properties: self.properties.clone(),
            finished: self.finished,
        })
    }

    /// Rebuild a handle from a snapshot, optionally against a non-default
    /// context.
    ///
    /// The rendezvous directory is re-attached when it still exists;
    /// otherwise the handle simply reports the recorded terminal state.
    /// Hooks do not survive serialization; re-add them with
    /// [`JobHandle::on_completion`] before polling.
    pub fn from_snapshot(snap: JobSnapshot, ctx: Option<Arc<RunContext>>) -> Result<JobHandle> {
        if snap.version != SNAPSHOT_VERSION {
            return Err(RunjobError::Usage(format!(
                "unsupported job snapshot version {} (expected {})",
                snap.version, SNAPSHOT_VERSION
            )));
        }

        let tempdir = match &snap.tempdir {
            Some(path) if path.is_dir() => Some(Tempdir::resume(path.clone(), snap.tempdir_owned)),
            _ => None,
        };

        let stdin = match snap.stdin_path {
            Some(p) => InputSpec::Path(p),
            None => InputSpec::None,
        };
        let stdout = match snap.out_path {
            Some(p) => OutputSpec::Path(p),
            None => OutputSpec::Default,
        };
        let stderr = if snap.err_merged {
            OutputSpec::MergeWithStdout
        } else {
            match snap.err_path {
                Some(p) => OutputSpec::Path(p),
                None => OutputSpec::Default,
            }
        };

        Ok(JobHandle {
            mode: snap.mode,
            command: snap.command,
            stdin,
            stdout,
            stderr,
            working_dir: snap.working_dir,
            tempdir,
            temp_base: None,
            existing_temp: None,
            raise_error: snap.raise_error,
            die_on_destroy: snap.die_on_destroy,
            hooks: Vec::new(),
            completion_fired: snap.completion_fired,
            told_to_die: snap.told_to_die,
            pid: snap.pid,
            child: None,
            job_id: snap.job_id,
            queue: snap.queue,
            resources: snap.resources,
            max_cluster_jobs: snap.max_cluster_jobs,
            start_time: snap.start_time,
            end_time: snap.end_time,
            host: snap.host,
            raw_status: snap.raw_status,
            exit_status: snap.exit_status,
            error_string: snap.error_string,
            properties: snap.properties,
            ctx: ctx.unwrap_or_else(RunContext::global),
            finished: snap.finished,
        })
    }

    /// Snapshot to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let snap = self.snapshot()?;
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), &snap)?;
        Ok(())
    }

    /// Reload a handle from a JSON file written by [`JobHandle::save`].
    pub fn load(path: impl AsRef<Path>, ctx: Option<Arc<RunContext>>) -> Result<JobHandle> {
        let file = File::open(path.as_ref())?;
        let snap: JobSnapshot = serde_json::from_reader(BufReader::new(file))?;
        JobHandle::from_snapshot(snap, ctx)
    }
}

fn serializable_sink(spec: &OutputSpec, stream: &str) -> Result<Option<PathBuf>> {
    match spec {
        OutputSpec::Default => Ok(None),
        OutputSpec::Path(p) => Ok(Some(p.clone())),
        other => Err(RunjobError::Usage(format!(
            "cannot serialize a handle whose {stream} is a {} sink",
            other.describe()
        ))),
    }
}
