// src/job/options.rs

//! Typed construction options for job handles.
//!
//! Option names mirror the constructor option map of the system this library
//! supersedes: `in_file`, `out_file`, `err_file`, `working_dir`, `temp_base`,
//! `existing_temp`, `raise_error`, `die_on_destroy`, `on_completion`,
//! `nodes`, `procs_per_node`, `vmem`, `queue`, `max_cluster_jobs`. Unknown
//! options cannot be expressed at all; invalid combinations are rejected by
//! [`JobOptions::validate`] before anything is spawned.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cluster::ClusterResources;
use crate::context::RunContext;
use crate::errors::{Result, RunjobError};
use crate::job::{CompletionHook, JobHandle, JobMode};
use crate::sink::{InputSpec, OutputSpec};

pub struct JobOptions {
    pub(crate) stdin: InputSpec,
    pub(crate) stdout: OutputSpec,
    pub(crate) stderr: OutputSpec,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) temp_base: Option<PathBuf>,
    pub(crate) existing_temp: Option<PathBuf>,
    pub(crate) raise_error: bool,
    pub(crate) die_on_destroy: bool,
    pub(crate) hooks: Vec<CompletionHook>,
    pub(crate) queue: Option<String>,
    pub(crate) resources: ClusterResources,
    pub(crate) max_cluster_jobs: Option<usize>,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) context: Option<Arc<RunContext>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            stdin: InputSpec::None,
            stdout: OutputSpec::Default,
            stderr: OutputSpec::Default,
            working_dir: None,
            temp_base: None,
            existing_temp: None,
            raise_error: true,
            die_on_destroy: false,
            hooks: Vec::new(),
            queue: None,
            resources: ClusterResources::default(),
            max_cluster_jobs: None,
            properties: BTreeMap::new(),
            context: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the command reads on stdin.
    pub fn in_file(mut self, spec: InputSpec) -> Self {
        self.stdin = spec;
        self
    }

    /// Where stdout goes. Defaults to `out` inside the job tempdir.
    pub fn out_file(mut self, spec: OutputSpec) -> Self {
        self.stdout = spec;
        self
    }

    /// Where stderr goes. Defaults to `err` inside the job tempdir.
    pub fn err_file(mut self, spec: OutputSpec) -> Self {
        self.stderr = spec;
        self
    }

    /// Absolute directory the command runs in.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Override the base under which this job's tempdir is created.
    pub fn temp_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.temp_base = Some(base.into());
        self
    }

    /// Adopt a caller-owned rendezvous directory instead of creating one.
    /// Cleanup will never delete it.
    pub fn existing_temp(mut self, dir: impl Into<PathBuf>) -> Self {
        self.existing_temp = Some(dir.into());
        self
    }

    /// Surface failures as errors (`true`, the default) or store them in
    /// `error_string` only.
    pub fn raise_error(mut self, raise: bool) -> Self {
        self.raise_error = raise;
        self
    }

    /// Kill the job when the handle is dropped.
    pub fn die_on_destroy(mut self, die: bool) -> Self {
        self.die_on_destroy = die;
        self
    }

    /// Add a completion hook. May be called repeatedly; hooks run in
    /// insertion order.
    pub fn on_completion(mut self, hook: impl FnMut(&mut JobHandle) + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Cluster node count.
    pub fn nodes(mut self, nodes: u32) -> Self {
        self.resources.nodes = Some(nodes);
        self
    }

    /// Cluster processors per node.
    pub fn procs_per_node(mut self, ppn: u32) -> Self {
        self.resources.procs_per_node = Some(ppn);
        self
    }

    /// Cluster virtual memory request, in megabytes.
    pub fn vmem(mut self, megabytes: u64) -> Self {
        self.resources.vmem_megabytes = Some(megabytes);
        self
    }

    /// Cluster queue destination.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Admission threshold override (default 2000).
    pub fn max_cluster_jobs(mut self, max: usize) -> Self {
        self.max_cluster_jobs = Some(max);
        self
    }

    /// Attach a free-form property to the handle.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Run against this context instead of the process default.
    pub fn context(mut self, ctx: Arc<RunContext>) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Reject combinations that can never work for `mode`.
    pub(crate) fn validate(&self, mode: JobMode) -> Result<()> {
        if let Some(dir) = &self.working_dir {
            if !dir.is_absolute() {
                return Err(RunjobError::Usage(format!(
                    "working_dir '{}' is not an absolute path",
                    dir.display()
                )));
            }
        }

        if matches!(self.stdout, OutputSpec::MergeWithStdout) {
            return Err(RunjobError::Usage(
                "out_file cannot merge with stdout".to_string(),
            ));
        }

        if let Some(max) = self.max_cluster_jobs {
            if max == 0 {
                return Err(RunjobError::Usage(
                    "max_cluster_jobs must be >= 1".to_string(),
                ));
            }
        }

        if mode != JobMode::Cluster {
            if self.queue.is_some()
                || !self.resources.is_empty()
                || self.max_cluster_jobs.is_some()
            {
                return Err(RunjobError::Usage(format!(
                    "queue/resource options only apply to cluster jobs, not {mode} ones"
                )));
            }
        }

        if mode == JobMode::Cluster {
            if !self.stdin.is_serializable() {
                return Err(RunjobError::Usage(format!(
                    "cluster jobs cannot take stdin from a {} source; use a file path",
                    self.stdin.describe()
                )));
            }
            for (name, spec) in [("out_file", &self.stdout), ("err_file", &self.stderr)] {
                let ok = spec.is_serializable()
                    || matches!(spec, OutputSpec::MergeWithStdout);
                if !ok {
                    return Err(RunjobError::Usage(format!(
                        "cluster jobs cannot send {name} to a {} sink; use a file path",
                        spec.describe()
                    )));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOptions")
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("working_dir", &self.working_dir)
            .field("raise_error", &self.raise_error)
            .field("die_on_destroy", &self.die_on_destroy)
            .field("hooks", &self.hooks.len())
            .field("queue", &self.queue)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}
