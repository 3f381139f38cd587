// src/job/handle.rs

//! The job handle: one external execution, observed through polling.
//!
//! A handle is born running (its constructor has already dispatched to a
//! backend), is polled via [`JobHandle::alive`] / [`JobHandle::wait`], and is
//! torn down by [`JobHandle::cleanup`] or on drop. Every observation may
//! lazily read the status file, surface a die-file, and fire completion
//! hooks; all of that happens on the caller's thread.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::backend;
use crate::cluster::ClusterResources;
use crate::context::RunContext;
use crate::errors::{Result, RunjobError};
use crate::job::{CompletionHook, JobMode, JobOptions};
use crate::settings;
use crate::sink::{InputSpec, OutputSpec};
use crate::status;
use crate::tempdir::{self, Tempdir};

pub struct JobHandle {
    pub(crate) mode: JobMode,
    pub(crate) command: Vec<String>,
    pub(crate) stdin: InputSpec,
    pub(crate) stdout: OutputSpec,
    pub(crate) stderr: OutputSpec,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) tempdir: Option<Tempdir>,
    pub(crate) temp_base: Option<PathBuf>,
    pub(crate) existing_temp: Option<PathBuf>,
    pub(crate) raise_error: bool,
    pub(crate) die_on_destroy: bool,
    pub(crate) hooks: Vec<CompletionHook>,
    pub(crate) completion_fired: bool,
    pub(crate) told_to_die: bool,
    /// Shepherd PID (background mode).
    pub(crate) pid: Option<u32>,
    /// Shepherd child, held until reaped. Absent on resumed handles.
    pub(crate) child: Option<Child>,
    /// Scheduler job id (cluster mode).
    pub(crate) job_id: Option<String>,
    pub(crate) queue: Option<String>,
    pub(crate) resources: ClusterResources,
    pub(crate) max_cluster_jobs: usize,
    pub(crate) start_time: Option<i64>,
    pub(crate) end_time: Option<i64>,
    pub(crate) host: Option<String>,
    pub(crate) raw_status: Option<i32>,
    pub(crate) exit_status: Option<i32>,
    pub(crate) error_string: Option<String>,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) ctx: Arc<RunContext>,
    /// Terminal state observed; absorbing.
    pub(crate) finished: bool,
}

impl JobHandle {
    /// Run `command` in the foreground: blocks until it exits.
    ///
    /// On return, `exit_status` and `end_time` are set and completion hooks
    /// have fired. Failures are surfaced per `raise_error`.
    pub fn run(command: Vec<String>, options: JobOptions) -> Result<JobHandle> {
        let mut handle = Self::build(JobMode::Foreground, command, options)?;
        backend::foreground::start(&mut handle)?;
        Ok(handle)
    }

    /// Run `command` in the background under a local shepherd process and
    /// return immediately.
    pub fn run_async(command: Vec<String>, options: JobOptions) -> Result<JobHandle> {
        let mut handle = Self::build(JobMode::Background, command, options)?;
        if let Err(e) = backend::background::start(&mut handle) {
            handle.discard_tempdir_after_failed_start();
            return Err(e);
        }
        Ok(handle)
    }

    /// Submit `command` to the batch queue and return once the scheduler has
    /// accepted it. May block on admission throttling.
    pub fn run_cluster(command: Vec<String>, options: JobOptions) -> Result<JobHandle> {
        let mut handle = Self::build(JobMode::Cluster, command, options)?;
        if let Err(e) = backend::cluster::start(&mut handle) {
            handle.discard_tempdir_after_failed_start();
            return Err(e);
        }
        Ok(handle)
    }

    /// Nothing was started, so the scratch space holds nothing worth keeping
    /// (unless the diagnostic switch asks for it).
    fn discard_tempdir_after_failed_start(&mut self) {
        if settings::debug_env() {
            return;
        }
        if let Some(td) = &mut self.tempdir {
            if let Err(e) = td.cleanup() {
                debug!(error = %e, "tempdir cleanup after failed start failed");
            }
        }
    }

    fn build(mode: JobMode, command: Vec<String>, options: JobOptions) -> Result<JobHandle> {
        if command.is_empty() {
            return Err(RunjobError::Usage("empty command".to_string()));
        }
        if command.iter().any(|a| a.is_empty()) {
            return Err(RunjobError::Usage(format!(
                "command for {mode} job contains an empty argument"
            )));
        }
        options.validate(mode)?;

        let ctx = options
            .context
            .unwrap_or_else(RunContext::global);
        let max_cluster_jobs = options
            .max_cluster_jobs
            .unwrap_or(ctx.settings().max_cluster_jobs);

        Ok(JobHandle {
            mode,
            command,
            stdin: options.stdin,
            stdout: options.stdout,
            stderr: options.stderr,
            working_dir: options.working_dir,
            tempdir: None,
            temp_base: options.temp_base,
            existing_temp: options.existing_temp,
            raise_error: options.raise_error,
            die_on_destroy: options.die_on_destroy,
            hooks: options.hooks,
            completion_fired: false,
            told_to_die: false,
            pid: None,
            child: None,
            job_id: None,
            queue: options.queue,
            resources: options.resources,
            max_cluster_jobs,
            start_time: None,
            end_time: None,
            host: None,
            raw_status: None,
            exit_status: None,
            error_string: None,
            properties: options.properties,
            ctx,
            finished: false,
        })
    }

    /// Create the rendezvous directory if it does not exist yet and return
    /// its path. Idempotent.
    pub(crate) fn ensure_tempdir(&mut self) -> Result<PathBuf> {
        if let Some(td) = &self.tempdir {
            return Ok(td.path().to_path_buf());
        }
        let td = match &self.existing_temp {
            Some(dir) => Tempdir::adopt(dir.clone())?,
            None => {
                let base = self
                    .temp_base
                    .clone()
                    .or_else(|| self.ctx.settings().temp_base.clone())
                    .unwrap_or_else(std::env::temp_dir);
                Tempdir::create(&base, &tempdir::job_name_from_command(&self.command))?
            }
        };
        let path = td.path().to_path_buf();
        self.tempdir = Some(td);
        Ok(path)
    }

    /// Whether the job is still running.
    ///
    /// A `false` answer settles the handle: status is read, a die-file is
    /// surfaced per `raise_error`, completion hooks fire (unless the job was
    /// told to die).
    pub fn alive(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        let live = match self.mode {
            JobMode::Foreground => false,
            JobMode::Background => backend::background::probe(self)?,
            JobMode::Cluster => backend::cluster::probe(self)?,
        };
        if live {
            return Ok(true);
        }
        self.settle()?;
        Ok(false)
    }

    /// Block until the job terminates, then return its exit status.
    pub fn wait(&mut self) -> Result<Option<i32>> {
        if !self.finished {
            match self.mode {
                JobMode::Foreground => {}
                JobMode::Background => backend::background::wait(self)?,
                JobMode::Cluster => backend::cluster::wait(self)?,
            }
            self.settle()?;
        }
        Ok(self.exit_status)
    }

    /// Ask the job to die. Marks the handle as cancelled: later observations
    /// neither fire hooks nor surface the resulting signal error.
    ///
    /// Returns whether the job is gone afterwards.
    pub fn kill(&mut self) -> Result<bool> {
        self.told_to_die = true;
        match self.mode {
            // A foreground handle only exists after its job finished.
            JobMode::Foreground => Ok(true),
            JobMode::Background => backend::background::kill(self),
            JobMode::Cluster => backend::cluster::kill(self),
        }
    }

    /// Remove the rendezvous directory. Idempotent; never touches adopted
    /// (`existing_temp`) directories.
    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(td) = &mut self.tempdir {
            td.cleanup()?;
        }
        Ok(())
    }

    /// Captured stdout, for memory and file-backed sinks.
    pub fn out(&self) -> Result<String> {
        match &self.stdout {
            OutputSpec::Memory(buf) => Ok(String::from_utf8_lossy(buf).into_owned()),
            OutputSpec::Default | OutputSpec::Path(_) => read_sink(self.out_path().as_deref()),
            other => Err(RunjobError::Usage(format!(
                "stdout was sent to a {} sink and cannot be read back",
                other.describe()
            ))),
        }
    }

    /// Captured stderr, for memory and file-backed sinks.
    pub fn err(&self) -> Result<String> {
        match &self.stderr {
            OutputSpec::Memory(buf) => Ok(String::from_utf8_lossy(buf).into_owned()),
            OutputSpec::MergeWithStdout => self.out(),
            OutputSpec::Default | OutputSpec::Path(_) => read_sink(self.err_path().as_deref()),
            other => Err(RunjobError::Usage(format!(
                "stderr was sent to a {} sink and cannot be read back",
                other.describe()
            ))),
        }
    }

    /// Resolved stdout path: the explicit `out_file`, or the rendezvous
    /// default once the tempdir exists.
    pub fn out_path(&self) -> Option<PathBuf> {
        match &self.stdout {
            OutputSpec::Path(p) => Some(p.clone()),
            OutputSpec::Default => self
                .tempdir
                .as_ref()
                .map(|td| status::default_out_path(td.path())),
            _ => None,
        }
    }

    /// Resolved stderr path; the stdout path when merged.
    pub fn err_path(&self) -> Option<PathBuf> {
        match &self.stderr {
            OutputSpec::Path(p) => Some(p.clone()),
            OutputSpec::MergeWithStdout => self.out_path(),
            OutputSpec::Default => self
                .tempdir
                .as_ref()
                .map(|td| status::default_err_path(td.path())),
            _ => None,
        }
    }

    /// Decoded exit value, once the job terminated. Observing it may settle
    /// the handle.
    pub fn exit_status(&mut self) -> Result<Option<i32>> {
        let _ = self.alive()?;
        Ok(self.exit_status)
    }

    /// Unix end time, once the job terminated. Observing it may settle the
    /// handle.
    pub fn end_time(&mut self) -> Result<Option<i64>> {
        let _ = self.alive()?;
        Ok(self.end_time)
    }

    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    /// Host the job ran on, as recorded in the status file.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn mode(&self) -> JobMode {
        self.mode
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Shepherd PID (background mode only).
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Scheduler job id (cluster mode only).
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn tempdir_path(&self) -> Option<&Path> {
        self.tempdir.as_ref().map(Tempdir::path)
    }

    /// The last stored failure report, if any.
    pub fn error_string(&self) -> Option<&str> {
        self.error_string.as_deref()
    }

    pub fn told_to_die(&self) -> bool {
        self.told_to_die
    }

    pub fn completion_fired(&self) -> bool {
        self.completion_fired
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Add a completion hook after construction. Ignored once hooks fired.
    pub fn on_completion(&mut self, hook: impl FnMut(&mut JobHandle) + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Transition into the terminal state: read the status file, surface the
    /// die-file, fire hooks. Called from observation paths once the backend
    /// reports the job gone; absorbing.
    pub(crate) fn settle(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        // Reap a held shepherd so it never lingers as a zombie.
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }

        let Some(td) = self.tempdir.as_ref().map(|t| t.path().to_path_buf()) else {
            self.finished = true;
            return Ok(());
        };

        let record = status::read(&td)?;
        if record.start.is_some() {
            self.start_time = record.start;
        }
        if record.end.is_some() {
            self.end_time = record.end;
        }
        if let Some(raw) = record.raw_status {
            self.raw_status = Some(raw);
            self.exit_status = Some(status::exit_code_from_raw(raw));
        }
        if record.host.is_some() {
            self.host = record.host;
        }

        let died = status::probe_die(&td)?;
        self.finished = true;
        debug!(mode = %self.mode, died = died.is_some(), exit = ?self.exit_status, "job settled");

        if let Some(message) = died {
            let message = match self.mode {
                JobMode::Cluster => backend::cluster::augment_failure(self, message),
                _ => message,
            };
            return self.record_failure(message);
        }

        if !self.told_to_die {
            self.fire_hooks();
        }
        Ok(())
    }

    /// Store a failure and surface it per `raise_error`, except that signal
    /// deaths after a `kill` request are stored silently.
    pub(crate) fn record_failure(&mut self, message: String) -> Result<()> {
        self.error_string = Some(message.clone());
        let suppressed = self.told_to_die && cancellation_signal_re().is_match(&message);
        if self.raise_error && !suppressed {
            return Err(RunjobError::Died(message));
        }
        Ok(())
    }

    /// Invoke the completion hooks, at most once per handle.
    pub(crate) fn fire_hooks(&mut self) {
        if self.completion_fired {
            return;
        }
        self.completion_fired = true;
        let mut hooks = std::mem::take(&mut self.hooks);
        for hook in hooks.iter_mut() {
            hook(self);
        }
        self.hooks = hooks;
    }
}

fn read_sink(path: Option<&Path>) -> Result<String> {
    let Some(path) = path else {
        return Ok(String::new());
    };
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn cancellation_signal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Got signal SIG(INT|QUIT|TERM)").expect("static regex"))
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if self.die_on_destroy && !self.finished {
            if let Err(e) = self.kill() {
                debug!(error = %e, "kill on handle destruction failed");
            }
        }

        // Foreground tempdirs are always reclaimed on destruction;
        // background/cluster ones only when the caller opted into
        // die_on_destroy. The diagnostic env switch keeps everything around.
        let auto_clean = match self.mode {
            JobMode::Foreground => true,
            JobMode::Background | JobMode::Cluster => self.die_on_destroy,
        };
        if auto_clean && !settings::debug_env() {
            if let Some(td) = &mut self.tempdir {
                if let Err(e) = td.cleanup() {
                    debug!(error = %e, "tempdir cleanup on handle destruction failed");
                }
            }
        }

        // Never leave a zombie shepherd behind.
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                return;
            }
            let _ = child.wait();
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("mode", &self.mode)
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("job_id", &self.job_id)
            .field("exit_status", &self.exit_status)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_regex_matches_forwarded_signals_only() {
        let re = cancellation_signal_re();
        assert!(re.is_match("runjob: error: Got signal SIGTERM"));
        assert!(re.is_match("Got signal SIGINT"));
        assert!(re.is_match("Got signal SIGQUIT"));
        assert!(!re.is_match("Got signal SIGKILL"));
        assert!(!re.is_match("command failed: 'false'"));
    }

    #[test]
    fn empty_commands_are_rejected() {
        assert!(JobHandle::run(vec![], JobOptions::new()).is_err());
        let err =
            JobHandle::run_async(vec![String::new()], JobOptions::new()).unwrap_err();
        assert!(matches!(err, RunjobError::Usage(_)));
    }
}
