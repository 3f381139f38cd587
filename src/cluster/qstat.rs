// src/cluster/qstat.rs

//! Cached view of `qstat -f`.
//!
//! One process talking to one scheduler should not hammer it with a `qstat`
//! per liveness poll, so the parsed view is cached process-wide and only
//! refreshed when older than the configured TTL or explicitly invalidated
//! (after a submission, so the new job shows up immediately).

use std::collections::HashMap;
use std::process::Command;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{Result, RunjobError};

/// Parsed `qstat -f` output: job id -> lowercased attribute map.
pub type QstatView = HashMap<String, HashMap<String, String>>;

struct CacheInner {
    fetched_at: Option<Instant>,
    view: QstatView,
}

/// Process-wide qstat cache; shared by every handle of one [`RunContext`].
///
/// [`RunContext`]: crate::context::RunContext
pub struct QstatCache {
    inner: Mutex<CacheInner>,
}

impl QstatCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                fetched_at: None,
                view: HashMap::new(),
            }),
        }
    }

    /// Drop the cached view; the next lookup re-runs `qstat`.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.fetched_at = None;
        inner.view.clear();
    }

    /// The `job_state` attribute of `job_id`, if the scheduler still lists it.
    pub fn job_state(&self, ttl: Duration, job_id: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner, ttl)?;
        Ok(inner
            .view
            .get(job_id)
            .and_then(|attrs| attrs.get("job_state"))
            .cloned())
    }

    /// How many jobs the scheduler currently lists.
    pub fn job_count(&self, ttl: Duration) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner, ttl)?;
        Ok(inner.view.len())
    }

    fn refresh_if_stale(&self, inner: &mut CacheInner, ttl: Duration) -> Result<()> {
        if let Some(at) = inner.fetched_at {
            if at.elapsed() < ttl {
                return Ok(());
            }
        }

        let text = run_qstat()?;
        let view = if has_error_line(&text) {
            // One transient failure is common on busy schedulers; retry once.
            debug!("qstat reported an error, retrying in 3s");
            std::thread::sleep(Duration::from_secs(3));
            let retry = run_qstat()?;
            if has_error_line(&retry) {
                warn!("qstat failed twice, treating the queue as empty");
                QstatView::new()
            } else {
                parse(&retry)
            }
        } else {
            parse(&text)
        };

        inner.view = view;
        inner.fetched_at = Some(Instant::now());
        Ok(())
    }
}

impl Default for QstatCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `qstat -f` and capture combined stdout+stderr.
fn run_qstat() -> Result<String> {
    let output = Command::new("qstat")
        .arg("-f")
        .output()
        .map_err(|e| RunjobError::Scheduler(format!("could not run qstat: {e}")))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

fn has_error_line(text: &str) -> bool {
    text.lines().any(|l| l.starts_with("qstat:"))
}

/// Parse `qstat -f` output.
///
/// Records begin with `Job Id: <id>`, followed by indented `key = value`
/// lines. Keys and values are lowercased; keys containing `=` or `:` are
/// dropped (continuation noise such as wrapped variable lists).
pub fn parse(text: &str) -> QstatView {
    let mut view = QstatView::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        if let Some(id) = line.strip_prefix("Job Id:") {
            let id = id.trim().to_string();
            view.entry(id.clone()).or_default();
            current = Some(id);
            continue;
        }

        let Some(job_id) = &current else { continue };
        // Attribute lines look like `    key = value`; wrapped continuation
        // lines (long Variable_List entries and the like) do not, and any
        // "key" carrying '=' or ':' is such noise.
        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim().to_lowercase();
        if key.contains('=') || key.contains(':') || key.is_empty() {
            continue;
        }
        if let Some(attrs) = view.get_mut(job_id) {
            attrs.insert(key, value);
        }
    }

    view
}
