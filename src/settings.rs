// src/settings.rs

//! Site-wide settings: where tempdirs live, which filesystems the cluster can
//! see, and how aggressively the scheduler is polled.
//!
//! Settings are usually left at their defaults. A site can override them from
//! a TOML file:
//!
//! ```toml
//! temp_base = "/data/shared/tmp"
//! accessible_prefixes = ["/data/shared", "/home"]
//! max_cluster_jobs = 4000
//! ```
//!
//! All fields are optional and have defaults; see [`Settings`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{Result, RunjobError};

/// Tunable knobs shared by every job started through one [`RunContext`].
///
/// [`RunContext`]: crate::context::RunContext
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base directory under which per-job tempdirs are created.
    ///
    /// `None` means the OS temp directory. Individual jobs can still override
    /// this with their `temp_base` option.
    #[serde(default)]
    pub temp_base: Option<PathBuf>,

    /// Path prefixes considered reachable from cluster compute nodes.
    ///
    /// A cluster job's tempdir, sinks, and working directory must live under
    /// one of these (optionally below a `/net/<host>` automount prefix).
    #[serde(default = "default_accessible_prefixes")]
    pub accessible_prefixes: Vec<PathBuf>,

    /// Default admission threshold: submissions block while the scheduler
    /// already holds this many jobs.
    #[serde(default = "default_max_cluster_jobs")]
    pub max_cluster_jobs: usize,

    /// How long a parsed `qstat -f` view stays fresh, in seconds.
    #[serde(default = "default_qstat_cache_secs")]
    pub qstat_cache_secs: u64,

    /// Cadence of the cluster `wait` polling loop, in seconds.
    #[serde(default = "default_cluster_poll_secs")]
    pub cluster_poll_secs: u64,

    /// Upper bound of the randomized sleep between admission re-checks when
    /// the scheduler is overloaded, in seconds.
    #[serde(default = "default_overload_backoff_max_secs")]
    pub overload_backoff_max_secs: u64,
}

fn default_accessible_prefixes() -> Vec<PathBuf> {
    ["/data/shared", "/data/prod", "/data/trunk", "/home", "/crypt"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_max_cluster_jobs() -> usize {
    2000
}

fn default_qstat_cache_secs() -> u64 {
    3
}

fn default_cluster_poll_secs() -> u64 {
    2
}

fn default_overload_backoff_max_secs() -> u64 {
    120
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            temp_base: None,
            accessible_prefixes: default_accessible_prefixes(),
            max_cluster_jobs: default_max_cluster_jobs(),
            qstat_cache_secs: default_qstat_cache_secs(),
            cluster_poll_secs: default_cluster_poll_secs(),
            overload_backoff_max_secs: default_overload_backoff_max_secs(),
        }
    }
}

/// Load settings from a TOML file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Settings> {
    let contents = fs::read_to_string(path.as_ref())?;
    let settings: Settings = toml::from_str(&contents)?;
    Ok(settings)
}

/// Load settings from a TOML file and validate them.
///
/// This is the recommended entry point for site configuration.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Settings> {
    let settings = load_from_path(path)?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Run basic semantic validation against loaded settings.
///
/// Checks:
/// - `max_cluster_jobs >= 1`
/// - every accessible prefix is an absolute path
/// - `temp_base`, if set, is an absolute path
pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.max_cluster_jobs == 0 {
        return Err(RunjobError::Usage(
            "max_cluster_jobs must be >= 1 (got 0)".to_string(),
        ));
    }

    for prefix in &settings.accessible_prefixes {
        if !prefix.is_absolute() {
            return Err(RunjobError::Usage(format!(
                "accessible prefix '{}' is not an absolute path",
                prefix.display()
            )));
        }
    }

    if let Some(base) = &settings.temp_base {
        if !base.is_absolute() {
            return Err(RunjobError::Usage(format!(
                "temp_base '{}' is not an absolute path",
                base.display()
            )));
        }
    }

    Ok(())
}

/// Whether the diagnostic environment switch is set to a truthy value.
///
/// When on, jobs emit extra traces and background/cluster tempdirs are left
/// behind on handle destruction so they can be inspected.
pub fn debug_env() -> bool {
    match std::env::var("CXGNTOOLSRUNDEBUG") {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}
