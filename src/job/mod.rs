// src/job/mod.rs

//! The job handle and its construction options.

pub mod handle;
pub mod options;
pub mod snapshot;

use serde::{Deserialize, Serialize};

pub use handle::JobHandle;
pub use options::JobOptions;
pub use snapshot::JobSnapshot;

/// How a job is executed. Fixed at construction, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Run synchronously in the calling process; the constructor blocks.
    Foreground,
    /// Run under a local shepherd process; the handle tracks its PID.
    Background,
    /// Submit to a Torque batch queue; the handle tracks the scheduler id.
    Cluster,
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobMode::Foreground => "foreground",
            JobMode::Background => "background",
            JobMode::Cluster => "cluster",
        };
        f.write_str(s)
    }
}

/// Caller-supplied completion callback; invoked exactly once, in the
/// controlling process, with the handle as its sole argument.
pub type CompletionHook = Box<dyn FnMut(&mut JobHandle) + Send>;
