// src/lib.rs

//! Run external commands in the foreground, in the background, or on a
//! Torque-compatible batch cluster, behind one job handle.
//!
//! The three constructors differ only in where the command runs; the handle
//! they return behaves the same everywhere: poll it with
//! [`JobHandle::alive`], block on [`JobHandle::wait`], cancel with
//! [`JobHandle::kill`], read captured output with [`JobHandle::out`] /
//! [`JobHandle::err`], and reclaim the scratch space with
//! [`JobHandle::cleanup`]. Child and controller meet in a per-job rendezvous
//! directory holding the status file, the die-file, and the default sinks;
//! because all coordination goes through the filesystem, a handle can be
//! snapshotted, the controller restarted, and supervision resumed.
//!
//! ```no_run
//! use runjob::{JobHandle, JobOptions};
//!
//! # fn main() -> runjob::Result<()> {
//! let mut job = JobHandle::run_async(
//!     vec!["sort".into(), "/data/shared/big-file".into()],
//!     JobOptions::new().on_completion(|job| {
//!         println!("done: exit status {:?}", job.exit_status());
//!     }),
//! )?;
//!
//! while job.alive()? {
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! println!("{}", job.out()?);
//! job.cleanup()?;
//! # Ok(())
//! # }
//! ```

mod backend;

pub mod cli;
pub mod cluster;
pub mod context;
pub mod errors;
pub mod exec;
pub mod job;
pub mod logging;
pub mod report;
pub mod settings;
pub mod shepherd;
pub mod sink;
pub mod status;
pub mod sys;
pub mod tempdir;

pub use cluster::ClusterResources;
pub use context::RunContext;
pub use errors::{Result, RunjobError};
pub use job::{JobHandle, JobMode, JobOptions, JobSnapshot};
pub use settings::Settings;
pub use sink::{InputSpec, OutputSpec};
