// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunjobError {
    /// Invalid option, argument, or combination (e.g. a stream sink on a
    /// cluster job). Always surfaced, never stored.
    #[error("invalid job configuration: {0}")]
    Usage(String),

    /// Failure while preparing to run: tempdir creation, spooling stdin,
    /// opening sinks, exec itself.
    #[error("{0}")]
    Setup(String),

    /// The command ran and failed (non-zero exit or terminated by a signal).
    #[error("{0}")]
    CommandFailed(String),

    /// The controller received a stop-signal while supervising a foreground
    /// job; the same signal was forwarded to the child.
    #[error("Got signal SIG{0}")]
    GotSignal(String),

    /// A job reported failure through its die-file.
    #[error("{0}")]
    Died(String),

    /// qsub/qstat/qdel misbehaved beyond the built-in retries.
    #[error("batch scheduler error: {0}")]
    Scheduler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RunjobError>;
