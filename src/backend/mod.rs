// src/backend/mod.rs

//! Execution backends, one per [`JobMode`].
//!
//! Each backend implements `start` (dispatch from the constructor) plus the
//! mode-specific pieces of `probe`, `wait`, and `kill` that the handle's
//! lifecycle methods delegate to.
//!
//! [`JobMode`]: crate::job::JobMode

pub(crate) mod background;
pub(crate) mod cluster;
pub(crate) mod foreground;

use std::path::PathBuf;

/// Path to the `runjob` helper binary used as the background shepherd and
/// the cluster driver entry point.
///
/// Resolution order: the `RUNJOB_SHEPHERD` override, the current executable
/// when it *is* the helper, then `runjob` on `PATH`.
pub(crate) fn shepherd_binary() -> PathBuf {
    if let Ok(p) = std::env::var("RUNJOB_SHEPHERD") {
        return PathBuf::from(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if exe.file_name().map(|n| n == "runjob").unwrap_or(false) {
            return exe;
        }
    }
    PathBuf::from("runjob")
}
