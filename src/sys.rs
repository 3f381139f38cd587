// src/sys.rs

//! Host and user identity, as recorded in status files and error reports.

use nix::unistd::{Uid, User};

/// Name of the machine this process runs on, or `"unknown-host"`.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Login name of the effective user, falling back to `$USER`, then
/// `"unknown-user"`.
pub fn username() -> String {
    if let Ok(Some(user)) = User::from_uid(Uid::effective()) {
        return user.name;
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown-user".to_string())
}

/// Current wall-clock time as whole unix seconds.
pub fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
