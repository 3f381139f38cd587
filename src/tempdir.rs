// src/tempdir.rs

//! Per-job rendezvous directories.
//!
//! Every job owns a uniquely-named directory where the status file, die-file,
//! and default out/err sinks live. The layout spreads jobs across five random
//! two-character subdirectories so heavily-used bases never accumulate one
//! giant flat directory:
//!
//! ```text
//! <base>/<user>-runjob-tempfiles/ab/cd/ef/gh/ij/<jobname>-XXXXXX
//! ```
//!
//! The tail segment is created with `tempfile`'s atomic unique naming.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::debug;

use crate::errors::{Result, RunjobError};
use crate::sys;

const MARKER_SUFFIX: &str = "-runjob-tempfiles";
const SPREAD_SEGMENTS: usize = 5;

/// A job's rendezvous directory.
///
/// `owned` distinguishes directories this library created (and may delete)
/// from caller-supplied ones adopted via `existing_temp`.
#[derive(Debug)]
pub struct Tempdir {
    path: PathBuf,
    owned: bool,
}

impl Tempdir {
    /// Create a fresh unique directory for `job_name` under `base`.
    pub fn create(base: &Path, job_name: &str) -> Result<Tempdir> {
        let marker = base.join(format!("{}{}", sys::username(), MARKER_SUFFIX));

        let mut spread = marker.clone();
        let mut rng = rand::thread_rng();
        for _ in 0..SPREAD_SEGMENTS {
            let seg: String = (0..2)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect();
            spread.push(seg);
        }

        fs::create_dir_all(&spread).map_err(|e| {
            RunjobError::Setup(format!(
                "could not create tempdir base '{}': {}",
                spread.display(),
                e
            ))
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{job_name}-"))
            .tempdir_in(&spread)
            .map_err(|e| {
                RunjobError::Setup(format!(
                    "could not create tempdir in '{}': {}",
                    spread.display(),
                    e
                ))
            })?
            .into_path();

        debug!(tempdir = %dir.display(), "created job tempdir");
        Ok(Tempdir {
            path: dir,
            owned: true,
        })
    }

    /// Adopt a caller-owned directory. It must exist and be writable; cleanup
    /// will never delete it.
    pub fn adopt(path: PathBuf) -> Result<Tempdir> {
        let meta = fs::metadata(&path).map_err(|e| {
            RunjobError::Usage(format!(
                "existing_temp '{}' is not usable: {}",
                path.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(RunjobError::Usage(format!(
                "existing_temp '{}' is not a directory",
                path.display()
            )));
        }
        // Writability probe: an anonymous temp file in the directory.
        tempfile::tempfile_in(&path).map_err(|e| {
            RunjobError::Usage(format!(
                "existing_temp '{}' is not writable: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Tempdir { path, owned: false })
    }

    /// Re-attach a directory recorded in a snapshot. No validation: a
    /// vanished directory simply behaves as already cleaned up.
    pub(crate) fn resume(path: PathBuf, owned: bool) -> Tempdir {
        Tempdir { path, owned }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Delete the directory tree, then prune empty ancestor spread segments
    /// up to (but never including) the `…-runjob-tempfiles` marker.
    ///
    /// Idempotent; a no-op for adopted directories.
    pub fn cleanup(&mut self) -> Result<()> {
        if !self.owned || !self.path.exists() {
            return Ok(());
        }

        fs::remove_dir_all(&self.path)?;
        debug!(tempdir = %self.path.display(), "removed job tempdir");

        let mut current = self.path.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.ends_with(MARKER_SUFFIX) {
                break;
            }
            match fs::read_dir(&dir) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(_) => break,
            }
            if fs::remove_dir(&dir).is_err() {
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }

        Ok(())
    }
}

/// Derive a scheduler-friendly job name from a command: the basename of the
/// program with anything outside `[A-Za-z0-9_.-]` squashed to `-`.
pub fn job_name_from_command(command: &[String]) -> String {
    let program = command.first().map(String::as_str).unwrap_or("job");
    let base = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("job");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_cleanup_prunes_spread_segments() {
        let base = tempfile::tempdir().unwrap();
        let mut td = Tempdir::create(base.path(), "sleep").unwrap();
        assert!(td.path().is_dir());
        assert!(td
            .path()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("sleep-"));

        let marker = base
            .path()
            .join(format!("{}{}", sys::username(), MARKER_SUFFIX));
        assert!(marker.is_dir());

        td.cleanup().unwrap();
        assert!(!td.path().exists());

        // All five spread segments were empty, so only the marker remains.
        let leftovers: Vec<_> = fs::read_dir(&marker).unwrap().collect();
        assert!(leftovers.is_empty(), "spread segments not pruned: {leftovers:?}");

        // Second cleanup is a no-op.
        td.cleanup().unwrap();
    }

    #[test]
    fn cleanup_stops_at_nonempty_ancestor() {
        let base = tempfile::tempdir().unwrap();
        let mut td1 = Tempdir::create(base.path(), "a").unwrap();
        let keeper = td1.path().parent().unwrap().join("keep.txt");
        fs::write(&keeper, "x").unwrap();

        td1.cleanup().unwrap();
        assert!(keeper.exists());
    }

    #[test]
    fn adopted_dir_is_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut td = Tempdir::adopt(dir.path().to_path_buf()).unwrap();
        assert!(!td.is_owned());
        td.cleanup().unwrap();
        assert!(dir.path().exists());
    }

    #[test]
    fn adopt_rejects_missing_dir() {
        assert!(Tempdir::adopt(PathBuf::from("/no/such/dir/anywhere")).is_err());
    }

    #[test]
    fn job_names_are_sanitized() {
        let cmd = |s: &str| vec![s.to_string()];
        assert_eq!(job_name_from_command(&cmd("/bin/sleep")), "sleep");
        assert_eq!(job_name_from_command(&cmd("my tool!")), "my-tool-");
        assert_eq!(job_name_from_command(&[]), "job");
    }
}
