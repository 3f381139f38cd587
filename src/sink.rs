// src/sink.rs

//! Typed stdin/stdout/stderr redirection specifications.
//!
//! Each standard stream of a job is described by one variant of
//! [`InputSpec`] or [`OutputSpec`]. The exec helper owns the per-variant
//! setup (spooling bytes to a file, opening sinks) and finalization (reading
//! captured output back, feeding line consumers). Only path-shaped variants
//! survive serialization, which is why the cluster backend insists on them.

use std::fs::File;
use std::path::{Path, PathBuf};

/// Producer callback for stdin: called repeatedly, each `Some` chunk is fed
/// to the child; `None` ends the stream.
pub type InputProducer = Box<dyn FnMut() -> Option<Vec<u8>> + Send>;

/// Consumer callback for captured output: called once per line after the
/// child has exited.
pub type LineConsumer = Box<dyn FnMut(&str) + Send>;

/// What the child reads on stdin.
pub enum InputSpec {
    /// No input; the child reads from the null device.
    None,
    /// Read from this file.
    Path(PathBuf),
    /// Read from an already-open file; its descriptor is duplicated.
    Stream(File),
    /// Feed these bytes, spooled to a temp file first.
    Bytes(Vec<u8>),
    /// Feed these chunks concatenated, spooled to a temp file first.
    Chunks(Vec<Vec<u8>>),
    /// Drain this producer into a temp file, then feed it.
    Producer(InputProducer),
}

/// Where a child output stream (stdout or stderr) goes.
pub enum OutputSpec {
    /// Capture into the job's default rendezvous file (`out` or `err` inside
    /// the tempdir).
    Default,
    /// Append-create this file.
    Path(PathBuf),
    /// Write into an already-open file; its descriptor is duplicated.
    Stream(File),
    /// Capture in memory: spooled through a temp file and read back into this
    /// buffer once the child exits.
    Memory(Vec<u8>),
    /// Capture through a temp file; after exit, invoke the callback once per
    /// line of output.
    LineConsumer(LineConsumer),
    /// stderr only: write to the same sink as stdout.
    MergeWithStdout,
}

impl InputSpec {
    /// True when the variant can be described by a filesystem path (or is
    /// absent), i.e. survives serialization and cluster submission.
    pub fn is_serializable(&self) -> bool {
        matches!(self, InputSpec::None | InputSpec::Path(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            InputSpec::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Short human name for error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            InputSpec::None => "none",
            InputSpec::Path(_) => "path",
            InputSpec::Stream(_) => "stream",
            InputSpec::Bytes(_) => "bytes",
            InputSpec::Chunks(_) => "chunks",
            InputSpec::Producer(_) => "producer callback",
        }
    }
}

impl OutputSpec {
    /// True when the variant can be described by a filesystem path; only
    /// these are allowed for cluster jobs and handle snapshots.
    pub fn is_serializable(&self) -> bool {
        matches!(self, OutputSpec::Default | OutputSpec::Path(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputSpec::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            OutputSpec::Default => "default",
            OutputSpec::Path(_) => "path",
            OutputSpec::Stream(_) => "stream",
            OutputSpec::Memory(_) => "in-memory buffer",
            OutputSpec::LineConsumer(_) => "line consumer callback",
            OutputSpec::MergeWithStdout => "merged with stdout",
        }
    }
}

impl Default for InputSpec {
    fn default() -> Self {
        InputSpec::None
    }
}

impl Default for OutputSpec {
    fn default() -> Self {
        OutputSpec::Default
    }
}

impl std::fmt::Debug for InputSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSpec::Path(p) => write!(f, "InputSpec::Path({})", p.display()),
            other => write!(f, "InputSpec::{}", variant_name_in(other)),
        }
    }
}

impl std::fmt::Debug for OutputSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSpec::Path(p) => write!(f, "OutputSpec::Path({})", p.display()),
            other => write!(f, "OutputSpec::{}", variant_name_out(other)),
        }
    }
}

fn variant_name_in(spec: &InputSpec) -> &'static str {
    match spec {
        InputSpec::None => "None",
        InputSpec::Path(_) => "Path",
        InputSpec::Stream(_) => "Stream",
        InputSpec::Bytes(_) => "Bytes",
        InputSpec::Chunks(_) => "Chunks",
        InputSpec::Producer(_) => "Producer",
    }
}

fn variant_name_out(spec: &OutputSpec) -> &'static str {
    match spec {
        OutputSpec::Default => "Default",
        OutputSpec::Path(_) => "Path",
        OutputSpec::Stream(_) => "Stream",
        OutputSpec::Memory(_) => "Memory",
        OutputSpec::LineConsumer(_) => "LineConsumer",
        OutputSpec::MergeWithStdout => "MergeWithStdout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_path_shaped_variants_are_serializable() {
        assert!(InputSpec::None.is_serializable());
        assert!(InputSpec::Path(PathBuf::from("/tmp/in")).is_serializable());
        assert!(!InputSpec::Bytes(b"hi".to_vec()).is_serializable());

        assert!(OutputSpec::Default.is_serializable());
        assert!(OutputSpec::Path(PathBuf::from("/tmp/out")).is_serializable());
        assert!(!OutputSpec::Memory(Vec::new()).is_serializable());
        assert!(!OutputSpec::MergeWithStdout.is_serializable());
    }
}
