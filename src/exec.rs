// src/exec.rs

//! The exec helper: run one command synchronously with redirected standard
//! streams, forward stop-signals to the child, and record the run into the
//! rendezvous tempdir.
//!
//! This is the single code path every backend funnels through. The
//! foreground backend calls it in the controller process; the background and
//! cluster backends call it inside the shepherd helper process.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{Result, RunjobError};
use crate::sink::{InputSpec, OutputSpec};
use crate::status;
use crate::sys;

/// One invocation of the exec helper.
pub struct ExecRequest<'a> {
    pub command: &'a [String],
    pub stdin: &'a mut InputSpec,
    pub stdout: &'a mut OutputSpec,
    pub stderr: &'a mut OutputSpec,
    /// Rendezvous directory; receives the status file and capture spools.
    pub tempdir: &'a Path,
    /// Child working directory; inherited when `None`.
    pub working_dir: Option<&'a Path>,
}

/// What one finished run looked like.
#[derive(Debug, Clone)]
pub struct ExitRecord {
    pub start: i64,
    pub end: i64,
    /// Raw wait status as persisted in the status file.
    pub raw_status: i32,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub host: String,
}

/// Run `req.command` to completion with the requested redirections.
///
/// Stop-signals (`QUIT`, `INT`, `TERM`) received by this process while the
/// child runs are forwarded to the child verbatim and reported as a
/// `Got signal SIG<NAME>` error afterwards. Capture finalization (reading
/// memory sinks back, feeding line consumers) always runs, on both the
/// success and the failure path.
pub fn run_redirected(req: ExecRequest<'_>) -> Result<ExitRecord> {
    if req.command.is_empty() {
        return Err(RunjobError::Usage("empty command".to_string()));
    }

    let stdin_stdio = realize_stdin(&mut *req.stdin, req.tempdir)?;

    let mut out = realize_output(&mut *req.stdout, req.tempdir, "out-capture")?;
    let err = match &mut *req.stderr {
        OutputSpec::MergeWithStdout => RealizedOutput::tied_to(&out)?,
        other => realize_output(other, req.tempdir, "err-capture")?,
    };

    let start = sys::unix_now();
    status::write_start(req.tempdir, start)?;

    let mut cmd = Command::new(&req.command[0]);
    cmd.args(&req.command[1..])
        .stdin(stdin_stdio)
        .stdout(out.take_stdio())
        .stderr(err.stdio);
    if let Some(dir) = req.working_dir {
        cmd.current_dir(dir);
    }

    let command_line = req.command.join(" ");
    debug!(command = %command_line, tempdir = %req.tempdir.display(), "spawning child");

    let body = match cmd.spawn() {
        Ok(child) => supervise(child, req.command, req.tempdir, start),
        Err(e) => Err(RunjobError::Setup(format!(
            "could not exec '{command_line}': {e}"
        ))),
    };

    // Capture finalization must run whether the child succeeded or not.
    let finalize_out = finalize_output(&mut *req.stdout, out.capture.as_ref());
    let finalize_err = finalize_output(&mut *req.stderr, err.capture.as_ref());

    let record = body?;
    finalize_out?;
    finalize_err?;
    Ok(record)
}

/// Wait for the child while forwarding stop-signals, then append the end
/// records and decode the wait status.
fn supervise(
    mut child: std::process::Child,
    command: &[String],
    tempdir: &Path,
    start: i64,
) -> Result<ExitRecord> {
    let child_pid = child.id() as i32;

    let mut signals = Signals::new([SIGQUIT, SIGINT, SIGTERM])
        .map_err(|e| RunjobError::Setup(format!("could not install signal forwarders: {e}")))?;
    let signals_handle = signals.handle();
    let forwarded = Arc::new(AtomicI32::new(0));
    let forwarded_in_thread = Arc::clone(&forwarded);

    let forwarder = std::thread::spawn(move || {
        for sig in signals.forever() {
            forwarded_in_thread.store(sig, Ordering::SeqCst);
            if let Ok(s) = Signal::try_from(sig) {
                let _ = signal::kill(Pid::from_raw(child_pid), s);
            }
        }
    });

    let wait_result = child.wait();
    signals_handle.close();
    let _ = forwarder.join();

    let end = sys::unix_now();
    let host = sys::hostname();

    let wait_status = match wait_result {
        Ok(s) => s,
        Err(e) => {
            status::append_finish(tempdir, end, -1, &host)?;
            return Err(RunjobError::CommandFailed(format!(
                "command failed: '{}' (host {}, user {}): error waiting for child: {}",
                command.join(" "),
                host,
                sys::username(),
                e
            )));
        }
    };

    let raw_status = wait_status.into_raw();
    status::append_finish(tempdir, end, raw_status, &host)?;

    let sig = forwarded.load(Ordering::SeqCst);
    if sig != 0 {
        return Err(RunjobError::GotSignal(short_signal_name(sig)));
    }

    let exit_code = wait_status.code().unwrap_or(0);
    let term_signal = wait_status.signal();

    if exit_code != 0 || term_signal.is_some() {
        let signal_text = match term_signal {
            Some(s) => format!("SIG{}", short_signal_name(s)),
            None => "none".to_string(),
        };
        return Err(RunjobError::CommandFailed(format!(
            "command failed: '{}' (host {}, user {}): raw status {}, exit value {}, signal {}",
            command.join(" "),
            host,
            sys::username(),
            raw_status,
            exit_code,
            signal_text,
        )));
    }

    Ok(ExitRecord {
        start,
        end,
        raw_status,
        exit_code,
        signal: term_signal,
        host,
    })
}

/// `"INT"` for 2, `"TERM"` for 15, etc.
pub fn short_signal_name(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(s) => s.as_str().trim_start_matches("SIG").to_string(),
        Err(_) => sig.to_string(),
    }
}

fn realize_stdin(spec: &mut InputSpec, tempdir: &Path) -> Result<Stdio> {
    match spec {
        InputSpec::None => Ok(Stdio::null()),
        InputSpec::Path(p) => {
            let file = File::open(&*p).map_err(|e| {
                RunjobError::Setup(format!("could not open stdin file '{}': {}", p.display(), e))
            })?;
            Ok(Stdio::from(file))
        }
        InputSpec::Stream(f) => Ok(Stdio::from(dup_file(f)?)),
        InputSpec::Bytes(bytes) => spool_stdin(tempdir, &[bytes.as_slice()]),
        InputSpec::Chunks(chunks) => {
            let slices: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
            spool_stdin(tempdir, &slices)
        }
        InputSpec::Producer(producer) => {
            let mut chunks: Vec<Vec<u8>> = Vec::new();
            while let Some(chunk) = producer() {
                chunks.push(chunk);
            }
            let slices: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
            spool_stdin(tempdir, &slices)
        }
    }
}

fn spool_stdin(tempdir: &Path, chunks: &[&[u8]]) -> Result<Stdio> {
    let mut spool = NamedTempFile::new_in(tempdir)
        .map_err(|e| RunjobError::Setup(format!("could not spool stdin: {e}")))?;
    for chunk in chunks {
        spool.write_all(chunk)?;
    }
    spool.flush()?;
    // Reopen reads from offset zero. The spool is unlinked when the
    // NamedTempFile drops at end of scope; the reopened descriptor keeps the
    // data readable for the child.
    let file = spool.reopen()?;
    Ok(Stdio::from(file))
}

/// A realized output sink: the `Stdio` to hand to the child, the open file
/// (kept so stderr can be tied to the same sink), and the capture spool to
/// read back afterwards, if any.
struct RealizedOutput {
    stdio: Stdio,
    file: Option<File>,
    capture: Option<PathBuf>,
}

impl RealizedOutput {
    fn take_stdio(&mut self) -> Stdio {
        std::mem::replace(&mut self.stdio, Stdio::null())
    }

    /// stderr sharing stdout's sink: duplicate the same open file.
    fn tied_to(out: &RealizedOutput) -> Result<RealizedOutput> {
        match &out.file {
            Some(f) => Ok(RealizedOutput {
                stdio: Stdio::from(dup_file(f)?),
                file: None,
                capture: None,
            }),
            None => Ok(RealizedOutput {
                stdio: Stdio::inherit(),
                file: None,
                capture: None,
            }),
        }
    }
}

fn realize_output(spec: &mut OutputSpec, tempdir: &Path, spool_tag: &str) -> Result<RealizedOutput> {
    match spec {
        OutputSpec::Default => Ok(RealizedOutput {
            stdio: Stdio::inherit(),
            file: None,
            capture: None,
        }),
        OutputSpec::Path(p) => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&*p)
                .map_err(|e| {
                    RunjobError::Setup(format!(
                        "could not open output file '{}': {}",
                        p.display(),
                        e
                    ))
                })?;
            let stdio = Stdio::from(dup_file(&file)?);
            Ok(RealizedOutput {
                stdio,
                file: Some(file),
                capture: None,
            })
        }
        OutputSpec::Stream(f) => {
            let dup = dup_file(f)?;
            let keep = dup_file(f)?;
            Ok(RealizedOutput {
                stdio: Stdio::from(dup),
                file: Some(keep),
                capture: None,
            })
        }
        OutputSpec::Memory(_) | OutputSpec::LineConsumer(_) => {
            let spool_path = tempdir.join(spool_tag);
            let file = File::create(&spool_path)
                .map_err(|e| RunjobError::Setup(format!("could not spool output: {e}")))?;
            let stdio = Stdio::from(dup_file(&file)?);
            Ok(RealizedOutput {
                stdio,
                file: Some(file),
                capture: Some(spool_path),
            })
        }
        OutputSpec::MergeWithStdout => Err(RunjobError::Usage(
            "stdout itself cannot merge with stdout".to_string(),
        )),
    }
}

fn finalize_output(spec: &mut OutputSpec, capture: Option<&PathBuf>) -> Result<()> {
    let Some(path) = capture else {
        return Ok(());
    };
    match spec {
        OutputSpec::Memory(buf) => {
            buf.clear();
            buf.extend(fs::read(path)?);
            let _ = fs::remove_file(path);
        }
        OutputSpec::LineConsumer(consumer) => {
            let text = fs::read_to_string(path)?;
            for line in text.lines() {
                consumer(line);
            }
            let _ = fs::remove_file(path);
        }
        _ => {}
    }
    Ok(())
}

fn dup_file(f: &File) -> Result<File> {
    f.try_clone()
        .map_err(|e| RunjobError::Setup(format!("could not duplicate descriptor: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        command: &[&str],
        stdin: &mut InputSpec,
        stdout: &mut OutputSpec,
        stderr: &mut OutputSpec,
        tempdir: &Path,
    ) -> Result<ExitRecord> {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        run_redirected(ExecRequest {
            command: &command,
            stdin,
            stdout,
            stderr,
            tempdir,
            working_dir: None,
        })
    }

    #[test]
    fn captures_stdout_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut stdout = OutputSpec::Memory(Vec::new());
        let record = run(
            &["echo", "hello"],
            &mut InputSpec::None,
            &mut stdout,
            &mut OutputSpec::Default,
            dir.path(),
        )
        .unwrap();

        assert_eq!(record.exit_code, 0);
        assert!(record.end >= record.start);
        match stdout {
            OutputSpec::Memory(buf) => assert_eq!(buf, b"hello\n"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn feeds_bytes_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let mut stdout = OutputSpec::Memory(Vec::new());
        run(
            &["cat"],
            &mut InputSpec::Bytes(b"spooled input".to_vec()),
            &mut stdout,
            &mut OutputSpec::Default,
            dir.path(),
        )
        .unwrap();

        match stdout {
            OutputSpec::Memory(buf) => assert_eq!(buf, b"spooled input"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn producer_chunks_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunks = vec![b"one ".to_vec(), b"two".to_vec()].into_iter();
        let mut stdin = InputSpec::Producer(Box::new(move || chunks.next()));
        let mut stdout = OutputSpec::Memory(Vec::new());
        run(
            &["cat"],
            &mut stdin,
            &mut stdout,
            &mut OutputSpec::Default,
            dir.path(),
        )
        .unwrap();

        match stdout {
            OutputSpec::Memory(buf) => assert_eq!(buf, b"one two"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn line_consumer_sees_each_line() {
        let dir = tempfile::tempdir().unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        let mut stdout = OutputSpec::LineConsumer(Box::new(move |line| {
            sink.lock().unwrap().push(line.to_string());
        }));
        run(
            &["printf", "a\\nb\\n"],
            &mut InputSpec::None,
            &mut stdout,
            &mut OutputSpec::Default,
            dir.path(),
        )
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn merged_stderr_lands_in_stdout_sink() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("both");
        let mut stdout = OutputSpec::Path(out_path.clone());
        run(
            &["sh", "-c", "echo to-out; echo to-err >&2"],
            &mut InputSpec::None,
            &mut stdout,
            &mut OutputSpec::MergeWithStdout,
            dir.path(),
        )
        .unwrap();

        let both = fs::read_to_string(&out_path).unwrap();
        assert!(both.contains("to-out"));
        assert!(both.contains("to-err"));
    }

    #[test]
    fn nonzero_exit_is_an_error_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            &["false"],
            &mut InputSpec::None,
            &mut OutputSpec::Default,
            &mut OutputSpec::Default,
            dir.path(),
        )
        .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("command failed: 'false'"), "got: {text}");
        assert!(text.contains("exit value 1"), "got: {text}");

        // The status file still recorded the run.
        let rec = status::read(dir.path()).unwrap();
        assert!(rec.is_finished());
        assert_ne!(rec.raw_status, Some(0));
    }

    #[test]
    fn missing_program_is_a_setup_error_after_start_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            &["/no/such/program-xyz"],
            &mut InputSpec::None,
            &mut OutputSpec::Default,
            &mut OutputSpec::Default,
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, RunjobError::Setup(_)));

        let rec = status::read(dir.path()).unwrap();
        assert!(rec.start.is_some());
        assert!(!rec.is_finished());
    }

    #[test]
    fn stop_signals_are_forwarded_to_the_child() {
        use std::time::{Duration, Instant};

        let dir = tempfile::tempdir().unwrap();
        let own_pid = nix::unistd::getpid();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(500));
            let _ = signal::kill(own_pid, Signal::SIGTERM);
        });

        let started = Instant::now();
        let err = run(
            &["sleep", "30"],
            &mut InputSpec::None,
            &mut OutputSpec::Default,
            &mut OutputSpec::Default,
            dir.path(),
        )
        .unwrap_err();
        sender.join().expect("signal sender thread");

        assert!(
            err.to_string().contains("Got signal SIGTERM"),
            "got: {err}"
        );
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "the child should die from the forwarded signal, not run out"
        );

        // The status file recorded the signal death.
        let rec = status::read(dir.path()).unwrap();
        assert!(rec.is_finished());
        assert_eq!(rec.raw_status.map(|r| r & 0x7f), Some(15));
    }

    #[test]
    fn memory_capture_survives_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut stderr = OutputSpec::Memory(Vec::new());
        let err = run(
            &["sh", "-c", "echo doomed >&2; exit 3"],
            &mut InputSpec::None,
            &mut OutputSpec::Default,
            &mut stderr,
            dir.path(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exit value 3"));

        match stderr {
            OutputSpec::Memory(buf) => assert_eq!(buf, b"doomed\n"),
            _ => unreachable!(),
        }
    }
}
