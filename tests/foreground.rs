mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use runjob::{JobHandle, JobOptions, OutputSpec, RunjobError};

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[test]
fn successful_run_records_everything_and_fires_hook_once() {
    common::init_tracing();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hook_calls);

    let mut job = JobHandle::run(
        cmd(&["sleep", "1"]),
        JobOptions::new().on_completion(move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    assert_eq!(job.exit_status().unwrap(), Some(0));
    let start = job.start_time().unwrap();
    let end = job.end_time().unwrap().unwrap();
    assert!(end >= start, "end {end} should not precede start {start}");
    assert!(job.host().is_some());

    assert_eq!(job.out().unwrap(), "");
    assert_eq!(job.err().unwrap(), "");

    // Repeated observation must not re-fire the hook.
    assert!(!job.alive().unwrap());
    let _ = job.exit_status().unwrap();
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_is_surfaced_with_command_and_stderr_tail() {
    common::init_tracing();

    let err = JobHandle::run(cmd(&["false"]), JobOptions::new()).unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("command failed: 'false'"),
        "got: {message}"
    );
    assert!(
        message.contains("last few lines of stderr:"),
        "got: {message}"
    );
}

#[test]
fn failure_is_stored_when_raise_error_is_off() {
    common::init_tracing();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hook_calls);

    let mut job = JobHandle::run(
        cmd(&["false"]),
        JobOptions::new()
            .raise_error(false)
            .on_completion(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .unwrap();

    let stored = job.error_string().unwrap_or("").to_string();
    assert!(!stored.is_empty());
    assert!(stored.contains("command failed: 'false'"), "got: {stored}");
    assert_ne!(job.exit_status().unwrap(), Some(0));
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn memory_sinks_capture_both_streams() {
    common::init_tracing();

    let job = JobHandle::run(
        cmd(&["sh", "-c", "echo to-out; echo to-err >&2"]),
        JobOptions::new()
            .out_file(OutputSpec::Memory(Vec::new()))
            .err_file(OutputSpec::Memory(Vec::new())),
    )
    .unwrap();

    assert_eq!(job.out().unwrap(), "to-out\n");
    assert_eq!(job.err().unwrap(), "to-err\n");
}

#[test]
fn merged_stderr_is_readable_through_out() {
    common::init_tracing();

    let job = JobHandle::run(
        cmd(&["sh", "-c", "echo one; echo two >&2"]),
        JobOptions::new().err_file(OutputSpec::MergeWithStdout),
    )
    .unwrap();

    let combined = job.out().unwrap();
    assert!(combined.contains("one"));
    assert!(combined.contains("two"));
    assert_eq!(job.err().unwrap(), combined);
}

#[test]
fn working_dir_is_honored() {
    common::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let job = JobHandle::run(
        cmd(&["pwd"]),
        JobOptions::new()
            .working_dir(&expected)
            .out_file(OutputSpec::Memory(Vec::new())),
    )
    .unwrap();

    assert_eq!(job.out().unwrap().trim(), expected.display().to_string());
}

#[test]
fn cleanup_is_idempotent_and_removes_the_tempdir() {
    common::init_tracing();

    let mut job = JobHandle::run(cmd(&["true"]), JobOptions::new()).unwrap();
    let tempdir = job.tempdir_path().unwrap().to_path_buf();
    assert!(tempdir.is_dir());

    job.cleanup().unwrap();
    assert!(!tempdir.exists());
    job.cleanup().unwrap();
}

#[test]
fn existing_temp_is_adopted_and_never_deleted() {
    common::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let mut job = JobHandle::run(
        cmd(&["true"]),
        JobOptions::new().existing_temp(dir.path()),
    )
    .unwrap();

    assert_eq!(job.tempdir_path().unwrap(), dir.path());
    assert!(dir.path().join("status").is_file());

    job.cleanup().unwrap();
    assert!(dir.path().is_dir(), "adopted tempdir must survive cleanup");
    drop(job);
    assert!(dir.path().is_dir(), "adopted tempdir must survive destruction");
}

#[test]
fn cluster_options_on_a_foreground_job_fail_fast() {
    common::init_tracing();

    let err = JobHandle::run(cmd(&["true"]), JobOptions::new().queue("batch")).unwrap_err();
    assert!(matches!(err, RunjobError::Usage(_)));
}

#[test]
fn stdin_bytes_reach_the_command() {
    common::init_tracing();

    let job = JobHandle::run(
        cmd(&["cat"]),
        JobOptions::new()
            .in_file(runjob::InputSpec::Bytes(b"fed through a spool".to_vec()))
            .out_file(OutputSpec::Memory(Vec::new())),
    )
    .unwrap();

    assert_eq!(job.out().unwrap(), "fed through a spool");
}
