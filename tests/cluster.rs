mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use runjob::{JobHandle, JobOptions, RunContext, RunjobError, Settings};

/// Cluster tests talk to stub qsub/qstat/qdel scripts through PATH and a
/// handful of env vars, so they must not interleave.
fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn original_path() -> &'static str {
    static ORIG: OnceLock<String> = OnceLock::new();
    ORIG.get_or_init(|| std::env::var("PATH").unwrap_or_default())
}

const STUB_JOB_ID: &str = "42.stub-cluster.example.org";

/// One test's private stub scheduler: stub CLIs on PATH, fixture-driven
/// qstat output, logs of every qsub/qdel invocation, and a RunContext whose
/// accessible prefixes cover the scratch space.
struct StubCluster {
    _guard: MutexGuard<'static, ()>,
    dir: tempfile::TempDir,
    ctx: Arc<RunContext>,
}

impl StubCluster {
    fn new() -> StubCluster {
        Self::with_settings(|_| {})
    }

    fn with_settings(tweak: impl FnOnce(&mut Settings)) -> StubCluster {
        let guard = env_lock();
        common::init_tracing();
        common::use_built_shepherd();

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();

        write_stub(
            &bin.join("qsub"),
            &format!(
                "#!/bin/sh\necho \"$@\" >> \"$QSUB_LOG\"\nfor last; do :; done\n\
                 if [ -n \"$QSUB_EXECUTES\" ]; then sh \"$last\" >/dev/null 2>&1 & fi\n\
                 echo \"{STUB_JOB_ID}\"\n"
            ),
        );
        write_stub(&bin.join("qstat"), "#!/bin/sh\ncat \"$QSTAT_FIXTURE\" 2>/dev/null\n");
        write_stub(
            &bin.join("qdel"),
            "#!/bin/sh\necho \"$@\" >> \"$QDEL_LOG\"\n: > \"$QSTAT_FIXTURE\"\n",
        );

        std::env::set_var(
            "PATH",
            format!("{}:{}", bin.display(), original_path()),
        );
        std::env::set_var("QSTAT_FIXTURE", dir.path().join("qstat.fixture"));
        std::env::set_var("QSUB_LOG", dir.path().join("qsub.log"));
        std::env::set_var("QDEL_LOG", dir.path().join("qdel.log"));
        std::env::remove_var("QSUB_EXECUTES");
        std::env::remove_var("CXGN_TOOLS_RUN_FORCE_QSUB_FAILURE");
        fs::write(dir.path().join("qstat.fixture"), "").unwrap();

        let mut settings = Settings {
            temp_base: Some(dir.path().join("jobs")),
            accessible_prefixes: vec![dir.path().to_path_buf()],
            qstat_cache_secs: 0,
            cluster_poll_secs: 1,
            overload_backoff_max_secs: 1,
            ..Settings::default()
        };
        tweak(&mut settings);

        StubCluster {
            _guard: guard,
            dir,
            ctx: RunContext::new(settings),
        }
    }

    fn options(&self) -> JobOptions {
        JobOptions::new().context(Arc::clone(&self.ctx))
    }

    fn fixture_path(&self) -> PathBuf {
        self.dir.path().join("qstat.fixture")
    }

    fn set_qstat(&self, text: &str) {
        fs::write(self.fixture_path(), text).unwrap();
    }

    fn set_qstat_running(&self) {
        self.set_qstat(&format!(
            "Job Id: {STUB_JOB_ID}\n    job_state = R\n    queue = batch\n"
        ));
    }

    fn qsub_log(&self) -> String {
        fs::read_to_string(self.dir.path().join("qsub.log")).unwrap_or_default()
    }

    fn qdel_log(&self) -> String {
        fs::read_to_string(self.dir.path().join("qdel.log")).unwrap_or_default()
    }
}

fn write_stub(path: &Path, script: &str) {
    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[test]
fn submission_composes_flags_and_a_driver_script() {
    let cluster = StubCluster::new();

    let job = JobHandle::run_cluster(
        cmd(&["sh", "-c", "echo hi"]),
        cluster
            .options()
            .queue("batch")
            .nodes(2)
            .procs_per_node(4)
            .vmem(8192),
    )
    .unwrap();

    assert_eq!(job.job_id(), Some(STUB_JOB_ID));

    let log = cluster.qsub_log();
    assert!(log.contains("-V"), "got: {log}");
    assert!(log.contains("-r n"), "got: {log}");
    assert!(log.contains("-o /dev/null"), "got: {log}");
    assert!(log.contains("-N sh"), "got: {log}");
    assert!(log.contains("-q batch"), "got: {log}");
    assert!(log.contains("-l nodes=2:ppn=4,vmem=8192m"), "got: {log}");

    let driver = job.tempdir_path().unwrap().join("driver.sh");
    let script = fs::read_to_string(&driver).unwrap();
    assert!(script.starts_with("#!/bin/sh\n"), "got: {script}");
    assert!(script.contains("shepherd"), "got: {script}");
    assert!(script.contains("--import-pbs-env"), "got: {script}");
    assert!(script.contains("echo hi"), "got: {script}");
}

#[test]
fn unparseable_qsub_output_is_retried_once_via_the_test_hook() {
    let cluster = StubCluster::new();

    std::env::set_var("CXGN_TOOLS_RUN_FORCE_QSUB_FAILURE", "bogus output");

    let job = JobHandle::run_cluster(cmd(&["true"]), cluster.options()).unwrap();

    // First attempt consumed the forced output and unset the hook; the
    // retry hit the real (stub) qsub and parsed its job id.
    assert!(std::env::var("CXGN_TOOLS_RUN_FORCE_QSUB_FAILURE").is_err());
    let id = job.job_id().unwrap();
    let id_re = regex::Regex::new(r"^\d+(\.[A-Za-z0-9-]+)+$").unwrap();
    assert!(id_re.is_match(id), "got: {id}");
    assert_eq!(cluster.qsub_log().lines().count(), 1, "exactly one real qsub call");
}

#[test]
fn submission_blocks_while_the_queue_is_over_the_threshold() {
    let cluster = StubCluster::new();
    cluster.set_qstat(
        "Job Id: 1.other.example.org\n    job_state = Q\n\
         Job Id: 2.other.example.org\n    job_state = R\n",
    );

    // Drain the queue from a helper thread a moment later.
    let fixture = cluster.fixture_path();
    let drain = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(2));
        fs::write(fixture, "").unwrap();
    });

    let submitting = Instant::now();
    let job = JobHandle::run_cluster(
        cmd(&["true"]),
        cluster.options().max_cluster_jobs(1),
    )
    .unwrap();
    let elapsed = submitting.elapsed();
    drain.join().unwrap();

    assert!(job.job_id().is_some());
    assert!(
        elapsed >= Duration::from_secs(1),
        "submission should have blocked, took {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(60),
        "submission should proceed once the queue drains, took {elapsed:?}"
    );
}

#[test]
fn liveness_follows_the_scheduler_and_fires_hooks_on_disappearance() {
    let cluster = StubCluster::new();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hook_calls);

    let mut job = JobHandle::run_cluster(
        cmd(&["true"]),
        cluster.options().on_completion(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    cluster.set_qstat_running();
    assert!(job.alive().unwrap());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);

    // Scheduler stops listing the job: no longer tracked, hooks fire.
    cluster.set_qstat("");
    assert!(!job.alive().unwrap());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

    assert!(!job.alive().unwrap());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn kill_cancels_through_qdel() {
    let cluster = StubCluster::new();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hook_calls);

    let mut job = JobHandle::run_cluster(
        cmd(&["true"]),
        cluster.options().on_completion(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    cluster.set_qstat_running();
    assert!(job.alive().unwrap());

    let gone = job.kill().unwrap();
    assert!(gone);
    assert!(cluster.qdel_log().contains(STUB_JOB_ID));

    assert!(!job.alive().unwrap());
    assert!(job.told_to_die());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0, "cancelled jobs never notify");
}

#[test]
fn driver_script_really_runs_the_command_against_the_rendezvous() {
    let cluster = StubCluster::new();
    std::env::set_var("QSUB_EXECUTES", "1");
    cluster.set_qstat_running();

    let mut job = JobHandle::run_cluster(
        cmd(&["sh", "-c", "echo hello-from-node"]),
        cluster.options(),
    )
    .unwrap();

    // Wait for the driver (running under the stub qsub) to finish the job.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let status_done = runjob::status::read(job.tempdir_path().unwrap())
            .map(|r| r.is_finished())
            .unwrap_or(false);
        if status_done {
            break;
        }
        assert!(Instant::now() < deadline, "driver never finished");
        std::thread::sleep(Duration::from_millis(200));
    }

    cluster.set_qstat("");
    assert_eq!(job.wait().unwrap(), Some(0));
    assert_eq!(job.out().unwrap(), "hello-from-node\n");
    assert!(job.host().is_some());

    std::env::remove_var("QSUB_EXECUTES");
}

#[test]
fn qstat_view_is_cached_until_invalidated() {
    let cluster = StubCluster::with_settings(|s| s.qstat_cache_secs = 3);
    cluster.set_qstat(
        "Job Id: 1.other.example.org\n    job_state = Q\n\
         Job Id: 2.other.example.org\n    job_state = R\n",
    );

    let ttl = Duration::from_secs(3);
    assert_eq!(cluster.ctx.qstat().job_count(ttl).unwrap(), 2);

    // The view changed, but within the TTL the cache answers.
    cluster.set_qstat("");
    assert_eq!(cluster.ctx.qstat().job_count(ttl).unwrap(), 2);

    cluster.ctx.qstat().invalidate();
    assert_eq!(cluster.ctx.qstat().job_count(ttl).unwrap(), 0);
}

#[test]
fn paths_outside_the_accessible_prefixes_fail_submission() {
    let cluster = StubCluster::with_settings(|s| {
        s.accessible_prefixes = vec![PathBuf::from("/data/shared")];
    });

    let err = JobHandle::run_cluster(cmd(&["true"]), cluster.options()).unwrap_err();
    match err {
        RunjobError::Usage(msg) => {
            assert!(msg.contains("cluster-visible"), "got: {msg}");
            assert!(msg.contains("/data/shared"), "got: {msg}");
        }
        other => panic!("expected a usage error, got: {other}"),
    }
}

#[test]
fn memory_sinks_are_rejected_for_cluster_jobs() {
    let cluster = StubCluster::new();

    let err = JobHandle::run_cluster(
        cmd(&["true"]),
        cluster
            .options()
            .out_file(runjob::OutputSpec::Memory(Vec::new())),
    )
    .unwrap_err();
    assert!(matches!(err, RunjobError::Usage(_)));
}
