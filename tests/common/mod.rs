#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();
static SHEPHERD: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Point background/cluster spawns at the freshly-built helper binary
/// instead of whatever `runjob` happens to be on PATH.
pub fn use_built_shepherd() {
    SHEPHERD.call_once(|| {
        std::env::set_var("RUNJOB_SHEPHERD", env!("CARGO_BIN_EXE_runjob"));
    });
}
