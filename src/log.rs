//! Structured logging for conductor.
//!
//! Log levels:
//! - ERROR: Failures that halt a run or leak a resource
//! - WARN: Recoverable conditions (stage failures, retries, orphaned workspaces)
//! - INFO: Task lifecycle (dispatch, verdicts, merge decisions)
//! - DEBUG: Workspace provisioning, stage timings, store writes
//! - TRACE: Raw collaborator output
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` takes precedence over both when set.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Name of the log file inside the state directory.
pub const LOG_FILE: &str = "conductor.log";

/// Whether debug logging was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Default filter directive for the requested verbosity.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conductor=debug,info"
    } else {
        "info"
    }
}

/// Initialize logging to `<state_dir>/conductor.log`.
///
/// The file is truncated on startup. If it cannot be created the
/// subscriber writes to stderr instead. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
pub fn init_with_debug(state_dir: &Path, debug: bool) {
    let debug_enabled = debug || env_debug();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let file = std::fs::create_dir_all(state_dir)
        .and_then(|_| File::create(state_dir.join(LOG_FILE)));

    let result = match file {
        Ok(file) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
            .try_init(),
        Err(_) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
    };

    if result.is_ok() {
        tracing::debug!(debug = debug_enabled, state_dir = %state_dir.display(), "logging initialized");
    }
}
