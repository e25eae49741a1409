//! Tracing setup for the `rag-demo` binary.
//!
//! Diagnostics go to stderr and a daily `rag.log` under the log directory;
//! stdout is left to the program's own output.

use std::env;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::config::AppPaths;
use super::errors::RagError;

const LOG_FILE: &str = "rag.log";
const DEFAULT_LEVEL: &str = "info";
/// Dependencies that log per request or per query at `info`.
const QUIET_TARGETS: [&str; 3] = ["sqlx=warn", "hyper=warn", "reqwest=warn"];

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Filter directives: `RUST_LOG` when set, else `info` with chatty
/// dependencies held at `warn`.
fn filter_directives(requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(custom) => custom.to_string(),
        None => std::iter::once(DEFAULT_LEVEL)
            .chain(QUIET_TARGETS)
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn build_filter(requested: Option<&str>) -> Result<EnvFilter, RagError> {
    EnvFilter::try_new(filter_directives(requested))
        .or_else(|_| EnvFilter::try_new(filter_directives(None)))
        .map_err(|e| RagError::InvalidInput(format!("invalid log filter: {}", e)))
}

/// Installs the subscriber. A second call keeps the first subscriber.
pub fn init(paths: &AppPaths) -> Result<(), RagError> {
    std::fs::create_dir_all(&paths.log_dir)?;

    let requested = env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(requested.as_deref())?;

    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    if tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
    {
        let _ = LOG_GUARD.set(guard);
    }
    Ok(())
}
