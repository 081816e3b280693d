//! Non-blocking file logging for the demo CLI, mirroring how the teacher's
//! executor crate wires a per-run log file alongside a stderr subscriber.

use std::path::Path;

use anyhow::{Context, Result};

/// Create a run-specific log writer under `{log_dir}/procpool-demo.log`.
///
/// Returns a non-blocking writer and the worker guard that must be kept
/// alive for the duration of logging -- dropping it flushes and stops the
/// background writer thread.
pub fn create_run_log_writer(
    log_dir: &Path,
) -> Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "procpool-demo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    Ok((non_blocking, guard))
}
