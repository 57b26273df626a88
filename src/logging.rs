//! Logging initialisation for qvm.
//!
//! When the `QVM_LOG` environment variable is set to `1`, structured logs
//! are also written to `qvm.log` in the log directory. Stderr output is
//! always enabled and filtered by `RUST_LOG` (default `warn`, or `debug` with
//! `--verbose`).
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(log_dir: &Path, verbose: bool) -> LogGuard {
    let stderr_default = if verbose { "debug" } else { "warn" };

    let file_guard = if std::env::var("QVM_LOG").as_deref() == Ok("1") {
        let _ = std::fs::create_dir_all(log_dir);
        let file_appender = tracing_appender::rolling::never(log_dir, "qvm.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
        let default = if verbose { "debug" } else { "info" };

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(stderr_default)),
            )
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
