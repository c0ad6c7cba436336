//! Logging initialisation for jupyter-keeper.
//!
//! Stderr output is always on, filtered by `RUST_LOG` (default `info`). When
//! the `JUPYTER_KEEPER_LOG` environment variable is set to `1`, structured
//! logs are also written to `jupyter-keeper.log` in the given log directory.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "JUPYTER_KEEPER_LOG";
const LOG_FILE: &str = "jupyter-keeper.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(log_dir: &Path) -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = if file_logging_enabled() {
        let _ = std::fs::create_dir_all(log_dir);
        let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn file_logging_enabled() -> bool {
    std::env::var(LOG_ENV).as_deref() == Ok("1")
}
