//! Observability and structured logging infrastructure.
//!
//! Every stream logs with structured fields (`stream`, `from`, `to`, `block`,
//! `kind`), so one stream can be followed through a busy multi-stream log.
//!
//! # Usage
//!
//! Initialize tracing at application startup and keep the returned guard alive
//! for as long as logs should reach the file:
//!
//! ```no_run
//! use eth_event_indexer::observability;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let _guard = observability::init_tracing(None, None, false)?;
//! // Run application...
//! # Ok(())
//! # }
//! ```
//!
//! # Environment Configuration
//!
//! ```bash
//! # Component-specific levels
//! RUST_LOG=eth_event_indexer=debug,sqlx=warn eth-event-indexer index
//!
//! # JSON console output plus a daily-rotated JSON file
//! LOG_JSON=true LOG_FILE=./logs/indexer.log eth-event-indexer index
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor an explicit level is given:
/// `info` for this crate, `warn` for dependencies (sqlx, alloy, hyper).
pub const DEFAULT_FILTER: &str = "eth_event_indexer=info,warn";

/// Initialize the tracing subscriber.
///
/// # Arguments
///
/// * `log_level` - Filter directive used when `RUST_LOG` is unset
/// * `log_file` - Optional file path; enables a daily-rotated JSON log
/// * `json_output` - JSON console output instead of the pretty format
///
/// Returns the file writer guard when file logging is enabled. Dropping it
/// flushes and stops the background writer.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init_tracing(
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    json_output: bool,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let env_filter = match (std::env::var("RUST_LOG"), log_level) {
        (Ok(filter), _) => EnvFilter::new(filter),
        (Err(_), Some(level)) => EnvFilter::new(level),
        (Err(_), None) => EnvFilter::new(DEFAULT_FILTER),
    };

    let console_layer = if json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    };

    let mut guard = None;
    let file_layer = match log_file.as_deref() {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory)?;

            let appender = tracing_appender::rolling::daily(
                directory,
                path.file_name().unwrap_or_else(|| OsStr::new("indexer.log")),
            );
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard = Some(worker);

            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(
        json_output,
        file_logging = log_file.is_some(),
        "Tracing initialized"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let first = init_tracing(Some("debug".to_string()), Some(dir.path().join("test.log")), true);
        let second = init_tracing(None, None, false);
        // Whichever test installs the global subscriber first wins
        assert!(first.is_err() || second.is_err());
    }
}
