//! CLI entry point for the event indexer.
//!
//! ```text
//! main.rs (runtime + tracing)
//!     ↓
//! cli.rs (commands)
//!     ↓
//! indexer ──► reorg ──► fetcher ──► events ──► db / projections
//! ```
//!
//! All errors bubble up to here with context and are reported once.

use eth_event_indexer::{cli, observability};
use tracing::error;

/// Entry point for the event indexer.
///
/// Logging is controlled via environment variables:
/// - `RUST_LOG`: filter directives (e.g. `eth_event_indexer=debug,sqlx=warn`)
/// - `LOG_JSON`: JSON console output (`true` or `false`)
/// - `LOG_FILE`: additional daily-rotated JSON log file
#[tokio::main]
async fn main() {
    let log_level = std::env::var("RUST_LOG").ok();
    let log_file = std::env::var("LOG_FILE").ok().map(std::path::PathBuf::from);
    let json_output = std::env::var("LOG_JSON")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);

    // Held until exit so buffered file logs are flushed
    let _log_guard = match observability::init_tracing(log_level, log_file, json_output) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = cli::run().await {
        error!(error = %e, "Application error");
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
