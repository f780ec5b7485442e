//! Tracing setup for diligence binaries.
//!
//! Logs go to stderr so stdout stays free for reports and JSON output.
//! Filtering comes from `DILIGENCE_LOG`, then `RUST_LOG`, then a default that
//! keeps dependencies (surrealdb, hyper) at `warn` and the diligence crates
//! at the requested level.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "DILIGENCE_LOG";

const CRATES: [&str; 3] = ["diligence_core", "diligence_state", "diligence_cli"];

/// Directives used when neither filter variable is set.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(CRATES.iter().map(|krate| format!("{krate}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn directives(diligence_log: Option<String>, rust_log: Option<String>, level: Level) -> String {
    diligence_log
        .into_iter()
        .chain(rust_log)
        .find(|d| !d.trim().is_empty())
        .unwrap_or_else(|| default_directives(level))
}

/// Initialise the global subscriber. Later calls are ignored.
///
/// * `json`: newline-delimited JSON with the current span's fields, so each
///   line carries its `session_id`.
/// * `level`: verbosity of the diligence crates when no filter variable is set.
pub fn init_tracing(json: bool, level: Level) {
    let wanted = directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        level,
    );
    let env_filter = EnvFilter::try_new(&wanted)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
