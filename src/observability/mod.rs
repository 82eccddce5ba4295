//! Observability
//!
//! Structured logging through `tracing`. The consumer emits events with
//! `batch_seq`, `batch_len`, `max_tag` and `error` fields; `init_tracing`
//! installs a `tracing-subscriber` formatter filtered by [`LogConfig`].

pub mod config;

pub use config::{LogConfig, LogFormat};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Returns an error if one is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}
