//! Logging Configuration
//!
//! Settings can come from the `[logging]` table of the relay config file and
//! are overridden by environment variables for 12-factor deployments:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | HASH_RELAY_LOG | info | `EnvFilter` directive, e.g. `hash_relay=debug` |
//! | HASH_RELAY_LOG_FORMAT | text | `text` or `json` |

use serde::{Deserialize, Serialize};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "text" | "pretty" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive
    pub filter: String,
    pub format: LogFormat,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Defaults overridden from the environment
    pub fn from_env() -> Self {
        let mut config = LogConfig::default();
        config.apply_env();
        config
    }

    /// Override fields that have an environment variable set
    pub fn apply_env(&mut self) {
        if let Ok(filter) = std::env::var("HASH_RELAY_LOG") {
            if !filter.trim().is_empty() {
                self.filter = filter;
            }
        }
        if let Some(format) = std::env::var("HASH_RELAY_LOG_FORMAT")
            .ok()
            .and_then(|v| LogFormat::parse(&v))
        {
            self.format = format;
        }
    }
}
