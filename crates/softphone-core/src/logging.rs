//! Logging setup for applications embedding the engine
//!
//! The engine itself only emits `tracing` events. Binaries and tests call
//! [`setup_logging`] once to install a subscriber.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{SoftphoneError, SoftphoneResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level, e.g. `info`
    pub level: String,
    pub json: bool,
    /// Include file and line information
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "softphone".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` directives take precedence over `config.level`. Fails if a
/// global subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> SoftphoneResult<()> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| SoftphoneError::InvalidConfiguration {
        field: "logging".to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(app = %config.app_name, version = crate::VERSION, "Logging initialised");
    Ok(())
}

pub fn parse_log_level(level: &str) -> SoftphoneResult<Level> {
    Level::from_str(level.trim()).map_err(|_| SoftphoneError::InvalidConfiguration {
        field: "logging.level".to_string(),
        reason: format!("invalid log level '{}'", level),
    })
}
