//! Error types for the pgBackRest exporter.
//!
//! This module defines custom error types using `thiserror` for structured
//! error handling throughout the application.

use crate::schema::ValidationError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for exporter startup and serving.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Metrics error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// HTTP server error
    #[error("HTTP server error: {0}")]
    Server(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<prometheus::Error> for ExporterError {
    fn from(e: prometheus::Error) -> Self {
        ExporterError::Metrics(e.to_string())
    }
}

/// Why a single target produced no metrics on a scrape.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The shell could not be started
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    /// The command ran longer than the configured timeout
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The command exited without writing to stdout
    #[error("command produced no stdout")]
    EmptyOutput,

    /// Stdout was not valid pgBackRest info JSON
    #[error("invalid command output: {0}")]
    Validation(#[from] ValidationError),
}

impl CollectorError {
    /// Short machine-friendly name, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectorError::Spawn(_) => "spawn",
            CollectorError::Timeout(_) => "timeout",
            CollectorError::EmptyOutput => "empty_output",
            CollectorError::Validation(_) => "validation",
        }
    }
}

/// Result type alias for exporter operations.
pub type Result<T> = std::result::Result<T, ExporterError>;
