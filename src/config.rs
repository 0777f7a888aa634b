//! Configuration management for the pgBackRest exporter.
//!
//! Supports loading configuration from:
//! - TOML configuration files
//! - Environment variables (`PGBACKREST_EXPORTER_` prefix and `__` between
//!   nested keys, e.g. `PGBACKREST_EXPORTER_EXPORTER__LISTEN_ADDRESS`)
//! - Command-line arguments (`--command`, `--file` and friends)

use crate::error::{ExporterError, Result};
use crate::scrape::Targets;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exporter specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterConfig {
    /// Address to listen on for metrics endpoint
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Path the metrics are served on
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Per-command timeout in seconds (0 = no timeout)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
}

impl ExporterConfig {
    /// Timeout applied to every target command.
    pub fn command_timeout(&self) -> Option<Duration> {
        match self.command_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Replace the host and/or the port of the listen address.
    pub fn override_listen(&mut self, host: Option<&str>, port: Option<u16>) {
        if host.is_none() && port.is_none() {
            return;
        }

        let (current_host, current_port) = match self.listen_address.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.to_string()),
            None => (self.listen_address.clone(), "8080".to_string()),
        };
        let host = match host {
            Some(host) if host.contains(':') && !host.starts_with('[') => format!("[{host}]"),
            Some(host) => host.to_string(),
            None => current_host,
        };
        let port = port.map(|p| p.to_string()).unwrap_or(current_port);

        self.listen_address = format!("{host}:{port}");
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            metrics_path: default_metrics_path(),
            log_level: default_log_level(),
            command_timeout_seconds: default_command_timeout(),
        }
    }
}

/// One configured target.
///
/// Names are kept as values rather than table keys since `config` lowercases
/// every key it reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Target name, exported as the `command` label
    pub name: String,
    /// Shell command to execute
    #[serde(default)]
    pub command: Option<String>,
    /// File holding the shell command to execute
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Main configuration structure for the exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Exporter server configuration
    #[serde(default)]
    pub exporter: ExporterConfig,

    /// Configured targets
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn config_error(message: impl Into<String>) -> ExporterError {
    ExporterError::Config(config::ConfigError::Message(message.into()))
}

fn target_source_error(name: &str) -> ExporterError {
    config_error(format!(
        "target {name} needs exactly one of command and file"
    ))
}

/// Split a `name=value` argument on the first `=`.
///
/// # Examples
///
/// ```
/// use pgbackrest_exporter::config::parse_key_value;
///
/// let (name, command) = parse_key_value("main=pgbackrest info --output=json").unwrap();
/// assert_eq!(name, "main");
/// assert_eq!(command, "pgbackrest info --output=json");
/// ```
pub fn parse_key_value(value: &str) -> std::result::Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("not a valid key-value pair: {value}"))
}

impl Settings {
    /// Load configuration from a file and environment variables.
    ///
    /// The result is not validated yet since command-line targets are usually
    /// added afterwards; call [`Settings::resolve_targets`] once everything is
    /// merged.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pgbackrest_exporter::config::Settings;
    ///
    /// let settings = Settings::load(Some("config/default.toml")).unwrap();
    /// ```
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        // Add environment variables with PGBACKREST_EXPORTER_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("PGBACKREST_EXPORTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Add or replace a target command.
    pub fn add_target(&mut self, name: impl Into<String>, command: impl Into<String>) {
        self.replace_target(TargetConfig {
            name: name.into(),
            command: Some(command.into()),
            file: None,
        });
    }

    /// Add or replace a target whose command is read from `path`.
    pub fn add_target_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.replace_target(TargetConfig {
            name: name.into(),
            command: None,
            file: Some(path.into()),
        });
    }

    fn replace_target(&mut self, target: TargetConfig) {
        self.targets.retain(|t| t.name != target.name);
        self.targets.push(target);
    }

    /// Validate the settings and build the immutable target map.
    ///
    /// Command files are read once here and trimmed.
    pub fn resolve_targets(&self) -> Result<Targets> {
        self.validate()?;

        let mut targets = Targets::new();
        for target in &self.targets {
            let command = match (&target.command, &target.file) {
                (Some(command), None) => command.clone(),
                (None, Some(path)) => read_command_file(&target.name, path)?,
                _ => return Err(target_source_error(&target.name)),
            };
            targets.insert(target.name.clone(), command);
        }

        Ok(targets)
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.exporter.listen_address.is_empty() {
            return Err(config_error("listen address cannot be empty"));
        }

        let path = &self.exporter.metrics_path;
        if !path.starts_with('/') || path == "/" || path == "/health" {
            return Err(config_error(format!(
                "metrics path must start with '/' and cannot be '/' or '/health': {path}"
            )));
        }

        if self.targets.is_empty() {
            return Err(config_error(
                "at least one target command or command file is required",
            ));
        }

        let mut seen = BTreeSet::new();
        for target in &self.targets {
            let name = &target.name;
            if name.trim().is_empty() {
                return Err(config_error(format!("invalid target name: {name:?}")));
            }
            if !seen.insert(name.as_str()) {
                return Err(config_error(format!("duplicate target name: {name}")));
            }
            match (&target.command, &target.file) {
                (Some(command), None) if command.trim().is_empty() => {
                    return Err(config_error(format!("empty command for target {name}")));
                }
                (Some(_), None) | (None, Some(_)) => {}
                _ => return Err(target_source_error(name)),
            }
        }

        Ok(())
    }
}

fn read_command_file(name: &str, path: &Path) -> Result<String> {
    let command = std::fs::read_to_string(path).map_err(|e| {
        config_error(format!(
            "cannot read command file {} for target {}: {}",
            path.display(),
            name,
            e
        ))
    })?;
    let command = command.trim();
    if command.is_empty() {
        return Err(config_error(format!(
            "command file {} for target {} is empty",
            path.display(),
            name
        )));
    }
    Ok(command.to_string())
}
