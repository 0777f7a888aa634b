//! # pgBackRest Exporter
//!
//! A Prometheus metrics exporter for pgBackRest.
//!
//! ## Overview
//!
//! On every scrape the exporter runs one shell command per configured target
//! (typically `pgbackrest info --output=json`, possibly over ssh), validates
//! the JSON it prints and exposes:
//!
//! - Stanza and repository status codes
//! - Per backup type: status, last start time, duration, delta and size
//! - Collector failure and stderr counters per target
//!
//! Targets run concurrently. A target whose command fails keeps the metrics of
//! its last successful run and only its failure counter moves.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pgbackrest_exporter::{
//!     collector::Collector, config::Settings, metrics::MetricsStore, scrape::Scraper,
//!     server::start_server,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut settings = Settings::load(None)?;
//!     settings.add_target("main", "pgbackrest info --output=json");
//!     let targets = settings.resolve_targets()?;
//!
//!     let store = Arc::new(MetricsStore::new()?);
//!     let collector = Arc::new(Collector::new(
//!         Arc::clone(&store),
//!         settings.exporter.command_timeout(),
//!     ));
//!     let scraper = Arc::new(Scraper::new(collector, Arc::new(targets)));
//!
//!     start_server(
//!         &settings.exporter.listen_address,
//!         &settings.exporter.metrics_path,
//!         store,
//!         scraper,
//!     )
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`schema`] - pgBackRest info JSON model and decoder
//! - [`metrics`] - Prometheus metric store
//! - [`collector`] - Per-target command execution
//! - [`scrape`] - Concurrent scrape of all targets
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling
//! - [`server`] - HTTP server for exposing metrics

pub mod collector;
pub mod config;
pub mod error;
pub mod metrics;
pub mod schema;
pub mod scrape;
pub mod server;

pub use error::{CollectorError, ExporterError, Result};
