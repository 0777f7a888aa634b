//! Prometheus metrics definitions and the shared metric store.
//!
//! This module defines all Prometheus metrics exposed by the exporter and
//! the mapping from decoded pgBackRest reports onto labeled series.

use crate::error::Result;
use crate::schema::{Backup, StatusReport};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const COMPRESSED_NO: &str = "no";
const COMPRESSED_YES: &str = "yes";
const BUILD_STATUS: &str = "Release";

const COMMON_LABELS: &[&str] = &["command", "name"];
const REPOSITORY_LABELS: &[&str] = &["command", "stanza", "repo"];
const BACKUP_LABELS: &[&str] = &["command", "stanza", "database", "repo", "backup_type"];
const BACKUP_SIZE_LABELS: &[&str] = &[
    "command",
    "stanza",
    "database",
    "repo",
    "backup_type",
    "compressed",
];

/// pgBackRest metric families written by collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    CommonStatus,
    RepositoryStatus,
    BackupStatus,
    BackupLastStartTime,
    BackupDuration,
    BackupDelta,
    BackupSize,
}

/// One series written for a target: family plus label values.
type Series = (Family, Vec<String>);

/// Process-wide metric store.
///
/// Built once at startup and shared by `Arc` between the collectors and the
/// HTTP layer. Every gauge write overwrites the value of its label tuple;
/// counters only ever increase.
pub struct MetricsStore {
    registry: Registry,

    // Collector metrics
    exceptions: IntCounterVec,
    stderr_lines: IntCounterVec,

    // pgBackRest metrics
    common_status: GaugeVec,
    repository_status: GaugeVec,
    backup_status: GaugeVec,
    backup_last_start_time: GaugeVec,
    backup_duration: GaugeVec,
    backup_delta: GaugeVec,
    backup_size: GaugeVec,

    // HTTP server metrics
    response_time: HistogramVec,
    response_status: IntCounterVec,

    // Series written by each target on its last successful scrape
    written: Mutex<HashMap<String, HashSet<Series>>>,
}

fn register<M>(registry: &Registry, metric: M) -> Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl MetricsStore {
    /// Create the store and register every metric family.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        let exporter_info = register(
            &registry,
            GaugeVec::new(
                Opts::new("pgbackrest_exporter_info", "pgbackrest_exporter information"),
                &["status", "version", "major", "minor", "patchlevel"],
            )?,
        )?;
        exporter_info
            .with_label_values(&[
                BUILD_STATUS,
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_VERSION_MAJOR"),
                env!("CARGO_PKG_VERSION_MINOR"),
                env!("CARGO_PKG_VERSION_PATCH"),
            ])
            .set(1.0);

        // Collector metrics
        let exceptions = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "exceptions_total",
                    "Count of exceptions during collecting and exporting metrics",
                )
                .namespace("exporter")
                .subsystem("collector"),
                &["target"],
            )?,
        )?;

        let stderr_lines = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "stderr_lines_total",
                    "Count of STDERR lines captured during collecting and exporting metrics",
                )
                .namespace("exporter")
                .subsystem("collector"),
                &["target"],
            )?,
        )?;

        // pgBackRest metrics
        let common_status = register(
            &registry,
            GaugeVec::new(
                Opts::new("pgbackrest_common_status", "Current pgBackRest status"),
                COMMON_LABELS,
            )?,
        )?;

        let repository_status = register(
            &registry,
            GaugeVec::new(
                Opts::new("pgbackrest_repository_status", "Current repository status"),
                REPOSITORY_LABELS,
            )?,
        )?;

        let backup_status = register(
            &registry,
            GaugeVec::new(
                Opts::new(
                    "pgbackrest_backup_status",
                    "Current backup status (1 = error, 0 = ok)",
                ),
                BACKUP_LABELS,
            )?,
        )?;

        let backup_last_start_time = register(
            &registry,
            GaugeVec::new(
                Opts::new(
                    "pgbackrest_backup_last_start_time",
                    "Backup last start time (Unix epoch)",
                ),
                BACKUP_LABELS,
            )?,
        )?;

        let backup_duration = register(
            &registry,
            GaugeVec::new(
                Opts::new(
                    "pgbackrest_backup_duration",
                    "Last backup duration in seconds",
                ),
                BACKUP_LABELS,
            )?,
        )?;

        let backup_delta = register(
            &registry,
            GaugeVec::new(
                Opts::new("pgbackrest_backup_delta", "Backup delta size in bytes"),
                BACKUP_SIZE_LABELS,
            )?,
        )?;

        let backup_size = register(
            &registry,
            GaugeVec::new(
                Opts::new("pgbackrest_backup_size", "Actual backup size in bytes"),
                BACKUP_SIZE_LABELS,
            )?,
        )?;

        // HTTP server metrics
        let response_time = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "http_server_response_time_seconds",
                    "HTTP request handler execution time",
                ),
                &["path"],
            )?,
        )?;

        let response_status = register(
            &registry,
            IntCounterVec::new(
                Opts::new("http_server_response_status_total", "HTTP responses code count"),
                &["path", "status"],
            )?,
        )?;

        Ok(Self {
            registry,
            exceptions,
            stderr_lines,
            common_status,
            repository_status,
            backup_status,
            backup_last_start_time,
            backup_duration,
            backup_delta,
            backup_size,
            response_time,
            response_status,
            written: Mutex::new(HashMap::new()),
        })
    }

    /// Create the collector counters of a target at zero so they are exported
    /// before its first failure.
    pub fn register_target(&self, target: &str) {
        self.exceptions.with_label_values(&[target]);
        self.stderr_lines.with_label_values(&[target]);
    }

    /// Count a failed collection of `target`.
    pub fn record_exception(&self, target: &str) {
        self.exceptions.with_label_values(&[target]).inc();
    }

    /// Count one stderr line produced by the command of `target`.
    pub fn record_stderr_line(&self, target: &str) {
        self.stderr_lines.with_label_values(&[target]).inc();
    }

    /// Failed collections of `target` so far.
    pub fn exception_count(&self, target: &str) -> u64 {
        self.exceptions.with_label_values(&[target]).get()
    }

    /// Stderr lines captured from the command of `target` so far.
    pub fn stderr_line_count(&self, target: &str) -> u64 {
        self.stderr_lines.with_label_values(&[target]).get()
    }

    /// Record one handled HTTP request.
    pub fn observe_request(&self, path: &str, status: u16, seconds: f64) {
        self.response_time
            .with_label_values(&[path])
            .observe(seconds);
        let status = status.to_string();
        self.response_status
            .with_label_values(&[path, status.as_str()])
            .inc();
    }

    /// Write the decoded reports of one target into the store.
    ///
    /// Series this target wrote on its previous call that are missing from
    /// `reports` are removed. Returns the number of series written.
    pub fn apply_reports(&self, target: &str, reports: &[StatusReport]) -> usize {
        let mut ledger = self.ledger();
        let mut written = HashSet::new();

        for report in reports {
            let name = report.name.as_str();

            self.set(
                &mut written,
                Family::CommonStatus,
                &[target, name],
                report.status.code as f64,
            );

            for repository in &report.repositories {
                let key = repository.key.to_string();
                self.set(
                    &mut written,
                    Family::RepositoryStatus,
                    &[target, name, &key],
                    repository.status.code as f64,
                );
            }

            for backup in &report.backups {
                self.apply_backup(&mut written, target, name, backup);
            }
        }

        let count = written.len();
        if let Some(previous) = ledger.get(target) {
            for (family, labels) in previous.difference(&written) {
                let values: Vec<&str> = labels.iter().map(String::as_str).collect();
                if let Err(e) = self.gauge(*family).remove_label_values(&values[..]) {
                    debug!("Stale series of {} already gone: {}", target, e);
                }
            }
        }
        ledger.insert(target.to_owned(), written);

        debug!("Applied {} series for target {}", count, target);
        count
    }

    fn apply_backup(
        &self,
        written: &mut HashSet<Series>,
        target: &str,
        stanza: &str,
        backup: &Backup,
    ) {
        let database = backup.database.id.to_string();
        let repo = backup.database.repo_key.to_string();
        let backup_type = backup.backup_type.as_str();
        let labels: [&str; 5] = [target, stanza, &database, &repo, backup_type];

        let error = if backup.error { 1.0 } else { 0.0 };
        self.set(written, Family::BackupStatus, &labels, error);
        self.set(
            written,
            Family::BackupLastStartTime,
            &labels,
            backup.timestamp.start as f64,
        );
        self.set(
            written,
            Family::BackupDuration,
            &labels,
            backup.duration_seconds() as f64,
        );

        let plain: [&str; 6] = [target, stanza, &database, &repo, backup_type, COMPRESSED_NO];
        let stored: [&str; 6] = [target, stanza, &database, &repo, backup_type, COMPRESSED_YES];
        self.set(written, Family::BackupDelta, &plain, backup.info.delta as f64);
        self.set(
            written,
            Family::BackupDelta,
            &stored,
            backup.info.repository.delta as f64,
        );
        self.set(written, Family::BackupSize, &plain, backup.info.size as f64);
        self.set(
            written,
            Family::BackupSize,
            &stored,
            backup.info.repository.size as f64,
        );
    }

    fn set(&self, written: &mut HashSet<Series>, family: Family, labels: &[&str], value: f64) {
        self.gauge(family).with_label_values(labels).set(value);
        written.insert((family, labels.iter().map(|l| (*l).to_owned()).collect()));
    }

    fn gauge(&self, family: Family) -> &GaugeVec {
        match family {
            Family::CommonStatus => &self.common_status,
            Family::RepositoryStatus => &self.repository_status,
            Family::BackupStatus => &self.backup_status,
            Family::BackupLastStartTime => &self.backup_last_start_time,
            Family::BackupDuration => &self.backup_duration,
            Family::BackupDelta => &self.backup_delta,
            Family::BackupSize => &self.backup_size,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<String, HashSet<Series>>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Content type of [`encode`](Self::encode) output.
    pub fn format_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// Families are sorted by name and series by label values, so the output
    /// is stable for identical store contents.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::with_capacity(8192);
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| crate::error::ExporterError::Metrics(e.to_string()))
    }
}
