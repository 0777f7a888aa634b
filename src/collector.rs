//! Per-target collection.
//!
//! A [`Collector`] runs the configured command of one target through the
//! platform shell, validates its stdout as pgBackRest info JSON and writes the
//! result into the [`MetricsStore`]. Failures never leave [`Collector::collect`]:
//! they are counted, logged and turned into an exit code of `-1`.
//!
//! Commands are trusted configuration and are executed as given, without any
//! sandboxing.

use crate::error::CollectorError;
use crate::metrics::MetricsStore;
use crate::schema::parse_reports;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Exit code reported for a target that produced no metrics.
pub const FAILED_EXIT_CODE: i32 = -1;

/// Result of one collection, used for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    /// Target name
    pub target: String,
    /// Exit code of the command, or [`FAILED_EXIT_CODE`]
    pub exit_code: i32,
}

impl TargetOutcome {
    pub fn failed(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            exit_code: FAILED_EXIT_CODE,
        }
    }

    /// Whether the target's metrics were updated.
    pub fn is_success(&self) -> bool {
        self.exit_code != FAILED_EXIT_CODE
    }
}

/// Runs target commands and feeds their output into the metric store.
pub struct Collector {
    store: Arc<MetricsStore>,
    timeout: Option<Duration>,
}

impl Collector {
    /// Create a collector writing into `store`.
    ///
    /// With `timeout` set, a command still running after that long is killed
    /// and its target fails for the scrape.
    pub fn new(store: Arc<MetricsStore>, timeout: Option<Duration>) -> Self {
        Self { store, timeout }
    }

    /// Store the collector writes into.
    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    /// Run `command` for `target` once and update its metrics.
    pub async fn collect(&self, target: &str, command: &str) -> TargetOutcome {
        info!("Target: {}, executing command: {}", target, command);

        match self.collect_internal(target, command).await {
            Ok(exit_code) => {
                debug!("Target {} collected, exit code {}", target, exit_code);
                TargetOutcome {
                    target: target.to_owned(),
                    exit_code,
                }
            }
            Err(e) => {
                self.store.record_exception(target);
                error!("Target {} failed ({}): {}", target, e.kind(), e);
                TargetOutcome::failed(target)
            }
        }
    }

    async fn collect_internal(&self, target: &str, command: &str) -> Result<i32, CollectorError> {
        let output = self.execute(command).await?;

        // Stderr is informational; stdout decides success
        self.record_stderr(target, &output.stderr);

        if output.stdout.is_empty() {
            return Err(CollectorError::EmptyOutput);
        }

        let reports = parse_reports(&output.stdout)?;
        self.store.apply_reports(target, &reports);

        // Killed by a signal
        Ok(output.status.code().unwrap_or(FAILED_EXIT_CODE))
    }

    async fn execute(&self, command: &str) -> Result<Output, CollectorError> {
        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(CollectorError::Spawn)?;
        let Some(limit) = self.timeout else {
            return child.wait_with_output().await.map_err(CollectorError::Spawn);
        };

        let pid = child.id();
        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output.map_err(CollectorError::Spawn),
            Err(_) => {
                // The shell itself is killed and reaped on drop, its children are not
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                Err(CollectorError::Timeout(limit))
            }
        }
    }

    fn record_stderr(&self, target: &str, stderr: &[u8]) {
        if stderr.is_empty() {
            return;
        }

        for line in String::from_utf8_lossy(stderr).lines() {
            if line.trim().is_empty() {
                continue;
            }
            self.store.record_stderr_line(target);
            error!("Target {} produced stderr: {}", target, line);
        }
    }
}

/// Run `command` through `sh -c` as leader of a new process group.
#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).process_group(0);
    cmd
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", pgid),
        Err(e) => debug!("Process group {} not killed: {}", pgid, e),
    }
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

// Only the direct child is killed on Windows
#[cfg(windows)]
fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    const FIXTURE_PATH: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/pgbackrest_info.json"
    );

    fn collector(timeout: Option<Duration>) -> Collector {
        Collector::new(Arc::new(MetricsStore::new().unwrap()), timeout)
    }

    fn cat_fixture() -> String {
        format!("cat '{}'", FIXTURE_PATH)
    }

    #[tokio::test]
    async fn test_collect_fixture() {
        let collector = collector(None);
        let outcome = collector.collect("test", &cat_fixture()).await;

        assert_eq!(outcome.target, "test");
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.is_success());
        assert_eq!(collector.store().exception_count("test"), 0);

        let text = collector.store().encode().unwrap();
        assert!(text.contains(r#"pgbackrest_common_status{command="test",name="tsoo-app"} 0"#));
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_valid_output_is_success() {
        let collector = collector(None);
        let command = format!("{}; exit 3", cat_fixture());
        let outcome = collector.collect("test", &command).await;

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(collector.store().exception_count("test"), 0);
        assert!(collector
            .store()
            .encode()
            .unwrap()
            .contains(r#"stanza="tsoo-app""#));
    }

    #[tokio::test]
    async fn test_stderr_lines_counted() {
        let collector = collector(None);
        let command = format!(
            "echo 'WARN: first' >&2; echo >&2; echo 'WARN: second' >&2; {}",
            cat_fixture()
        );
        let outcome = collector.collect("test", &command).await;

        assert!(outcome.is_success());
        assert_eq!(collector.store().stderr_line_count("test"), 2);
        assert_eq!(collector.store().exception_count("test"), 0);
    }

    #[tokio::test]
    async fn test_empty_stdout_fails() {
        let collector = collector(None);
        let outcome = collector.collect("test", "true").await;

        assert_eq!(outcome.exit_code, FAILED_EXIT_CODE);
        assert_eq!(collector.store().exception_count("test"), 1);
        assert!(!collector
            .store()
            .encode()
            .unwrap()
            .contains(r#"command="test""#));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_and_counts_stderr() {
        let collector = collector(None);
        let outcome = collector
            .collect("test", "/nonexistent/pgbackrest info --output=json")
            .await;

        assert_eq!(outcome.exit_code, FAILED_EXIT_CODE);
        assert_eq!(collector.store().exception_count("test"), 1);
        assert!(collector.store().stderr_line_count("test") >= 1);
    }

    #[tokio::test]
    async fn test_invalid_json_fails() {
        let collector = collector(None);
        let outcome = collector.collect("test", "echo 'not json'").await;

        assert_eq!(outcome.exit_code, FAILED_EXIT_CODE);
        assert_eq!(collector.store().exception_count("test"), 1);
    }

    #[tokio::test]
    async fn test_schema_violation_writes_nothing() {
        let collector = collector(None);
        // Second stanza has an unknown backup type; the first must not be applied either
        let fixture = std::fs::read_to_string(FIXTURE_PATH).unwrap();
        let body = fixture.trim().trim_start_matches('[').trim_end_matches(']');
        let broken = body.replace(r#""type":"full""#, r#""type":"weekly""#);
        let path = std::env::temp_dir().join(format!(
            "pgbackrest-exporter-schema-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, format!("[{},{}]", body, broken)).unwrap();

        let outcome = collector
            .collect("test", &format!("cat '{}'", path.display()))
            .await;
        std::fs::remove_file(&path).unwrap();

        assert_eq!(outcome.exit_code, FAILED_EXIT_CODE);
        assert!(!collector
            .store()
            .encode()
            .unwrap()
            .contains(r#"command="test""#));
    }

    /// Whether `pid` is a live (non-zombie) process.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_forked_commands() {
        let collector = collector(Some(Duration::from_millis(300)));
        let pid_file = std::env::temp_dir().join(format!(
            "pgbackrest-exporter-timeout-{}.pid",
            std::process::id()
        ));
        let command = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());

        let outcome = collector.collect("test", &command).await;
        assert_eq!(outcome.exit_code, FAILED_EXIT_CODE);
        assert_eq!(collector.store().exception_count("test"), 1);

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        std::fs::remove_file(&pid_file).unwrap();
        let pid = pid.trim();

        let deadline = Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_alive(pid), "sleep {} survived the timeout", pid);
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let collector = collector(Some(Duration::from_millis(200)));
        let start = Instant::now();
        let outcome = collector.collect("test", "sleep 5").await;

        assert_eq!(outcome.exit_code, FAILED_EXIT_CODE);
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(collector.store().exception_count("test"), 1);
    }
}
