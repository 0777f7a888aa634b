//! pgBackRest `info --output=json` data model.
//!
//! Every type here mirrors a JSON object emitted by `pgbackrest info
//! --output=json`. Decoding is strict about the fields the exporter relies on
//! and lenient about anything it does not know, so newer pgBackRest releases
//! that add fields keep working.

use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use std::fmt;
use thiserror::Error;

/// Status of a single stanza as reported by pgBackRest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusReport {
    /// Stanza name
    pub name: String,
    /// Overall stanza status
    pub status: Status,
    /// Repositories configured for the stanza
    #[serde(rename = "repo")]
    pub repositories: Vec<Repository>,
    /// Backups, oldest first
    #[serde(rename = "backup")]
    pub backups: Vec<Backup>,
    /// Database clusters known to the stanza
    #[serde(rename = "db")]
    pub databases: Vec<Database>,
    /// WAL archive ranges
    #[serde(rename = "archive")]
    pub archives: Vec<Archive>,
    /// Stanza-level cipher
    pub cipher: String,
}

/// Stanza status block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Status {
    /// Status code, 0 means ok
    pub code: i64,
    /// Human readable status
    pub message: String,
    /// Lock information
    pub lock: StatusLock,
}

impl Status {
    /// Whether a backup currently holds the stanza lock.
    pub fn backup_lock_held(&self) -> bool {
        self.lock.backup.held
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusLock {
    pub backup: LockState,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockState {
    pub held: bool,
}

/// Repository entry of a stanza.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Repository {
    /// Repository key (`repo1` has key 1)
    pub key: i64,
    /// Repository cipher
    pub cipher: String,
    /// Repository status
    pub status: RepositoryStatus,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryStatus {
    pub code: i64,
    pub message: String,
}

/// Kind of backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    /// Name used in pgBackRest output and in metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single backup of a stanza.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Backup {
    /// Backup label, unique within the stanza
    pub label: String,
    /// Backup type
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    /// Whether the backup finished with errors
    pub error: bool,
    /// Database the backup belongs to
    pub database: DatabaseRef,
    /// Start and stop time (Unix epoch)
    pub timestamp: Timestamp,
    /// Size information
    pub info: BackupInfo,
    /// WAL range required by the backup
    pub archive: BackupArchive,
    /// pgBackRest version that made the backup
    pub backrest: Backrest,
    /// LSN range of the backup
    pub lsn: Lsn,
    /// Label of the backup this one depends on
    #[serde(default)]
    pub prior: Option<String>,
    /// Labels of every backup this one references
    #[serde(default)]
    pub reference: Option<Vec<String>>,
}

impl Backup {
    /// Seconds between start and stop. Not clamped: a stop before start is
    /// reported as a negative duration.
    pub fn duration_seconds(&self) -> i64 {
        self.timestamp.stop - self.timestamp.start
    }
}

/// Short database reference used by backups and archives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseRef {
    pub id: i64,
    #[serde(rename = "repo-key")]
    pub repo_key: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timestamp {
    pub start: i64,
    pub stop: i64,
}

/// Backup sizes in bytes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupInfo {
    /// Uncompressed bytes copied by this backup
    pub delta: i64,
    /// Uncompressed size of the whole database
    pub size: i64,
    /// Sizes as stored in the repository
    pub repository: RepositoryInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryInfo {
    pub delta: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupArchive {
    pub start: String,
    pub stop: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Backrest {
    pub format: i64,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Lsn {
    pub start: String,
    pub stop: String,
}

/// Database cluster entry of a stanza.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Database {
    pub id: i64,
    #[serde(rename = "repo-key")]
    pub repo_key: i64,
    #[serde(rename = "system-id")]
    pub system_id: u64,
    pub version: String,
}

/// WAL archive range of a stanza.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Archive {
    pub database: DatabaseRef,
    pub id: String,
    pub max: String,
    pub min: String,
}

/// What went wrong while decoding command output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    /// Output is not JSON at all
    Syntax,
    /// Output is JSON but does not match the schema
    Schema,
    /// Output ended in the middle of a value
    Truncated,
}

/// Command output did not decode into a list of [`StatusReport`]s.
#[derive(Debug, Clone, Error)]
#[error("{message} (line {line}, column {column})")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl From<serde_json::Error> for ValidationError {
    fn from(e: serde_json::Error) -> Self {
        let kind = match e.classify() {
            Category::Syntax | Category::Io => ValidationKind::Syntax,
            Category::Data => ValidationKind::Schema,
            Category::Eof => ValidationKind::Truncated,
        };
        Self {
            kind,
            message: e.to_string(),
            line: e.line(),
            column: e.column(),
        }
    }
}

/// Decode raw command output into stanza reports.
///
/// The whole array is decoded before anything is returned, so one bad stanza
/// rejects the output as a whole.
pub fn parse_reports(output: &[u8]) -> Result<Vec<StatusReport>, ValidationError> {
    Ok(serde_json::from_slice(output)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!("../tests/fixtures/pgbackrest_info.json");

    #[test]
    fn test_parse_fixture() {
        let reports = parse_reports(FIXTURE.as_bytes()).unwrap();
        assert_eq!(reports.len(), 1);

        let report = &reports[0];
        assert_eq!(report.name, "tsoo-app");
        assert_eq!(report.status.code, 0);
        assert!(!report.status.backup_lock_held());
        assert_eq!(report.repositories.len(), 1);
        assert_eq!(report.repositories[0].key, 1);
        assert_eq!(report.databases[0].system_id, 7322494622595299123);
        assert_eq!(report.backups.len(), 4);

        let full = &report.backups[0];
        assert_eq!(full.backup_type, BackupType::Full);
        assert_eq!(full.label, "20240119-062014F");
        assert_eq!(full.info.delta, 24432739);
        assert_eq!(full.info.repository.delta, 2986256);
        assert_eq!(full.duration_seconds(), 8);
        assert!(full.prior.is_none());
        assert!(full.reference.is_none());

        let incr = &report.backups[2];
        assert_eq!(incr.backup_type, BackupType::Incr);
        assert_eq!(incr.reference.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_empty_array() {
        assert!(parse_reports(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_backup_type_names() {
        for (name, expected) in [
            ("full", BackupType::Full),
            ("diff", BackupType::Diff),
            ("incr", BackupType::Incr),
        ] {
            let parsed: BackupType = serde_json::from_str(&format!("\"{name}\"")).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn test_unknown_backup_type_rejected() {
        let input = FIXTURE.replacen(r#""type":"full""#, r#""type":"snapshot""#, 1);
        let err = parse_reports(input.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Schema);
        assert!(err.message.contains("snapshot"));
    }

    #[test]
    fn test_missing_field_rejected() {
        let input = FIXTURE.replacen(r#""name":"tsoo-app","#, "", 1);
        let err = parse_reports(input.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Schema);
        assert!(err.message.contains("name"));
    }

    #[test]
    fn test_wrong_primitive_type_rejected() {
        let input = FIXTURE.replacen(r#""error":false"#, r#""error":"no""#, 1);
        let err = parse_reports(input.as_bytes()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Schema);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let input = FIXTURE.replacen(
            r#""held":false"#,
            r#""held":false,"size":1024,"size-cplt":512"#,
            1,
        );
        let reports = parse_reports(input.as_bytes()).unwrap();
        assert_eq!(reports[0].name, "tsoo-app");
    }

    #[test]
    fn test_system_id_above_i64_range() {
        let input = FIXTURE.replacen(
            r#""system-id":7322494622595299123"#,
            r#""system-id":18446744073709551615"#,
            1,
        );
        let reports = parse_reports(input.as_bytes()).unwrap();
        assert_eq!(reports[0].databases[0].system_id, u64::MAX);
    }

    #[test]
    fn test_syntax_error() {
        let err = parse_reports(b"ERROR: [055]: unable to load info file").unwrap_err();
        assert_eq!(err.kind, ValidationKind::Syntax);
    }

    #[test]
    fn test_truncated_output() {
        let err = parse_reports(&FIXTURE.as_bytes()[..100]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Truncated);
    }

    #[test]
    fn test_object_instead_of_array() {
        let err = parse_reports(br#"{"name":"tsoo-app"}"#).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Schema);
    }
}
