//! Report persistence.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use super::TestReport;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Insert or replace the report with the same run id.
    async fn save(&self, report: &TestReport) -> Result<(), StoreError>;
    async fn load(&self, run_id: Uuid) -> Result<Option<TestReport>, StoreError>;
    /// All reports for a test case, newest first.
    async fn list_for_test(&self, test_id: &str) -> Result<Vec<TestReport>, StoreError>;
}

// =============================================================================
// SQLite
// =============================================================================

#[derive(Clone)]
pub struct SqliteReportStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReportStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS test_reports (\
               run_id TEXT PRIMARY KEY,\
               test_id TEXT NOT NULL,\
               name TEXT NOT NULL,\
               status TEXT NOT NULL,\
               criteria_total INTEGER NOT NULL,\
               criteria_flagged INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               report_json TEXT NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS test_reports_test_id ON test_reports(test_id, created_at);",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("CONSENSUS_REPORT_DB") {
            return PathBuf::from(path);
        }
        PathBuf::from(".consensus_reports.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

fn decode(raw: &str) -> Result<TestReport, StoreError> {
    TestReport::from_json(raw).map_err(|e| StoreError::Serde(e.to_string()))
}

#[async_trait]
impl ReportStore for SqliteReportStore {
    async fn save(&self, report: &TestReport) -> Result<(), StoreError> {
        let json = serde_json::to_string(report).map_err(|e| StoreError::Serde(e.to_string()))?;
        let run_id = report.run_id.to_string();
        let test_id = report.test_id.clone();
        let name = report.name.clone();
        let status = report.status.as_str();
        let total = report.criteria.len() as i64;
        let flagged = report.flagged().count() as i64;
        let created_at = report.timestamp.timestamp();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO test_reports (\
                        run_id, test_id, name, status, criteria_total, criteria_flagged, \
                        created_at, report_json \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(run_id) DO UPDATE SET \
                        status = excluded.status, \
                        criteria_total = excluded.criteria_total, \
                        criteria_flagged = excluded.criteria_flagged, \
                        report_json = excluded.report_json",
                    params![run_id, test_id, name, status, total, flagged, created_at, json],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<TestReport>, StoreError> {
        let run_id = run_id.to_string();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT report_json FROM test_reports WHERE run_id = ?1")?;
                let mut rows = stmt.query(params![run_id])?;
                let raw: Option<String> = match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                };
                raw.as_deref().map(decode).transpose()
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn list_for_test(&self, test_id: &str) -> Result<Vec<TestReport>, StoreError> {
        let test_id = test_id.to_string();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT report_json FROM test_reports WHERE test_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC",
                )?;
                let mut rows = stmt.query(params![test_id])?;
                let mut reports = Vec::new();
                while let Some(row) = rows.next()? {
                    reports.push(decode(&row.get::<_, String>(0)?)?);
                }
                Ok(reports)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteReportStore {
    /// Write every stored report as one JSON line, newest first. Returns the count.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT report_json FROM test_reports ORDER BY created_at DESC, rowid DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
                let mut written = 0usize;
                while let Some(row) = rows.next()? {
                    let line: String = row.get(0)?;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                file.flush()?;
                Ok(written)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Drop reports older than `max_age_days`, then keep only the newest `max_rows`.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<PruneStats, StoreError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = Utc::now()
                        .timestamp()
                        .saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM test_reports WHERE created_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let keep = max_rows as i64;
                    let removed = conn.execute(
                        "DELETE FROM test_reports WHERE run_id IN (\
                            SELECT run_id FROM test_reports \
                            ORDER BY created_at DESC, rowid DESC LIMIT -1 OFFSET ?1\
                         )",
                        params![keep],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM test_reports", [], |row| row.get(0))?;
                Ok(PruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryReportStore {
    reports: Mutex<Vec<TestReport>>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn save(&self, report: &TestReport) -> Result<(), StoreError> {
        let mut reports = self.reports.lock().map_err(|_| StoreError::Poisoned)?;
        reports.retain(|r| r.run_id != report.run_id);
        reports.push(report.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<TestReport>, StoreError> {
        let reports = self.reports.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(reports.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn list_for_test(&self, test_id: &str) -> Result<Vec<TestReport>, StoreError> {
        let reports = self.reports.lock().map_err(|_| StoreError::Poisoned)?;
        let mut matching: Vec<TestReport> = reports
            .iter()
            .rev()
            .filter(|r| r.test_id == test_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matching)
    }
}
