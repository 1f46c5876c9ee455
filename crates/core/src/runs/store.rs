use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{RunRecord, RunStatus};

const STATUS_RUNNING: &str = "running";
const STATUS_SUCCESS: &str = "success";
const STATUS_FAILED: &str = "failed";

const SELECT_COLUMNS: &str = "SELECT
    id,
    started_at,
    finished_at,
    status,
    duration_sec,
    trigger,
    log_file,
    exit_code,
    error
 FROM runs";

/// Terminal outcome written once by the background completion path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub finished_at: i64,
    pub status: RunStatus,
    pub duration_sec: i64,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    db_path: PathBuf,
}

impl RunStore {
    /// Opens (and creates if needed) the run table at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory for runs db: {}", parent.display())
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    pub fn init(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    started_at INTEGER NOT NULL,
                    finished_at INTEGER,
                    status TEXT NOT NULL,
                    duration_sec INTEGER,
                    trigger TEXT NOT NULL,
                    log_file TEXT,
                    exit_code INTEGER,
                    error TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize runs schema: {}",
                    self.db_path.display()
                )
            })
        })
    }

    /// Inserts a fresh RUNNING record. An id collision is an error.
    pub fn insert(&self, id: &str, started_at: i64, trigger: &str, log_file: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO runs (id, started_at, status, trigger, log_file)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, started_at, STATUS_RUNNING, trigger, log_file],
            )
            .with_context(|| format!("failed to insert run {id}"))?;
            Ok(())
        })
    }

    /// Writes the terminal state. The run must have been inserted first.
    pub fn update(&self, id: &str, completion: &RunCompletion) -> Result<()> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE runs
                     SET finished_at = ?1, status = ?2, duration_sec = ?3, exit_code = ?4, error = ?5
                     WHERE id = ?6",
                    params![
                        completion.finished_at,
                        status_to_str(completion.status),
                        completion.duration_sec,
                        completion.exit_code,
                        completion.error,
                        id,
                    ],
                )
                .with_context(|| format!("failed to update run {id}"))?;

            if changed == 0 {
                bail!("cannot update run {id}: no such run was inserted");
            }
            Ok(())
        })
    }

    /// All runs, most recent start first.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} ORDER BY started_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read runs")
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<RunRecord>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("failed to read run {id}"))
        })
    }

    /// Fails every RUNNING record; used when no in-process task can still own it.
    pub fn mark_interrupted(&self, now: i64, reason: &str) -> Result<usize> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE runs
                     SET finished_at = ?1,
                         status = ?2,
                         duration_sec = MAX(0, ?1 - started_at),
                         error = CASE
                             WHEN error IS NULL OR TRIM(error) = '' THEN ?3
                             ELSE ?3 || '; previous_error=' || error
                         END
                     WHERE status = ?4",
                    params![now, STATUS_FAILED, reason, STATUS_RUNNING],
                )
                .context("failed to reconcile interrupted runs")?;
            Ok(changed)
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open runs db: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set runs db busy timeout")?;
        op(&conn)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_raw: String = row.get(3)?;
    let status = parse_status(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown persisted status: {status_raw}"),
            )),
        )
    })?;

    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status,
        duration_sec: row.get(4)?,
        trigger: row.get(5)?,
        log_file: row.get(6)?,
        exit_code: row.get(7)?,
        error: row.get(8)?,
    })
}

fn status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => STATUS_RUNNING,
        RunStatus::Success => STATUS_SUCCESS,
        RunStatus::Failed => STATUS_FAILED,
    }
}

fn parse_status(value: &str) -> Option<RunStatus> {
    match value {
        STATUS_RUNNING => Some(RunStatus::Running),
        STATUS_SUCCESS => Some(RunStatus::Success),
        STATUS_FAILED => Some(RunStatus::Failed),
        _ => None,
    }
}
