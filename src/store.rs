//! Record store for submitted responses.
//!
//! Two interchangeable implementations sit behind [`RecordStore`]:
//! - [`MemoryStore`]: process-local, used when no database path is configured
//! - [`SqliteStore`]: a single SQLite file, one row per response
//!
//! Records are append-only. Lookups return newest first so that a capped
//! lookup keeps the most recent responses.

use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::models::{Answers, ResponseFilter, ResponseRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record store lock poisoned")]
    Poisoned,
}

pub trait RecordStore: Send + Sync {
    /// Short label for logs.
    fn kind(&self) -> &'static str;

    fn insert(&self, record: &ResponseRecord) -> Result<(), StoreError>;

    /// Matching records, most recent first, at most `limit` of them.
    fn find(&self, filter: &ResponseFilter, limit: usize)
        -> Result<Vec<ResponseRecord>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

/// In-process store. Newest records live at the end of the vector.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<ResponseRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn insert(&self, record: &ResponseRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.push(record.clone());
        Ok(())
    }

    fn find(
        &self,
        filter: &ResponseFilter,
        limit: usize,
    ) -> Result<Vec<ResponseRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut found: Vec<ResponseRecord> = records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        // stable: equal timestamps keep newest-inserted first
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        Ok(found)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().map_err(|_| StoreError::Poisoned)?.len())
    }
}

/// SQLite-backed store. Answers are kept as a JSON text column.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS responses (\
               id TEXT PRIMARY KEY,\
               company_id TEXT NOT NULL,\
               survey_id TEXT NOT NULL,\
               respondent_id TEXT,\
               answers TEXT NOT NULL,\
               created_at TEXT NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_responses_scope \
               ON responses (company_id, survey_id, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

impl RecordStore for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn insert(&self, record: &ResponseRecord) -> Result<(), StoreError> {
        let answers = serde_json::to_string(&record.answers)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO responses (id, company_id, survey_id, respondent_id, answers, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.company_id,
                    record.survey_id,
                    record.respondent_id,
                    answers,
                    record.created_at,
                ],
            )?;
            Ok(())
        })
    }

    fn find(
        &self,
        filter: &ResponseFilter,
        limit: usize,
    ) -> Result<Vec<ResponseRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, company_id, survey_id, respondent_id, answers, created_at \
                 FROM responses \
                 WHERE (?1 IS NULL OR company_id = ?1) AND (?2 IS NULL OR survey_id = ?2) \
                 ORDER BY created_at DESC, rowid DESC \
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![filter.company_id, filter.survey_id, limit],
                parse_record_row,
            )?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResponseRecord> {
    let answers_json: String = row.get(4)?;
    let answers: Answers = serde_json::from_str(&answers_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ResponseRecord {
        id: row.get(0)?,
        company_id: row.get(1)?,
        survey_id: row.get(2)?,
        respondent_id: row.get(3)?,
        answers,
        created_at: row.get(5)?,
    })
}
