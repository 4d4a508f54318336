//! SQLite-backed task store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::TaskStore;
use crate::error::StoreError;
use crate::types::{DeadLetterRecord, FileId, FileStatus, FileTask, SourceFileToDelete};

const TASK_COLUMNS: &str =
    "id, name, path, status, failed_attempts, last_error, created_at, updated_at";

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                failed_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);

            CREATE TABLE IF NOT EXISTS source_files_to_delete (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id),
                source_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id),
                error_message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dead_letters_file_id ON dead_letters(file_id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<FileTask> {
        let status_str: String = row.get(3)?;
        let status = status_str.parse::<FileStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;

        Ok(FileTask {
            id: row.get(0)?,
            name: row.get(1)?,
            path: row.get(2)?,
            status,
            failed_attempts: row.get(4)?,
            last_error: row.get(5)?,
            created_at: parse_timestamp(&row.get::<_, String>(6)?),
            updated_at: parse_timestamp(&row.get::<_, String>(7)?),
        })
    }

    /// Explain why a guarded update touched no row.
    fn transition_error(tx: &Transaction<'_>, id: FileId, to: FileStatus) -> StoreError {
        let current: Result<Option<String>, _> = tx
            .query_row("SELECT status FROM files WHERE id = ?", params![id], |row| {
                row.get(0)
            })
            .optional();

        match current {
            Ok(Some(status)) => match status.parse::<FileStatus>() {
                Ok(from) => StoreError::InvalidTransition { id, from, to },
                Err(e) => StoreError::Database(e),
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e.into(),
        }
    }

    /// Statuses from which `to` may be entered.
    fn predecessors(to: FileStatus) -> Vec<&'static str> {
        FileStatus::ALL
            .iter()
            .filter(|from| from.can_transition_to(to))
            .map(|from| from.as_str())
            .collect()
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl TaskStore for SqliteTaskStore {
    fn create_task(&self, name: &str, path: &str) -> Result<FileTask, StoreError> {
        let conn = self.conn()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO files (name, path, status, failed_attempts, created_at, updated_at) VALUES (?, ?, ?, 0, ?, ?)",
            params![
                name,
                path,
                FileStatus::Pending.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;

        Ok(FileTask {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            path: path.to_string(),
            status: FileStatus::Pending,
            failed_attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get(&self, id: FileId) -> Result<Option<FileTask>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM files WHERE id = ?");
        Ok(conn
            .query_row(&sql, params![id], Self::row_to_task)
            .optional()?)
    }

    fn fetch_pending_by_ids(&self, ids: &[FileId]) -> Result<Vec<FileTask>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM files WHERE status = ? AND id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(FileStatus::Pending.as_str())];
        all_params.extend(ids.iter().map(|id| Box::new(*id) as Box<dyn rusqlite::ToSql>));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), Self::row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn claim_pending(&self, ids: &[FileId]) -> Result<Vec<FileTask>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let sql = format!(
            "UPDATE files SET status = ?, updated_at = ? WHERE status = ? AND id IN ({}) RETURNING {TASK_COLUMNS}",
            placeholders(ids.len())
        );
        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(FileStatus::Processing.as_str()),
            Box::new(Utc::now().to_rfc3339()),
            Box::new(FileStatus::Pending.as_str()),
        ];
        all_params.extend(ids.iter().map(|id| Box::new(*id) as Box<dyn rusqlite::ToSql>));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut claimed = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(param_refs.as_slice(), Self::row_to_task)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;

        // RETURNING order is unspecified
        claimed.sort_by_key(|task| task.id);
        Ok(claimed)
    }

    fn ids_with_status(&self, status: FileStatus) -> Result<Vec<FileId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM files WHERE status = ? ORDER BY id")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn bulk_set_status(&self, ids: &[FileId], status: FileStatus) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let from = Self::predecessors(status);
        let sql = format!(
            "UPDATE files SET status = ?, updated_at = ? WHERE id IN ({}) AND status IN ({})",
            placeholders(ids.len()),
            placeholders(from.len())
        );
        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(status.as_str()),
            Box::new(Utc::now().to_rfc3339()),
        ];
        all_params.extend(ids.iter().map(|id| Box::new(*id) as Box<dyn rusqlite::ToSql>));
        all_params.extend(from.into_iter().map(|s| Box::new(s) as Box<dyn rusqlite::ToSql>));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let changed = tx.execute(&sql, param_refs.as_slice())?;
        tx.commit()?;
        Ok(changed)
    }

    fn mark_compressed(
        &self,
        id: FileId,
        name: &str,
        path: &str,
        source_path: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let changed = tx.execute(
            "UPDATE files SET status = ?, last_error = NULL, name = ?, path = ?, updated_at = ? WHERE id = ? AND status = ?",
            params![
                FileStatus::Compressed.as_str(),
                name,
                path,
                now,
                id,
                FileStatus::Processing.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(Self::transition_error(&tx, id, FileStatus::Compressed));
        }

        if let Some(source_path) = source_path {
            tx.execute(
                "INSERT INTO source_files_to_delete (file_id, source_path, created_at) VALUES (?, ?, ?)",
                params![id, source_path, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn mark_failed(&self, id: FileId, attempts: u32, error: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let changed = tx.execute(
            "UPDATE files SET status = ?, failed_attempts = ?, last_error = ?, updated_at = ? WHERE id = ? AND status = ?",
            params![
                FileStatus::Failed.as_str(),
                attempts,
                error,
                now,
                id,
                FileStatus::Processing.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(Self::transition_error(&tx, id, FileStatus::Failed));
        }

        tx.execute(
            "INSERT INTO dead_letters (file_id, error_message, created_at) VALUES (?, ?, ?)",
            params![id, error, now],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn mark_retryable(&self, id: FileId, attempts: u32, error: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;

        let changed = conn.execute(
            "UPDATE files SET status = ?, failed_attempts = ?, last_error = ?, updated_at = ? WHERE id = ? AND status = ?",
            params![
                FileStatus::Pending.as_str(),
                attempts,
                error,
                Utc::now().to_rfc3339(),
                id,
                FileStatus::Processing.as_str()
            ],
        )?;
        if changed == 0 {
            let current: Option<String> = conn
                .query_row("SELECT status FROM files WHERE id = ?", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            return Err(match current {
                Some(status) => StoreError::InvalidTransition {
                    id,
                    from: status.parse().map_err(StoreError::Database)?,
                    to: FileStatus::Pending,
                },
                None => StoreError::NotFound(id),
            });
        }
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_id, error_message, created_at FROM dead_letters ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeadLetterRecord {
                id: row.get(0)?,
                file_id: row.get(1)?,
                error_message: row.get(2)?,
                created_at: parse_timestamp(&row.get::<_, String>(3)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn pending_source_deletions(
        &self,
        limit: usize,
    ) -> Result<Vec<SourceFileToDelete>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_id, source_path, created_at FROM source_files_to_delete ORDER BY id LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(SourceFileToDelete {
                id: row.get(0)?,
                file_id: row.get(1)?,
                source_path: row.get(2)?,
                created_at: parse_timestamp(&row.get::<_, String>(3)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn remove_source_deletion(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM source_files_to_delete WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    fn reset_processing(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE files SET status = ?, updated_at = ? WHERE status = ?",
            params![
                FileStatus::Pending.as_str(),
                Utc::now().to_rfc3339(),
                FileStatus::Processing.as_str()
            ],
        )?;
        Ok(changed)
    }
}
