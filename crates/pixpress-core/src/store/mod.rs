//! Persistent task state.
//!
//! The pipeline talks to the task table only through [`TaskStore`]. Every
//! status change that must be atomic with a bookkeeping row (deletion
//! obligations on success, dead letters on exhaustion) is a single store
//! call backed by one transaction.

mod sqlite;

pub use sqlite::SqliteTaskStore;

use crate::error::StoreError;
use crate::types::{DeadLetterRecord, FileId, FileStatus, FileTask, SourceFileToDelete};

/// Narrow repository over the file task table and its helper tables.
pub trait TaskStore: Send + Sync {
    /// Register a new `pending` task (used by the upload side and tests).
    fn create_task(&self, name: &str, path: &str) -> Result<FileTask, StoreError>;

    /// Get a task by id.
    fn get(&self, id: FileId) -> Result<Option<FileTask>, StoreError>;

    /// Load the tasks among `ids` that are still `pending`.
    fn fetch_pending_by_ids(&self, ids: &[FileId]) -> Result<Vec<FileTask>, StoreError>;

    /// Atomically move the `pending` tasks among `ids` to `processing` and
    /// return exactly the rows that were moved. Ids held by another run, or
    /// in any other status, are left untouched and omitted.
    fn claim_pending(&self, ids: &[FileId]) -> Result<Vec<FileTask>, StoreError>;

    /// Ids of every task with the given status.
    fn ids_with_status(&self, status: FileStatus) -> Result<Vec<FileId>, StoreError>;

    /// Set the status of all `ids`, returning the number of rows changed.
    fn bulk_set_status(&self, ids: &[FileId], status: FileStatus) -> Result<usize, StoreError>;

    /// `processing -> compressed` in one transaction: clear the error, rename
    /// the task, and record `source_path` for deferred deletion (if any).
    fn mark_compressed(
        &self,
        id: FileId,
        name: &str,
        path: &str,
        source_path: Option<&str>,
    ) -> Result<(), StoreError>;

    /// `processing -> failed` in one transaction together with a dead letter.
    fn mark_failed(&self, id: FileId, attempts: u32, error: &str) -> Result<(), StoreError>;

    /// `processing -> pending` with the new attempt count and error, so a
    /// later batch can pick the task up again.
    fn mark_retryable(&self, id: FileId, attempts: u32, error: &str) -> Result<(), StoreError>;

    /// All dead-letter records, oldest first.
    fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StoreError>;

    /// Outstanding source deletions, oldest first.
    fn pending_source_deletions(&self, limit: usize)
        -> Result<Vec<SourceFileToDelete>, StoreError>;

    /// Drop a fulfilled deletion obligation.
    fn remove_source_deletion(&self, id: i64) -> Result<(), StoreError>;

    /// Return rows stranded in `processing` to `pending`.
    fn reset_processing(&self) -> Result<usize, StoreError>;
}
