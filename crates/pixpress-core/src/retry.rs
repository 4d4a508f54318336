//! Persistent success/failure bookkeeping for finished tasks.
//!
//! The retry counter lives in the task row rather than in memory, so a task
//! returned to `pending` is simply picked up again by a later batch.

use std::sync::Arc;

use crate::error::{ErrorKind, PipelineError};
use crate::pipeline::TaskResult;
use crate::store::TaskStore;
use crate::types::{FileStatus, FileTask, TaskOutcome};

/// Applies per-task results to the task store.
pub struct RetryTracker {
    store: Arc<dyn TaskStore>,
    max_retries: u32,
}

impl RetryTracker {
    pub fn new(store: Arc<dyn TaskStore>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persist the terminal state of one task and return its outcome.
    pub fn record(&self, result: &TaskResult) -> TaskOutcome {
        match &result.result {
            Ok(file) => {
                let source = (file.key != result.task.path).then_some(result.task.path.as_str());
                if let Err(e) = self
                    .store
                    .mark_compressed(result.task.id, &file.name, &file.key, source)
                {
                    tracing::error!(
                        "CRITICAL: file {} was written to {} but marking it compressed failed: {}",
                        result.task.id,
                        file.key,
                        e
                    );
                } else {
                    tracing::debug!("File {} compressed to {}", result.task.id, file.key);
                }
                TaskOutcome::succeeded(result.task.id)
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => self.release(&result.task, e),
            Err(e) => self.record_failure(&result.task, e),
        }
    }

    fn record_failure(&self, task: &FileTask, error: &PipelineError) -> TaskOutcome {
        let attempts = task.failed_attempts.saturating_add(1);
        let message = error.to_string();

        if attempts >= self.max_retries {
            tracing::warn!(
                "File {} failed permanently after {} attempts: {}",
                task.id,
                attempts,
                message
            );
            if let Err(e) = self.store.mark_failed(task.id, attempts, &message) {
                tracing::error!(
                    "CRITICAL: could not record permanent failure of file {} (attempt {}): {}",
                    task.id,
                    attempts,
                    e
                );
            }
        } else {
            tracing::warn!(
                "File {} failed (attempt {}/{}, {:?}): {}",
                task.id,
                attempts,
                self.max_retries,
                error.kind(),
                message
            );
            if let Err(e) = self.store.mark_retryable(task.id, attempts, &message) {
                tracing::warn!(
                    "Could not return file {} to pending (attempt {}): {}",
                    task.id,
                    attempts,
                    e
                );
            }
        }

        TaskOutcome::failed(task.id, message)
    }

    /// Return an interrupted task to `pending` without spending an attempt.
    fn release(&self, task: &FileTask, error: &PipelineError) -> TaskOutcome {
        match self.store.bulk_set_status(&[task.id], FileStatus::Pending) {
            Ok(_) => tracing::debug!(
                "File {} released after cancellation (attempts still {})",
                task.id,
                task.failed_attempts
            ),
            Err(e) => tracing::warn!("Could not release cancelled file {}: {}", task.id, e),
        }
        TaskOutcome::failed(task.id, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TranscodedFile;
    use crate::store::SqliteTaskStore;
    use std::path::PathBuf;

    fn setup(max_retries: u32) -> (Arc<SqliteTaskStore>, RetryTracker, FileTask) {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let task = store.create_task("cat.png", "uploads/cat.png").unwrap();
        store.bulk_set_status(&[task.id], FileStatus::Processing).unwrap();
        let task = store.get(task.id).unwrap().unwrap();
        let tracker = RetryTracker::new(store.clone(), max_retries);
        (store, tracker, task)
    }

    fn codec_failure(task: &FileTask) -> TaskResult {
        TaskResult {
            task: task.clone(),
            result: Err(PipelineError::Decode {
                path: PathBuf::from(&task.path),
                message: "bad header".into(),
            }),
        }
    }

    #[test]
    fn test_success_marks_compressed_with_deletion_obligation() {
        let (store, tracker, task) = setup(3);
        let outcome = tracker.record(&TaskResult {
            task: task.clone(),
            result: Ok(TranscodedFile {
                name: "cat.webp".into(),
                key: "uploads/cat.webp".into(),
                bytes_written: 10,
            }),
        });

        assert!(outcome.success);
        let row = store.get(task.id).unwrap().unwrap();
        assert_eq!(row.status, FileStatus::Compressed);
        assert_eq!(row.name, "cat.webp");
        assert_eq!(row.path, "uploads/cat.webp");

        let deletions = store.pending_source_deletions(10).unwrap();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].source_path, "uploads/cat.png");
    }

    #[test]
    fn test_success_in_place_creates_no_deletion() {
        let (store, tracker, task) = setup(3);
        tracker.record(&TaskResult {
            task: task.clone(),
            result: Ok(TranscodedFile {
                name: "cat.png".into(),
                key: task.path.clone(),
                bytes_written: 10,
            }),
        });
        assert!(store.pending_source_deletions(10).unwrap().is_empty());
    }

    #[test]
    fn test_failure_below_max_returns_to_pending() {
        let (store, tracker, task) = setup(3);
        let outcome = tracker.record(&codec_failure(&task));

        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("bad header"));
        let row = store.get(task.id).unwrap().unwrap();
        assert_eq!(row.status, FileStatus::Pending);
        assert_eq!(row.failed_attempts, 1);
        assert!(row.last_error.is_some());
        assert!(store.dead_letters().unwrap().is_empty());
    }

    #[test]
    fn test_reaching_max_fails_once_with_one_dead_letter() {
        let (store, tracker, mut task) = setup(2);

        tracker.record(&codec_failure(&task));
        store.bulk_set_status(&[task.id], FileStatus::Processing).unwrap();
        task = store.get(task.id).unwrap().unwrap();
        assert_eq!(task.failed_attempts, 1);

        tracker.record(&codec_failure(&task));
        let row = store.get(task.id).unwrap().unwrap();
        assert_eq!(row.status, FileStatus::Failed);
        assert_eq!(row.failed_attempts, 2);

        // A stale duplicate result must not add a second record
        tracker.record(&codec_failure(&task));
        let letters = store.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].file_id, task.id);
    }

    #[test]
    fn test_cancelled_task_keeps_attempt_count() {
        let (store, tracker, task) = setup(3);
        let outcome = tracker.record(&TaskResult {
            task: task.clone(),
            result: Err(PipelineError::Cancelled {
                path: PathBuf::from(&task.path),
            }),
        });

        assert!(!outcome.success);
        let row = store.get(task.id).unwrap().unwrap();
        assert_eq!(row.status, FileStatus::Pending);
        assert_eq!(row.failed_attempts, 0);
    }

    #[test]
    fn test_zero_max_is_treated_as_one() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        assert_eq!(RetryTracker::new(store, 0).max_retries(), 1);
    }
}
