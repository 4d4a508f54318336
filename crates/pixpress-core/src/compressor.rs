//! Compression orchestrator: one batch of file ids in, outcomes and a
//! resource summary out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PipelineConfig, ProcessingConfig};
use crate::error::Result;
use crate::monitor::{bytes_to_mb, cpu_percent, process_cpu_time, ResourceMonitor};
use crate::pipeline::{ConcurrentPipeline, SequentialRunner, Transcoder};
use crate::queue::BatchHandler;
use crate::retry::RetryTracker;
use crate::storage::Storage;
use crate::store::TaskStore;
use crate::types::{CompressionReport, CompressionSummary, FileId, FileStatus};

/// Runs batches of pending tasks through the transcode pipeline.
pub struct Compressor {
    store: Arc<dyn TaskStore>,
    transcoder: Arc<Transcoder>,
    tracker: RetryTracker,
    monitor: ResourceMonitor,
    processing: ProcessingConfig,
    pipeline: PipelineConfig,
}

impl Compressor {
    pub fn new(config: &Config, store: Arc<dyn TaskStore>, storage: Arc<dyn Storage>) -> Self {
        Self {
            transcoder: Arc::new(Transcoder::new(storage, config.compression.clone())),
            tracker: RetryTracker::new(store.clone(), config.retry.max_retries),
            monitor: ResourceMonitor::new(Duration::from_millis(config.monitor.sample_interval_ms)),
            processing: config.processing.clone(),
            pipeline: config.pipeline.clone(),
            store,
        }
    }

    /// Compress the tasks among `ids` that are still pending.
    ///
    /// Pending tasks are claimed atomically; ids that are not pending, or
    /// that another run claimed first, are reported as skipped. Tasks
    /// interrupted by cancellation go back to `pending` without spending an
    /// attempt and are left out of the outcomes.
    pub async fn compress(&self, ids: &[FileId], cancel: &CancellationToken) -> Result<CompressionReport> {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<FileId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let tasks = self.store.claim_pending(&ids)?;
        let claimed: HashSet<FileId> = tasks.iter().map(|t| t.id).collect();
        let skipped: Vec<FileId> = ids.iter().copied().filter(|id| !claimed.contains(id)).collect();

        let mut summary = CompressionSummary {
            requested: ids.len(),
            skipped: skipped.len(),
            ..CompressionSummary::default()
        };

        if tasks.is_empty() {
            tracing::debug!("No pending tasks among {} id(s)", ids.len());
            return Ok(CompressionReport {
                outcomes: Vec::new(),
                skipped,
                summary,
            });
        }

        let task_ids: Vec<FileId> = tasks.iter().map(|t| t.id).collect();
        summary.processed = tasks.len();

        let monitor = self.monitor.start();
        let cpu_before = process_cpu_time();
        let started = Instant::now();

        let mut results = if self.processing.concurrent {
            ConcurrentPipeline::new(
                self.transcoder.clone(),
                self.processing.clone(),
                self.pipeline.clone(),
            )
            .run(tasks, cancel.clone())
        } else {
            SequentialRunner::new(self.transcoder.clone()).run(tasks, cancel.clone())
        };

        let mut outcomes = Vec::with_capacity(task_ids.len());
        let mut finished = HashSet::with_capacity(task_ids.len());
        while let Some(result) = results.recv().await {
            finished.insert(result.task.id);
            let outcome = self.tracker.record(&result);
            if result.is_cancelled() {
                summary.cancelled += 1;
                continue;
            }
            if outcome.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            outcomes.push(outcome);
        }

        let unfinished: Vec<FileId> = task_ids
            .iter()
            .copied()
            .filter(|id| !finished.contains(id))
            .collect();
        if !unfinished.is_empty() {
            let released = self.store.bulk_set_status(&unfinished, FileStatus::Pending)?;
            tracing::info!(
                "Run cancelled: released {} of {} unstarted task(s) back to pending",
                released,
                unfinished.len()
            );
            summary.cancelled += unfinished.len();
        }

        summary.elapsed = started.elapsed();
        let peak = monitor.stop().await;
        summary.peak_memory_mb = bytes_to_mb(peak);
        summary.cpu_percent = match (cpu_before, process_cpu_time()) {
            (Some(before), Some(after)) => cpu_percent(after.saturating_sub(before), summary.elapsed),
            _ => 0.0,
        };

        tracing::info!(
            "Compressed {} file(s): {} ok, {} failed, {} skipped, {} cancelled in {:.2?} (cpu {:.1}%, peak {:.1} MB)",
            summary.processed,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.cancelled,
            summary.elapsed,
            summary.cpu_percent,
            summary.peak_memory_mb
        );

        Ok(CompressionReport {
            outcomes,
            skipped,
            summary,
        })
    }
}

#[async_trait]
impl BatchHandler for Compressor {
    async fn handle(&self, ids: &[FileId], cancel: &CancellationToken) -> Result<CompressionReport> {
        self.compress(ids, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::pipeline::codec::tests::png_bytes;
    use crate::storage::tests::GatedStorage;
    use crate::storage::LocalStorage;
    use crate::store::SqliteTaskStore;
    use crate::types::{DeadLetterRecord, FileTask, SourceFileToDelete};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        store: Arc<SqliteTaskStore>,
        config: Config,
        compressor: Compressor,
    }

    fn fixture(concurrent: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());

        let mut config = Config::default();
        config.processing.concurrent = concurrent;
        config.processing.parallel_workers = 2;
        config.monitor.sample_interval_ms = 5;

        let compressor = Compressor::new(&config, store.clone(), Arc::new(LocalStorage::new(&root)));
        Fixture {
            _dir: dir,
            root,
            store,
            config,
            compressor,
        }
    }

    impl Fixture {
        fn compressor_over(&self, store: Arc<dyn TaskStore>, storage: Arc<dyn Storage>) -> Compressor {
            Compressor::new(&self.config, store, storage)
        }

        fn add(&self, key: &str, bytes: &[u8]) -> FileId {
            let path = self.root.join(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, bytes).unwrap();
            let name = key.rsplit('/').next().unwrap();
            self.store.create_task(name, key).unwrap().id
        }
    }

    async fn mixed_batch(concurrent: bool) {
        let f = fixture(concurrent);
        let ok1 = f.add("up/one.png", &png_bytes(40, 20));
        let ok2 = f.add("up/two.png", &png_bytes(10, 10));
        let bad = f.add("up/bad.png", b"broken");

        let report = f
            .compressor
            .compress(&[ok1, ok2, bad], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.summary.requested, 3);
        assert_eq!(report.summary.processed, 3);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.summary.cpu_percent >= 0.0);

        let one = f.store.get(ok1).unwrap().unwrap();
        assert_eq!(one.status, FileStatus::Compressed);
        assert_eq!(one.path, "up/one.webp");
        assert!(f.root.join("up/one.webp").exists());

        let broken = f.store.get(bad).unwrap().unwrap();
        assert_eq!(broken.status, FileStatus::Pending);
        assert_eq!(broken.failed_attempts, 1);

        assert_eq!(f.store.pending_source_deletions(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_batch() {
        mixed_batch(true).await;
    }

    #[tokio::test]
    async fn test_sequential_batch() {
        mixed_batch(false).await;
    }

    #[tokio::test]
    async fn test_stale_and_unknown_ids_are_skipped() {
        let f = fixture(true);
        let done = f.add("a.png", &png_bytes(4, 4));
        f.store.bulk_set_status(&[done], FileStatus::Processing).unwrap();

        let report = f
            .compressor
            .compress(&[done, 4242], &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(report.skipped, vec![done, 4242]);
        assert_eq!(report.summary.processed, 0);
    }

    #[tokio::test]
    async fn test_duplicate_ids_processed_once() {
        let f = fixture(true);
        let id = f.add("a.png", &png_bytes(4, 4));

        let report = f
            .compressor
            .compress(&[id, id, id], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.summary.requested, 1);
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_tasks_without_attempts() {
        let f = fixture(false);
        let ids: Vec<FileId> = (0..3)
            .map(|i| f.add(&format!("f{i}.png"), &png_bytes(4, 4)))
            .collect();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = f.compressor.compress(&ids, &cancel).await.unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(report.summary.cancelled, 3);
        for id in ids {
            let task = f.store.get(id).unwrap().unwrap();
            assert_eq!(task.status, FileStatus::Pending);
            assert_eq!(task.failed_attempts, 0);
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_returns_unfinished_tasks_to_pending() {
        let f = fixture(true);
        let ids: Vec<FileId> = (0..3)
            .map(|i| f.add(&format!("f{i}.png"), &png_bytes(4, 4)))
            .collect();
        let (storage, mut opened, gate) = GatedStorage::new(&f.root);
        let compressor = f.compressor_over(f.store.clone(), Arc::new(storage));

        let cancel = CancellationToken::new();
        let interrupt = async {
            opened.recv().await.unwrap();
            cancel.cancel();
            gate.add_permits(3);
        };
        let (report, _) = tokio::join!(compressor.compress(&ids, &cancel), interrupt);
        let report = report.unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(report.summary.processed, 3);
        assert_eq!(report.summary.cancelled, 3);
        for id in ids {
            let task = f.store.get(id).unwrap().unwrap();
            assert_eq!(task.status, FileStatus::Pending);
            assert_eq!(task.failed_attempts, 0);
        }
        assert!(f.store.pending_source_deletions(10).unwrap().is_empty());
    }

    /// Store where another run claims `contested` just before every claim.
    struct ContendedStore {
        inner: Arc<SqliteTaskStore>,
        contested: Vec<FileId>,
    }

    impl TaskStore for ContendedStore {
        fn create_task(&self, name: &str, path: &str) -> std::result::Result<FileTask, StoreError> {
            self.inner.create_task(name, path)
        }
        fn get(&self, id: FileId) -> std::result::Result<Option<FileTask>, StoreError> {
            self.inner.get(id)
        }
        fn fetch_pending_by_ids(&self, ids: &[FileId]) -> std::result::Result<Vec<FileTask>, StoreError> {
            self.inner.fetch_pending_by_ids(ids)
        }
        fn claim_pending(&self, ids: &[FileId]) -> std::result::Result<Vec<FileTask>, StoreError> {
            self.inner.claim_pending(&self.contested)?;
            self.inner.claim_pending(ids)
        }
        fn ids_with_status(&self, status: FileStatus) -> std::result::Result<Vec<FileId>, StoreError> {
            self.inner.ids_with_status(status)
        }
        fn bulk_set_status(&self, ids: &[FileId], status: FileStatus) -> std::result::Result<usize, StoreError> {
            self.inner.bulk_set_status(ids, status)
        }
        fn mark_compressed(
            &self,
            id: FileId,
            name: &str,
            path: &str,
            source_path: Option<&str>,
        ) -> std::result::Result<(), StoreError> {
            self.inner.mark_compressed(id, name, path, source_path)
        }
        fn mark_failed(&self, id: FileId, attempts: u32, error: &str) -> std::result::Result<(), StoreError> {
            self.inner.mark_failed(id, attempts, error)
        }
        fn mark_retryable(&self, id: FileId, attempts: u32, error: &str) -> std::result::Result<(), StoreError> {
            self.inner.mark_retryable(id, attempts, error)
        }
        fn dead_letters(&self) -> std::result::Result<Vec<DeadLetterRecord>, StoreError> {
            self.inner.dead_letters()
        }
        fn pending_source_deletions(
            &self,
            limit: usize,
        ) -> std::result::Result<Vec<SourceFileToDelete>, StoreError> {
            self.inner.pending_source_deletions(limit)
        }
        fn remove_source_deletion(&self, id: i64) -> std::result::Result<(), StoreError> {
            self.inner.remove_source_deletion(id)
        }
        fn reset_processing(&self) -> std::result::Result<usize, StoreError> {
            self.inner.reset_processing()
        }
    }

    #[tokio::test]
    async fn test_task_claimed_by_another_run_is_skipped() {
        let f = fixture(true);
        let ours = f.add("ours.png", &png_bytes(4, 4));
        let theirs = f.add("theirs.png", &png_bytes(4, 4));
        let store = Arc::new(ContendedStore {
            inner: f.store.clone(),
            contested: vec![theirs],
        });
        let compressor = f.compressor_over(store, Arc::new(LocalStorage::new(&f.root)));

        let report = compressor
            .compress(&[ours, theirs], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.skipped, vec![theirs]);
        assert_eq!(report.summary.processed, 1);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].file_id, ours);

        // The other run's row is untouched
        let held = f.store.get(theirs).unwrap().unwrap();
        assert_eq!(held.status, FileStatus::Processing);
        assert_eq!(held.path, "theirs.png");
        assert!(!f.root.join("theirs.webp").exists());
        assert_eq!(f.store.get(ours).unwrap().unwrap().status, FileStatus::Compressed);
    }

    #[tokio::test]
    async fn test_exhausted_task_is_dead_lettered() {
        let f = fixture(true);
        let bad = f.add("bad.png", b"nope");

        for _ in 0..Config::default().retry.max_retries {
            f.compressor
                .compress(&[bad], &CancellationToken::new())
                .await
                .unwrap();
        }

        let task = f.store.get(bad).unwrap().unwrap();
        assert_eq!(task.status, FileStatus::Failed);
        assert_eq!(task.failed_attempts, 3);
        assert_eq!(f.store.dead_letters().unwrap().len(), 1);
    }
}
