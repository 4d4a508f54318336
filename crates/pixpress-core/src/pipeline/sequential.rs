//! Single-task-at-a-time fallback used when concurrency is disabled.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::FileTask;

use super::stages::{TaskResult, Transcoder};

/// Processes tasks one after another with the same stage logic as the
/// concurrent pipeline, producing results in the same shape.
pub struct SequentialRunner {
    transcoder: Arc<Transcoder>,
}

impl SequentialRunner {
    pub fn new(transcoder: Arc<Transcoder>) -> Self {
        Self { transcoder }
    }

    /// Start processing `tasks` in order; cancellation is checked before each.
    pub fn run(&self, tasks: Vec<FileTask>, cancel: CancellationToken) -> mpsc::Receiver<TaskResult> {
        let (tx, rx) = mpsc::channel(1);
        let transcoder = self.transcoder.clone();

        tokio::spawn(async move {
            let total = tasks.len();
            for (index, task) in tasks.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    tracing::info!("Sequential run cancelled after {}/{} tasks", index, total);
                    break;
                }
                let result = transcoder.process(&task).await;
                if tx.send(TaskResult { task, result }).await.is_err() {
                    tracing::warn!("Result collector gone; stopping sequential run");
                    break;
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;
    use crate::pipeline::codec::tests::png_bytes;
    use crate::pipeline::stages::tests::task;
    use crate::storage::LocalStorage;

    fn runner(root: &std::path::Path) -> SequentialRunner {
        SequentialRunner::new(Arc::new(Transcoder::new(
            Arc::new(LocalStorage::new(root)),
            CompressionConfig::default(),
        )))
    }

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), png_bytes(4, 4)).unwrap();
        std::fs::write(dir.path().join("c.png"), png_bytes(4, 4)).unwrap();

        let tasks = vec![task(1, "a.png"), task(2, "b.png"), task(3, "c.png")];
        let mut rx = runner(dir.path()).run(tasks, CancellationToken::new());

        let mut seen = Vec::new();
        while let Some(r) = rx.recv().await {
            seen.push((r.task.id, r.result.is_ok()));
        }
        assert_eq!(seen, vec![(1, true), (2, false), (3, true)]);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_task() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut rx = runner(dir.path()).run(vec![task(1, "a.png")], cancel);
        assert!(rx.recv().await.is_none());
    }
}
