//! Three-stage concurrent transcode pipeline.
//!
//! ```text
//! dispatch ─▶ [read pool] ─▶ [transcode pool] ─▶ [write pool] ─▶ results
//!              workers/2        workers             workers/2
//! ```
//!
//! Stages are connected by bounded queues. Shutdown cascades: dispatch
//! closes the read queue, and each pool's drain closes the next stage's
//! input; the results channel closes once the write pool has drained.
//!
//! On cancellation a task that finished its read or transcode is not handed
//! on; it reaches the collector as
//! [`PipelineError::Cancelled`](crate::error::PipelineError::Cancelled) instead.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{PipelineConfig, ProcessingConfig};
use crate::types::FileTask;

use super::channel::{bounded_channel, WorkerPool};
use super::stages::{TaskResult, TranscodeJob, Transcoder, WriteJob};

/// Runs tasks through the read, transcode, and write pools.
pub struct ConcurrentPipeline {
    transcoder: Arc<Transcoder>,
    processing: ProcessingConfig,
    pipeline: PipelineConfig,
}

impl ConcurrentPipeline {
    pub fn new(
        transcoder: Arc<Transcoder>,
        processing: ProcessingConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            transcoder,
            processing,
            pipeline,
        }
    }

    /// Start processing `tasks` and return the stream of per-task results.
    ///
    /// The stream ends after every dispatched task has produced a result,
    /// or earlier if `cancel` fires. A task interrupted between stages then
    /// yields a cancelled result; tasks that were never picked up by a
    /// worker produce no result at all.
    pub fn run(&self, tasks: Vec<FileTask>, cancel: CancellationToken) -> mpsc::Receiver<TaskResult> {
        let io_workers = self.processing.io_workers();
        let cpu_workers = self.processing.parallel_workers.max(1);
        let capacity = self.pipeline.buffer_size.max(1);
        let (result_tx, result_rx) = bounded_channel::<TaskResult>(&self.pipeline);

        tracing::debug!(
            "Pipeline start: {} tasks, read/write workers {}, transcode workers {}",
            tasks.len(),
            io_workers,
            cpu_workers
        );

        let transcoder = self.transcoder.clone();
        let collector_tx = result_tx.clone();
        let write_pool = WorkerPool::spawn(
            "write",
            io_workers,
            capacity,
            cancel.clone(),
            move |job: WriteJob| {
                let transcoder = transcoder.clone();
                let result_tx = collector_tx.clone();
                async move {
                    let result = match job.output {
                        Ok(output) => transcoder.write(&job.task, output).await,
                        Err(e) => Err(e),
                    };
                    let id = job.task.id;
                    if result_tx.send(TaskResult { task: job.task, result }).await.is_err() {
                        tracing::warn!("Result collector gone; dropping result for file {}", id);
                    }
                }
            },
        );

        let transcoder = self.transcoder.clone();
        let write_tx = write_pool.sender();
        let token = cancel.clone();
        let interrupted_tx = result_tx.clone();
        let transcode_pool = WorkerPool::spawn(
            "transcode",
            cpu_workers,
            capacity,
            cancel.clone(),
            move |job: TranscodeJob| {
                let transcoder = transcoder.clone();
                let write_tx = write_tx.clone();
                let token = token.clone();
                let interrupted_tx = interrupted_tx.clone();
                async move {
                    let output = match job.source {
                        Ok(bytes) => transcoder.transcode(&job.task, bytes).await,
                        Err(e) => Err(e),
                    };
                    let job = WriteJob { task: job.task, output };
                    if token.is_cancelled() {
                        report_interrupted(&interrupted_tx, job.task).await;
                    } else if let Err(rejected) = write_tx.send(job).await {
                        report_interrupted(&interrupted_tx, rejected.0.task).await;
                    }
                }
            },
        );

        let transcoder = self.transcoder.clone();
        let transcode_tx = transcode_pool.sender();
        let token = cancel.clone();
        let interrupted_tx = result_tx;
        let read_pool = WorkerPool::spawn(
            "read",
            io_workers,
            capacity,
            cancel.clone(),
            move |task: FileTask| {
                let transcoder = transcoder.clone();
                let transcode_tx = transcode_tx.clone();
                let token = token.clone();
                let interrupted_tx = interrupted_tx.clone();
                async move {
                    let source = transcoder.read(&task).await;
                    let job = TranscodeJob { task, source };
                    if token.is_cancelled() {
                        report_interrupted(&interrupted_tx, job.task).await;
                    } else if let Err(rejected) = transcode_tx.send(job).await {
                        report_interrupted(&interrupted_tx, rejected.0.task).await;
                    }
                }
            },
        );

        tokio::spawn(async move {
            let total = tasks.len();
            let mut dispatched = 0usize;
            for task in tasks {
                let submitted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    res = read_pool.submit(task) => res.is_ok(),
                };
                if !submitted {
                    break;
                }
                dispatched += 1;
            }
            if dispatched < total {
                tracing::info!(
                    "Dispatch stopped after {}/{} tasks (cancelled)",
                    dispatched,
                    total
                );
            }

            read_pool.wait().await;
            transcode_pool.wait().await;
            write_pool.wait().await;
            tracing::debug!("Pipeline drained");
        });

        result_rx
    }
}

/// Hand a task that stopped between stages straight to the collector.
async fn report_interrupted(results: &mpsc::Sender<TaskResult>, task: FileTask) {
    let id = task.id;
    tracing::debug!("File {} interrupted between stages", id);
    if results.send(TaskResult::cancelled(task)).await.is_err() {
        tracing::warn!("Result collector gone; dropping result for file {}", id);
    }
}
