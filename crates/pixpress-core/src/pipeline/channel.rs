//! Bounded channels and worker pools for the staged pipeline.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;

/// Create a bounded channel pair with the configured buffer size.
///
/// When the buffer is full, the sender will block, providing backpressure
/// between stages.
pub fn bounded_channel<T>(config: &PipelineConfig) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(config.buffer_size.max(1))
}

/// A fixed-size pool of workers draining one bounded input queue.
///
/// Workers share the queue receiver. Each worker exits when the queue is
/// closed and empty, or when the cancellation token fires between jobs; a
/// job that is already running always finishes. The handler is owned by the
/// workers only, so anything it captures (typically the next stage's
/// sender) is released once the last worker exits.
pub struct WorkerPool<J> {
    name: &'static str,
    input: mpsc::Sender<J>,
    workers: JoinSet<()>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `size` workers (at least one) running `handler` for each job.
    pub fn spawn<F, Fut>(
        name: &'static str,
        size: usize,
        capacity: usize,
        cancel: CancellationToken,
        handler: F,
    ) -> Self
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (input, rx) = mpsc::channel::<J>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        let mut workers = JoinSet::new();

        for worker_id in 0..size.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                loop {
                    let job = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::debug!("{} worker {} stopping: cancelled", name, worker_id);
                            break;
                        }
                        job = async { rx.lock().await.recv().await } => job,
                    };

                    match job {
                        Some(job) => handler(job).await,
                        None => break,
                    }
                }
            });
        }

        tracing::trace!("Started {} pool with {} workers", name, size.max(1));
        Self {
            name,
            input,
            workers,
        }
    }

    /// A sender feeding this pool's input queue.
    pub fn sender(&self) -> mpsc::Sender<J> {
        self.input.clone()
    }

    /// Queue a job, waiting for buffer space. Returns the job if every
    /// worker has already exited.
    pub async fn submit(&self, job: J) -> Result<(), J> {
        self.input.send(job).await.map_err(|e| e.0)
    }

    /// Close the input queue and wait until every worker has exited.
    ///
    /// Other senders obtained through [`sender`](Self::sender) keep the queue
    /// open until they are dropped too.
    pub async fn wait(self) {
        let Self {
            name,
            input,
            mut workers,
        } = self;
        drop(input);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("{} worker terminated abnormally: {}", name, e);
            }
        }
        tracing::trace!("{} pool drained", name);
    }
}
