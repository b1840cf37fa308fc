use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use magpie_types::JobRecord;

use crate::queue::JobQueue;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

/// Per-job handle passed to the handler: progress reporting plus the
/// cooperative cancellation token (fired when a cancel flag lands on the
/// broker or the pool shuts down).
#[derive(Clone)]
pub struct JobContext {
    queue: JobQueue,
    job_id: String,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(queue: JobQueue, job_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            queue,
            job_id: job_id.into(),
            cancel,
        }
    }

    pub async fn report_progress(&self, percent: u8, phase: &str) {
        if let Err(err) = self.queue.report_progress(&self.job_id, percent, phase).await {
            tracing::warn!(job_id = %self.job_id, "progress update failed: {err}");
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: JobRecord, ctx: JobContext) -> anyhow::Result<()>;
}

/// Long-lived polling workers, each handling one job at a time. Claims are
/// leased; if a worker dies mid-job the lease expires and another worker
/// re-claims (at-least-once, so handlers must be idempotent).
pub struct WorkerPool {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        settings: WorkerSettings,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(settings.concurrency.max(1));
        for worker_index in 0..settings.concurrency.max(1) {
            let queue = queue.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            let poll_interval = settings.poll_interval;
            tasks.push(tokio::spawn(async move {
                worker_loop(worker_index, queue, handler, shutdown, poll_interval).await;
            }));
        }
        Self { shutdown, tasks }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn worker_loop(
    worker_index: usize,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    tracing::debug!(worker_index, queue = queue.name(), "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if let Err(err) = queue.recover().await {
            tracing::warn!(worker_index, "queue recovery failed: {err}");
        }
        let claimed = match queue.claim_next().await {
            Ok(claimed) => claimed,
            Err(err) => {
                tracing::warn!(worker_index, "claim failed: {err}");
                None
            }
        };
        let Some(job) = claimed else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => continue,
            }
        };
        run_job(&queue, handler.as_ref(), job, &shutdown, poll_interval).await;
    }
    tracing::debug!(worker_index, "worker stopped");
}

async fn run_job(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: JobRecord,
    shutdown: &CancellationToken,
    poll_interval: Duration,
) {
    let job_id = job.id.clone();
    let timeout = Duration::from_millis(job.timeout_ms.max(1));
    let cancel = shutdown.child_token();

    // Watch the broker-side cancel flag so a cancel issued from any process
    // reaches this worker's token.
    let watcher = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        let job_id = job_id.clone();
        let interval = poll_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match queue.cancel_requested(&job_id).await {
                    Ok(true) => {
                        cancel.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::debug!(job_id = %job_id, "cancel poll failed: {err}");
                    }
                }
            }
        })
    };

    let ctx = JobContext {
        queue: queue.clone(),
        job_id: job_id.clone(),
        cancel: cancel.clone(),
    };
    let outcome = tokio::time::timeout(timeout, handler.handle(job, ctx)).await;
    cancel.cancel();
    let _ = watcher.await;

    match outcome {
        Ok(Ok(())) => {
            if let Err(err) = queue.complete(&job_id).await {
                tracing::warn!(job_id = %job_id, "completion bookkeeping failed: {err}");
            }
        }
        Ok(Err(err)) => {
            if let Err(err) = queue.fail(&job_id, &err.to_string()).await {
                tracing::warn!(job_id = %job_id, "failure bookkeeping failed: {err}");
            }
        }
        Err(_) => {
            let message = format!("job timed out after {}ms", timeout.as_millis());
            if let Err(err) = queue.fail(&job_id, &message).await {
                tracing::warn!(job_id = %job_id, "timeout bookkeeping failed: {err}");
            }
        }
    }
}
