//! Background task execution.
//!
//! Tasks travel as JSON through a [`TaskQueue`]: an in-process channel for
//! single-process deployments, or a Redis list shared by every worker
//! process (`LPUSH` to enqueue, `BRPOP` to dequeue). A [`Worker`] runs
//! `concurrency` consumers plus an optional scheduler that enqueues
//! periodic scans and the expiry sweep. A failing task has already been
//! recorded on its job; the consumer logs it and moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::{StoreBackend, WorkerConfig};
use crate::error::{PipelineError, Result};
use crate::scanner::ScanMode;
use crate::services::Services;

/// How long a consumer blocks on an empty queue before rechecking shutdown.
const POP_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    IngestUpload { document_id: String, job_id: i64 },
    ScanIncremental { source_id: i64 },
    ScanFullAudit { source_id: i64 },
    CleanupExpired,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, task: &Task) -> Result<()>;

    /// Wait up to `wait` for a task.
    async fn pop(&self, wait: Duration) -> Result<Option<Task>>;
}

// ============ Memory queue ============

pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, task: &Task) -> Result<()> {
        self.tx
            .send(task.clone())
            .map_err(|_| PipelineError::Queue("memory queue closed".into()))
    }

    async fn pop(&self, wait: Duration) -> Result<Option<Task>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(task) => Ok(task),
            Err(_) => Ok(None),
        }
    }
}

// ============ Redis queue ============

#[derive(Clone)]
pub struct RedisQueue {
    connection: ConnectionManager,
    key: String,
}

fn queue_error(e: redis::RedisError) -> PipelineError {
    PipelineError::Queue(e.to_string())
}

impl RedisQueue {
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(queue_error)?;
        let connection = ConnectionManager::new(client).await.map_err(queue_error)?;
        Ok(Self {
            connection,
            key: key.into(),
        })
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push(&self, task: &Task) -> Result<()> {
        let mut conn = self.connection.clone();
        let payload = serde_json::to_string(task)?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<Task>> {
        let mut conn = self.connection.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.key)
            .arg(wait.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

pub async fn queue_from_config(config: &WorkerConfig) -> Result<Arc<dyn TaskQueue>> {
    match config.queue {
        StoreBackend::Memory => Ok(Arc::new(MemoryQueue::new())),
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| PipelineError::Queue("worker.redis_url is not set".into()))?;
            Ok(Arc::new(RedisQueue::connect(url, config.queue_key.clone()).await?))
        }
    }
}

// ============ Worker ============

/// Execute one task to completion.
pub async fn run_task(services: &Services, task: &Task) -> Result<()> {
    match task {
        Task::IngestUpload {
            document_id,
            job_id,
        } => {
            services.ingest_upload(document_id, *job_id).await?;
        }
        Task::ScanIncremental { source_id } => {
            services.scanner.scan(*source_id, ScanMode::Incremental).await?;
        }
        Task::ScanFullAudit { source_id } => {
            services.scanner.scan(*source_id, ScanMode::FullAudit).await?;
        }
        Task::CleanupExpired => {
            services.cleanup_expired().await?;
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct Worker {
    services: Arc<Services>,
    queue: Arc<dyn TaskQueue>,
    concurrency: usize,
}

impl Worker {
    pub fn new(services: Arc<Services>, queue: Arc<dyn TaskQueue>, concurrency: usize) -> Self {
        Self {
            services,
            queue,
            concurrency: concurrency.max(1),
        }
    }

    /// Run consumers (and the scheduler, if asked) until `shutdown` turns true.
    pub async fn run(&self, schedule: bool, shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(concurrency = self.concurrency, schedule, "worker started");
        let mut handles = Vec::with_capacity(self.concurrency + 1);
        for slot in 0..self.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.consume(slot, shutdown).await }));
        }
        if schedule {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.schedule(shutdown).await }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
        tracing::info!("worker stopped");
        Ok(())
    }

    async fn consume(&self, slot: usize, shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let task = match self.queue.pop(POP_WAIT).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(slot, error = %e, "queue unavailable");
                    tokio::time::sleep(POP_WAIT).await;
                    continue;
                }
            };

            tracing::info!(slot, ?task, "task started");
            match run_task(&self.services, &task).await {
                Ok(()) => tracing::info!(slot, ?task, "task finished"),
                Err(e) => tracing::error!(slot, ?task, error = %e, "task failed"),
            }
        }
    }

    async fn schedule(&self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.services.config.worker;
        let mut cleanup =
            tokio::time::interval(Duration::from_secs(config.cleanup_interval_secs.max(1)));
        // Without an interval the scan timer never fires.
        let scan_period = config.scan_interval_secs.map(|s| Duration::from_secs(s.max(1)));
        let mut scans = tokio::time::interval(scan_period.unwrap_or(Duration::from_secs(u32::MAX as u64)));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = cleanup.tick() => {
                    self.enqueue(Task::CleanupExpired).await;
                }
                _ = scans.tick(), if scan_period.is_some() => {
                    match self.services.sources.list_enabled().await {
                        Ok(sources) => {
                            for source in sources {
                                self.enqueue(Task::ScanIncremental { source_id: source.id }).await;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "could not list sources for scheduled scan"),
                    }
                }
            }
        }
    }

    async fn enqueue(&self, task: Task) {
        if let Err(e) = self.queue.push(&task).await {
            tracing::warn!(?task, error = %e, "could not enqueue scheduled task");
        }
    }
}

/// A shutdown signal that flips to `true` on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}
