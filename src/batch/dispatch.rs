//! Chunk continuation dispatch.
//!
//! A batch job advances one chunk per worker invocation; after committing a
//! chunk the orchestrator dispatches the next invocation through one of
//! these. `LocalDispatcher` feeds an in-process worker loop; `HttpDispatcher`
//! posts to a remote worker endpoint for queue-backed deployments.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;

/// Schedules the next chunk-processing invocation for a job.
#[async_trait]
pub trait ChunkDispatcher: Send + Sync {
    /// Dispatch a worker invocation after `delay`. Returns a task id.
    async fn dispatch(&self, job_id: &str, delay: Duration) -> Result<String, JobError>;
}

/// Dispatches into an in-process worker loop over a channel.
pub struct LocalDispatcher {
    tx: mpsc::Sender<String>,
}

impl LocalDispatcher {
    /// Returns the dispatcher and the receiver the worker loop drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ChunkDispatcher for LocalDispatcher {
    async fn dispatch(&self, job_id: &str, delay: Duration) -> Result<String, JobError> {
        let task_id = Uuid::new_v4().to_string();
        let tx = self.tx.clone();
        let job_id_owned = job_id.to_string();
        let task = task_id.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if tx.send(job_id_owned.clone()).await.is_err() {
                warn!(job_id = %job_id_owned, task_id = %task, "Worker loop gone, dropping dispatch");
            }
        });
        debug!(job_id, task_id = %task_id, ?delay, "Dispatched local continuation");
        Ok(task_id)
    }
}

#[derive(Serialize)]
struct WorkerRequest<'a> {
    job_id: &'a str,
    task_id: &'a str,
}

/// Dispatches by posting to a remote `/batch-worker` endpoint.
pub struct HttpDispatcher {
    http: reqwest::Client,
    worker_url: String,
}

impl HttpDispatcher {
    pub fn new(worker_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            worker_url,
        }
    }
}

#[async_trait]
impl ChunkDispatcher for HttpDispatcher {
    async fn dispatch(&self, job_id: &str, delay: Duration) -> Result<String, JobError> {
        let task_id = Uuid::new_v4().to_string();
        let http = self.http.clone();
        let url = format!("{}/batch-worker", self.worker_url.trim_end_matches('/'));
        let job_id_owned = job_id.to_string();
        let task = task_id.clone();
        // Fire and forget; a lost dispatch is recovered by resuming the job
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let body = WorkerRequest {
                job_id: &job_id_owned,
                task_id: &task,
            };
            if let Err(e) = http.post(&url).json(&body).send().await {
                warn!(job_id = %job_id_owned, error = %e, "Worker dispatch failed");
            }
        });
        debug!(job_id, task_id = %task_id, ?delay, "Dispatched worker continuation");
        Ok(task_id)
    }
}
