//! The narrow interface the request layer calls into.
//!
//! [`Orchestrator`] is constructed once at process start and shared with
//! handlers. Job ids arrive as strings from URLs; anything that is not a
//! known job is `NotFound`.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::config::ConfigContext;
use crate::logbuf::LogEntry;
use crate::profile::Profiles;
use crate::store::JobStore;
use crate::supervisor::{JobSupervisor, LogEvent};
use crate::worker::{WorkerOptions, WorkerResponse, WorkerStatus, WorkerSupervisor};
use crate::{CreatedJob, Error, Job, JobKind, JobRequest, Result};

pub struct Orchestrator {
    jobs: Arc<JobSupervisor>,
    worker: WorkerSupervisor,
}

impl Orchestrator {
    /// Recover the persisted job tables and start the launchers.
    pub async fn start(config: &ConfigContext, cancel_token: CancellationToken) -> Result<Self> {
        let store = JobStore::open(&config.data_dir, config.flush_delay()).await;
        let jobs = JobSupervisor::start(config, store, Profiles::from_config(config), cancel_token);
        let worker = WorkerSupervisor::from_config(config)?;
        Ok(Orchestrator { jobs, worker })
    }

    pub fn from_parts(jobs: Arc<JobSupervisor>, worker: WorkerSupervisor) -> Self {
        Orchestrator { jobs, worker }
    }

    pub fn jobs(&self) -> &Arc<JobSupervisor> {
        &self.jobs
    }

    pub fn worker(&self) -> &WorkerSupervisor {
        &self.worker
    }

    pub async fn create_job(&self, kind: JobKind, request: JobRequest) -> Result<CreatedJob> {
        self.jobs.create_job(kind, request).await
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Job> {
        self.jobs.job_status(&parse_job_id(job_id)?).await
    }

    /// Chronological, most recent `max_lines`.
    pub async fn tail_logs(&self, job_id: &str, max_lines: usize) -> Result<Vec<LogEntry>> {
        self.jobs.tail_logs(&parse_job_id(job_id)?, max_lines).await
    }

    pub async fn stream_logs(&self, job_id: &str) -> Result<BoxStream<'static, LogEvent>> {
        self.jobs.stream_logs(&parse_job_id(job_id)?).await
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.jobs.list_jobs().await
    }

    pub async fn kill_job(&self, job_id: &str) -> Result<()> {
        self.jobs.kill_job(&parse_job_id(job_id)?).await
    }

    pub async fn ensure_worker_started(&self, opts: WorkerOptions) -> Result<WorkerStatus> {
        self.worker.ensure_started(opts).await
    }

    pub async fn stop_worker(&self) -> WorkerStatus {
        self.worker.stop().await;
        self.worker.status().await
    }

    pub async fn get_worker_status(&self) -> WorkerStatus {
        self.worker.status().await
    }

    pub async fn forward_to_worker(
        &self,
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<WorkerResponse> {
        self.worker.forward(method, path, payload).await
    }

    pub async fn proxy_worker_stream(
        &self,
        worker_job_id: &str,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        self.worker.proxy_stream(worker_job_id).await
    }

    pub fn worker_logs(&self, max_lines: usize) -> Vec<LogEntry> {
        self.worker.logs().tail(max_lines)
    }

    pub fn stream_worker_logs(&self) -> BoxStream<'static, LogEntry> {
        self.worker.logs().subscribe().into_stream().boxed()
    }

    /// Stop the worker, the launchers and the flusher, in that order.
    pub async fn shutdown(&self) {
        if self.worker.stop().await {
            debug!("Worker stopped during shutdown");
        }
        self.jobs.shutdown().await;
    }
}

fn parse_job_id(job_id: &str) -> Result<Uuid> {
    Uuid::parse_str(job_id).map_err(|_| Error::NotFound(format!("no such job {job_id}")))
}
