//! In-memory job table with debounced write-through to disk.
//!
//! Each [`JobKind`] is persisted as its own JSON array under the data
//! directory, rewritten wholesale on every flush. On open, any record still
//! `queued` or `running` is rewritten to `interrupted`: its process did not
//! survive the restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::*;
use uuid::Uuid;

use crate::flush::{self, FlushHandle, FlushTarget};
use crate::{Error, Job, JobKind, JobUpdate, Result, Status};

pub const ANALYSIS_TABLE: &str = "analysis_jobs.json";
pub const DOWNLOAD_TABLE: &str = "download_jobs.json";

const KINDS: [JobKind; 2] = [JobKind::BatchAnalysis, JobKind::MediaDownload];

pub fn table_file(kind: JobKind) -> &'static str {
    match kind {
        JobKind::BatchAnalysis => ANALYSIS_TABLE,
        JobKind::MediaDownload => DOWNLOAD_TABLE,
    }
}

/// Everything needed to register a job before its process exists.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub input: String,
    pub slug: String,
    pub output_dir: PathBuf,
    pub log_file: PathBuf,
}

struct JobTable {
    data_dir: PathBuf,
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl FlushTarget for JobTable {
    fn flush(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let mut tables: HashMap<JobKind, Vec<Job>> = HashMap::new();
            {
                let jobs = self.jobs.read().await;
                for job in jobs.values() {
                    tables.entry(job.kind).or_default().push(job.clone());
                }
            }

            tokio::fs::create_dir_all(&self.data_dir)
                .await
                .with_context(|| format!("failed to create {}", self.data_dir.display()))?;

            for kind in KINDS {
                let mut jobs = tables.remove(&kind).unwrap_or_default();
                jobs.sort_by_key(|job| job.started);
                write_table(&self.data_dir.join(table_file(kind)), &jobs).await?;
            }
            trace!("Job tables flushed");
            Ok(())
        })
    }
}

async fn write_table(path: &Path, jobs: &[Job]) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(jobs)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

async fn read_table(path: &Path) -> anyhow::Result<Vec<Job>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

/// Rewrite a record whose process cannot have survived a restart.
fn recover(job: &mut Job, now: DateTime<Utc>) -> bool {
    if matches!(job.status, Status::Queued | Status::Running) {
        job.status = Status::Interrupted;
        job.ended.get_or_insert(now);
        true
    } else {
        false
    }
}

fn apply(job: &mut Job, update: JobUpdate) -> Result<()> {
    let next = update.status.unwrap_or(job.status);
    if next != job.status && !job.status.can_become(next) {
        return Err(Error::InvalidTransition {
            id: job.job_id,
            from: job.status,
            to: next,
        });
    }

    if matches!(job.status, Status::Queued | Status::Running) {
        if let Some(pct) = update.progress {
            job.progress = job.progress.max(pct.clamp(0.0, 100.0));
        }
        if let Some(phase) = update.phase {
            job.phase = Some(phase);
        }
    }

    job.status = next;
    if let Some(artifact) = update.artifact {
        job.artifact = Some(artifact);
    }
    if update.exit_code.is_some() {
        job.exit_code = update.exit_code;
    }
    if let Some(error) = update.error {
        job.error = Some(error);
    }
    if next.is_terminal() {
        job.ended.get_or_insert_with(Utc::now);
    }
    Ok(())
}

/// Read both tables and apply restart recovery in memory. Returns the jobs
/// and how many of them were rewritten to `interrupted`.
async fn load(data_dir: &Path) -> (HashMap<Uuid, Job>, usize) {
    let now = Utc::now();
    let mut jobs = HashMap::new();
    let mut interrupted = 0;

    for kind in KINDS {
        let path = data_dir.join(table_file(kind));
        match read_table(&path).await {
            Ok(records) => {
                for mut job in records {
                    if recover(&mut job, now) {
                        interrupted += 1;
                    }
                    jobs.insert(job.job_id, job);
                }
            }
            Err(err) => warn!(error = ?err, "Ignoring unreadable job table"),
        }
    }
    (jobs, interrupted)
}

#[derive(Clone)]
pub struct JobStore {
    table: Arc<JobTable>,
    flusher: FlushHandle,
}

impl JobStore {
    /// Load the persisted tables from `data_dir` and start the flusher.
    ///
    /// Unreadable tables are logged and treated as empty.
    pub async fn open(data_dir: impl Into<PathBuf>, flush_delay: Duration) -> Self {
        let data_dir = data_dir.into();
        let (jobs, interrupted) = load(&data_dir).await;

        info!(jobs = jobs.len(), interrupted, "Job store loaded");

        let table = Arc::new(JobTable {
            data_dir,
            jobs: RwLock::new(jobs),
        });
        let flusher = flush::spawn(table.clone(), flush_delay);
        if interrupted > 0 {
            warn!(count = interrupted, "Marked orphaned jobs as interrupted");
            flusher.flush_now().await;
        }

        JobStore { table, flusher }
    }

    /// The persisted jobs as a fresh [`open`](Self::open) would report
    /// them, oldest first. Nothing is written, so this is safe to run next
    /// to a live store that owns the same directory.
    pub async fn load_snapshot(data_dir: &Path) -> Vec<Job> {
        let (jobs, _) = load(data_dir).await;
        let mut jobs: Vec<Job> = jobs.into_values().collect();
        jobs.sort_by_key(|job| job.started);
        jobs
    }

    /// Register a job as `queued` and reserve its output directory. The job
    /// is visible to [`get`](Self::get) as soon as this returns.
    pub async fn create(&self, new: NewJob) -> Result<Job> {
        tokio::fs::create_dir_all(&new.output_dir).await?;

        let job = Job {
            job_id: new.job_id,
            kind: new.kind,
            status: Status::Queued,
            progress: 0.0,
            phase: None,
            slug: new.slug,
            input: new.input,
            output_dir: new.output_dir,
            log_file: new.log_file,
            started: Utc::now(),
            ended: None,
            artifact: None,
            exit_code: None,
            error: None,
        };

        self.table.jobs.write().await.insert(job.job_id, job.clone());
        self.flusher.schedule();
        debug!(job_id = %job.job_id, kind = %job.kind, slug = %job.slug, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.table.jobs.read().await.get(id).cloned()
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.table.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.started);
        jobs
    }

    /// The single mutation entry point. Terminal transitions are written to
    /// disk before this returns; everything else is debounced.
    pub async fn transition(&self, id: &Uuid, update: JobUpdate) -> Result<Job> {
        let job = {
            let mut jobs = self.table.jobs.write().await;
            let job = jobs.get_mut(id).ok_or_else(|| Error::job_not_found(id))?;
            let was_terminal = job.status.is_terminal();
            apply(job, update)?;
            if job.status.is_terminal() && !was_terminal {
                debug!(job_id = %id, status = %job.status, "Job finished");
            }
            job.clone()
        };

        if job.status.is_terminal() {
            self.flusher.flush_now().await;
        } else {
            self.flusher.schedule();
        }
        Ok(job)
    }

    /// Write pending state and stop the flusher.
    pub async fn shutdown(&self) {
        self.flusher.shutdown().await;
    }
}
