//! Drives jobs through `queued → running → {done, failed}`.
//!
//! Created jobs are pushed onto a queue consumed by a fixed pool of
//! launcher tasks. A launcher spawns the job's process, feeds its output
//! into the job's [`LogBuffer`] and log file, scrapes progress, and decides
//! the terminal status when the process ends. Failures of any one job are
//! recorded on that job and never stop the launchers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::config::ConfigContext;
use crate::logbuf::{LogBuffer, LogEntry, BACKLOG};
use crate::profile::{JobProfile, Profiles};
use crate::progress::{MetaProgress, MetaSnapshot};
use crate::runner::{self, ProcessEvent, ProcessHandle};
use crate::store::{JobStore, NewJob};
use crate::{CreatedJob, Error, Job, JobKind, JobRequest, JobUpdate, Result, Status};

const MAX_SLUG_LEN: usize = 128;

/// A job waiting for a free launcher, with the options for its tool.
#[derive(Debug)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub opts: serde_json::Value,
}

/// One item of a job's log stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LogEvent {
    Line(LogEntry),
    /// Last item of every stream, carrying the job's final status.
    End { status: Status },
}

#[derive(Default)]
struct Runs {
    active: HashMap<Uuid, ProcessHandle>,
    killed: HashSet<Uuid>,
}

pub struct JobSupervisor {
    store: JobStore,
    profiles: Profiles,
    artifacts_root: PathBuf,
    artifact_settle: Duration,
    logs: RwLock<HashMap<Uuid, Arc<LogBuffer>>>,
    runs: Mutex<Runs>,
    send_to_queue: Sender<QueuedJob>,
    cancel_token: CancellationToken,
    launchers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobSupervisor {
    /// Build the supervisor and spawn `config.max_active` launchers.
    pub fn start(
        config: &ConfigContext,
        store: JobStore,
        profiles: Profiles,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        let (send_to_queue, recv_from_queue) = async_channel::unbounded::<QueuedJob>();

        Arc::new_cyclic(|weak: &Weak<JobSupervisor>| {
            let mut launchers = vec![];
            for _ in 0..config.max_active.max(1) {
                let cancel_token = cancel_token.clone();
                let recv_from_queue = recv_from_queue.clone();
                let supervisor = weak.clone();
                launchers.push(tokio::spawn(
                    launch(cancel_token, recv_from_queue, supervisor)
                        .instrument(info_span!("launcher")),
                ));
            }

            JobSupervisor {
                store,
                profiles,
                artifacts_root: config.artifacts_root.clone(),
                artifact_settle: config.artifact_settle(),
                logs: RwLock::new(HashMap::new()),
                runs: Mutex::new(Runs::default()),
                send_to_queue,
                cancel_token,
                launchers: Mutex::new(launchers),
            }
        })
    }

    /// Register a job and queue it for launch. Nothing touches the disk
    /// or spawns anything when validation fails.
    pub async fn create_job(&self, kind: JobKind, request: JobRequest) -> Result<CreatedJob> {
        let input = request
            .input
            .map(|input| input.trim().to_string())
            .filter(|input| !input.is_empty())
            .ok_or_else(|| Error::InvalidInput("missing input".into()))?;

        let job_id = Uuid::new_v4();
        let requested_slug = request
            .slug
            .or_else(|| request.opts.get("slug").and_then(|s| s.as_str()).map(String::from));
        let slug = match requested_slug {
            Some(slug) => validate_slug(&slug)?,
            None => generate_slug(&job_id, Utc::now()),
        };

        let output_dir = self.profiles.get(kind).output_dir(&self.artifacts_root, &slug);

        // The buffer exists before the job is visible, so an early stream
        // attaches to it instead of the (empty) log file.
        self.logs
            .write()
            .await
            .insert(job_id, Arc::new(LogBuffer::new()));
        let created = self
            .store
            .create(NewJob {
                job_id,
                kind,
                input,
                slug,
                log_file: output_dir.join("job.log"),
                output_dir,
            })
            .await;
        let job = match created {
            Ok(job) => job,
            Err(err) => {
                self.logs.write().await.remove(&job_id);
                return Err(err);
            }
        };

        let queued = QueuedJob {
            job_id,
            opts: request.opts,
        };
        if self.send_to_queue.try_send(queued).is_err() {
            warn!(job_id = %job_id, "Launch queue closed, failing job");
            self.finish(&job_id, JobUpdate::failed("supervisor is shutting down"))
                .await;
            self.retire_log(&job_id).await;
        } else {
            info!(job_id = %job_id, kind = %kind, slug = %job.slug, "Job queued");
        }

        Ok(CreatedJob {
            job_id,
            slug: job.slug,
        })
    }

    pub async fn job_status(&self, id: &Uuid) -> Result<Job> {
        self.store.get(id).await.ok_or_else(|| Error::job_not_found(id))
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.store.list().await
    }

    /// Most recent `max_lines` log lines, oldest first.
    pub async fn tail_logs(&self, id: &Uuid, max_lines: usize) -> Result<Vec<LogEntry>> {
        let job = self.job_status(id).await?;
        if let Some(buffer) = self.log_buffer(id).await {
            return Ok(buffer.tail(max_lines));
        }
        Ok(read_log_tail(&job, max_lines).await)
    }

    /// Backlog plus live lines, then an [`LogEvent::End`] once the job has
    /// finished. Dropping the stream detaches it.
    pub async fn stream_logs(&self, id: &Uuid) -> Result<BoxStream<'static, LogEvent>> {
        let job = self.job_status(id).await?;
        let store = self.store.clone();
        let id = *id;

        let lines = match self.log_buffer(&id).await {
            Some(buffer) => buffer.subscribe().into_stream().boxed(),
            None => stream::iter(read_log_tail(&job, BACKLOG).await).boxed(),
        };
        let end = stream::once(async move {
            let status = store.get(&id).await.map_or(job.status, |job| job.status);
            LogEvent::End { status }
        });

        Ok(lines.map(LogEvent::Line).chain(end).boxed())
    }

    /// Ask a job's process to stop. The job still goes through normal exit
    /// handling; a job that has not started yet is failed when its turn
    /// comes.
    pub async fn kill_job(&self, id: &Uuid) -> Result<()> {
        let job = self.job_status(id).await?;
        let mut runs = self.runs.lock().await;
        if let Some(handle) = runs.active.get(id) {
            info!(job_id = %id, pid = ?handle.pid(), "Killing job");
            handle.kill();
        } else if job.status == Status::Queued {
            info!(job_id = %id, "Job killed before launch");
            runs.killed.insert(*id);
        }
        Ok(())
    }

    /// Stop the launchers, kill running processes and write pending state.
    /// Jobs left `queued` or `running` come back as `interrupted`.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.send_to_queue.close();
        let launchers = std::mem::take(&mut *self.launchers.lock().await);
        for launcher in futures::future::join_all(launchers).await {
            if let Err(err) = launcher {
                error!(error = ?err, "Launcher task failed");
            }
        }
        self.store.shutdown().await;
        info!("Job supervisor stopped.");
    }

    async fn log_buffer(&self, id: &Uuid) -> Option<Arc<LogBuffer>> {
        self.logs.read().await.get(id).cloned()
    }

    /// Forget a finished job's in-memory log. Attached streams keep their
    /// handle and still see the end.
    async fn retire_log(&self, id: &Uuid) {
        if let Some(buffer) = self.logs.write().await.remove(id) {
            buffer.close();
        }
    }

    #[cfg(test)]
    async fn has_live_log(&self, id: &Uuid) -> bool {
        self.logs.read().await.contains_key(id)
    }

    async fn finish(&self, id: &Uuid, update: JobUpdate) {
        match self.store.transition(id, update).await {
            Ok(job) => info!(job_id = %id, status = %job.status, error = ?job.error, "Job finished"),
            Err(err) => warn!(job_id = %id, error = %err, "Failed to record job outcome"),
        }
        if let Some(buffer) = self.log_buffer(id).await {
            buffer.close();
        }
    }

    #[instrument(skip_all, fields(job_id = %queued.job_id))]
    async fn run(&self, queued: QueuedJob, cancel_token: &CancellationToken) {
        let id = queued.job_id;
        let Some(job) = self.store.get(&id).await else {
            warn!("Queued job vanished from the store");
            return;
        };
        if self.runs.lock().await.killed.remove(&id) {
            self.finish(&id, JobUpdate::failed("killed before start")).await;
            self.retire_log(&id).await;
            return;
        }

        let logs = match self.log_buffer(&id).await {
            Some(logs) => logs,
            None => {
                let logs = Arc::new(LogBuffer::new());
                self.logs.write().await.insert(id, logs.clone());
                logs
            }
        };
        let mut sink = LogSink::open(&job.log_file, logs).await;

        let profile = self.profiles.get(job.kind).clone();
        let spec = profile.template.command(&job, &queued.opts);
        debug!(program = %spec.program, args = ?spec.args, "Launching");

        let (handle, mut events) = runner::start(&spec);
        if handle.spawned() {
            {
                let mut runs = self.runs.lock().await;
                runs.active.insert(id, handle.clone());
                // A kill that landed between the check above and the spawn.
                if runs.killed.remove(&id) {
                    handle.kill();
                }
            }
            if let Err(err) = self.store.transition(&id, JobUpdate::status(Status::Running)).await {
                warn!(error = %err, "Failed to mark job running");
            }
        }

        let mut progress = 0.0_f32;
        let mut phase = None;
        let mut meta_poll = tokio::time::interval(
            profile.meta.as_ref().map_or(Duration::from_secs(1), |meta| meta.interval),
        );
        meta_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = meta_poll.tick(), if profile.meta.is_some() => {
                    if let Some(meta) = &profile.meta {
                        self.observe_meta(&id, meta, &job.output_dir, &mut progress, &mut phase).await;
                    }
                    continue;
                },
                _ = cancel_token.cancelled() => {
                    debug!("Host shutting down, killing job process");
                    handle.kill();
                    break None;
                }
            };

            match event {
                Some(ProcessEvent::Stdout(line)) => {
                    self.observe(&id, &profile, &line, &mut progress).await;
                    sink.write(line).await;
                }
                Some(ProcessEvent::Stderr(line)) => {
                    self.observe(&id, &profile, &line, &mut progress).await;
                    sink.write(format!("[err] {line}")).await;
                }
                Some(ProcessEvent::SpawnError(err)) => {
                    sink.write(format!("[spawn] {err}")).await;
                    break Some(JobUpdate::failed(Error::Spawn(err).to_string()));
                }
                Some(ProcessEvent::Exited(code)) => {
                    sink.write(format!("[exit] code={code:?}")).await;
                    let snapshot = match &profile.meta {
                        Some(meta) => {
                            self.observe_meta(&id, meta, &job.output_dir, &mut progress, &mut phase)
                                .await
                        }
                        None => None,
                    };
                    let mut update = self.judge(&job, &profile, code).await;
                    // The tool's own account of a failure beats a bare exit code.
                    if update.status == Some(Status::Failed) {
                        if let Some(error) = snapshot.and_then(|s| s.error) {
                            update.error = Some(error);
                        }
                    }
                    break Some(update);
                }
                None => break Some(JobUpdate::failed("process runner stopped unexpectedly")),
            }
        };

        self.runs.lock().await.active.remove(&id);
        sink.flush().await;
        match outcome {
            Some(update) => {
                self.finish(&id, update).await;
                // Readers fall back to the log file from here on, unless
                // the file could not be written.
                if sink.persisted() {
                    self.retire_log(&id).await;
                }
            }
            None => sink.close(),
        }
    }

    /// Read the tool's status file and record any forward progress or a
    /// new phase.
    async fn observe_meta(
        &self,
        id: &Uuid,
        meta: &MetaProgress,
        dir: &Path,
        progress: &mut f32,
        phase: &mut Option<String>,
    ) -> Option<MetaSnapshot> {
        let snapshot = meta.read(dir).await?;
        let mut update = JobUpdate::default();
        if let Some(pct) = snapshot.progress.filter(|pct| *pct > *progress) {
            *progress = pct;
            update.progress = Some(pct);
        }
        if snapshot.phase.is_some() && snapshot.phase != *phase {
            phase.clone_from(&snapshot.phase);
            update.phase = snapshot.phase.clone();
        }
        if update != JobUpdate::default() {
            if let Err(err) = self.store.transition(id, update).await {
                debug!(error = %err, "Dropping meta update");
            }
        }
        Some(snapshot)
    }

    async fn observe(&self, id: &Uuid, profile: &JobProfile, line: &str, progress: &mut f32) {
        let Some(pct) = profile.progress.extract(line) else {
            return;
        };
        if pct <= *progress {
            return;
        }
        *progress = pct;
        if let Err(err) = self.store.transition(id, JobUpdate::progress(pct)).await {
            debug!(error = %err, "Dropping progress update");
        }
    }

    /// Exit code 0 is success, unless the kind requires an artifact and
    /// none shows up within the settle window.
    async fn judge(&self, job: &Job, profile: &JobProfile, code: Option<i32>) -> JobUpdate {
        if code != Some(0) {
            let detail = match code {
                Some(code) => format!("process exited with code {code}"),
                None => "process terminated by signal".to_string(),
            };
            return JobUpdate::failed(detail).with_exit_code(code);
        }

        let rule = &profile.artifact;
        match rule.settle(&job.output_dir, self.artifact_settle).await {
            Ok(Some(artifact)) => JobUpdate::status(Status::Done)
                .with_artifact(Some(artifact))
                .with_exit_code(code),
            Ok(None) if rule.required => {
                JobUpdate::failed(format!("no .{} output produced", rule.extension)).with_exit_code(code)
            }
            Ok(None) => JobUpdate::status(Status::Done).with_exit_code(code),
            Err(err) => {
                JobUpdate::failed(format!("artifact discovery failed: {err}")).with_exit_code(code)
            }
        }
    }
}

async fn launch(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<QueuedJob>,
    supervisor: Weak<JobSupervisor>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Launcher Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                match job {
                    Err(err) => {
                        debug!(message = "Launch queue closed, exiting", error = ?err);
                        break;
                    },
                    Ok(job) => {
                        let Some(supervisor) = supervisor.upgrade() else {
                            break;
                        };
                        supervisor.run(job, &cancel_token).await;
                    }
                }
            }
        }
    }
    info!("Launcher stopped.");
}

/// Where a running job's output goes: the in-memory buffer for live
/// readers, and the job's append-only log file.
struct LogSink {
    buffer: Arc<LogBuffer>,
    file: Option<File>,
}

impl LogSink {
    async fn open(path: &Path, buffer: Arc<LogBuffer>) -> Self {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|err| warn!(path = %path.display(), error = %err, "Cannot open job log file"))
            .ok();
        LogSink { buffer, file }
    }

    async fn write(&mut self, line: String) {
        let entry = self.buffer.append(line);
        if let Some(file) = self.file.as_mut() {
            let record = format!("[{}] {}\n", entry.timestamp.to_rfc3339(), entry.line);
            if let Err(err) = file.write_all(record.as_bytes()).await {
                warn!(error = %err, "Job log file write failed, keeping memory log only");
                self.file = None;
            }
        }
    }

    async fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush().await;
        }
    }

    /// Every line so far made it to the log file.
    fn persisted(&self) -> bool {
        self.file.is_some()
    }

    fn close(&self) {
        self.buffer.close();
    }
}

/// Last `max_lines` lines of a job's log file, for jobs with no live
/// buffer (recovered after a restart).
async fn read_log_tail(job: &Job, max_lines: usize) -> Vec<LogEntry> {
    let text = match tokio::fs::read_to_string(&job.log_file).await {
        Ok(text) => text,
        Err(err) => {
            debug!(job_id = %job.job_id, error = %err, "No log file to tail");
            return vec![];
        }
    };
    let fallback = job.ended.unwrap_or(job.started);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(max_lines);
    lines[skip..]
        .iter()
        .map(|line| parse_log_line(line, fallback))
        .collect()
}

fn parse_log_line(raw: &str, fallback: DateTime<Utc>) -> LogEntry {
    let parsed = raw
        .strip_prefix('[')
        .and_then(|rest| rest.split_once("] "))
        .and_then(|(ts, line)| {
            DateTime::parse_from_rfc3339(ts)
                .ok()
                .map(|ts| (ts.with_timezone(&Utc), line))
        });
    match parsed {
        Some((timestamp, line)) => LogEntry {
            timestamp,
            line: line.to_string(),
        },
        None => LogEntry {
            timestamp: fallback,
            line: raw.to_string(),
        },
    }
}

/// Caller-chosen slugs name a directory under the artifacts root and must
/// not be able to step outside it.
pub fn validate_slug(slug: &str) -> Result<String> {
    let ok = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug != "."
        && slug != ".."
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(slug.to_string())
    } else {
        Err(Error::InvalidInput(format!("invalid slug '{slug}'")))
    }
}

fn generate_slug(id: &Uuid, now: DateTime<Utc>) -> String {
    let millis = now.timestamp_millis().max(0) as u64;
    let suffix = &id.simple().to_string()[..6];
    format!("{}-{suffix}", to_base36(millis))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = vec![];
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
