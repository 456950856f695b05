//! Supervision of the single long-lived analysis worker.
//!
//! The worker keeps models resident between requests and speaks HTTP on a
//! fixed loopback port. It is started lazily, its output goes to one shared
//! [`LogBuffer`], and requests are relayed to it verbatim. Nothing here
//! retries: a wedged worker must not be hammered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::*;

use crate::config::ConfigContext;
use crate::logbuf::LogBuffer;
use crate::runner::{self, CommandSpec, ProcessEvent, ProcessHandle};
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READY_ATTEMPTS: u32 = 50;
const READY_INTERVAL: Duration = Duration::from_millis(200);

pub trait WorkerCommand: Send + Sync {
    fn command(&self, port: u16) -> CommandSpec;
}

/// `python -m <module> --port <port>`
pub struct PythonWorker {
    pub python: String,
    pub module: String,
}

impl WorkerCommand for PythonWorker {
    fn command(&self, port: u16) -> CommandSpec {
        CommandSpec::new(&self.python)
            .args(["-m", self.module.as_str(), "--port"])
            .arg(port.to_string())
            .env("PYTHONUNBUFFERED", "1")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerOptions {
    /// Fire a `/warmup` call once the worker is up, without waiting on it.
    #[serde(default)]
    pub warmup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub port: u16,
}

/// A worker reply, passed through untouched.
#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl WorkerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

pub struct WorkerSupervisor {
    port: u16,
    base_url: String,
    command: Arc<dyn WorkerCommand>,
    http: reqwest::Client,
    logs: Arc<LogBuffer>,
    process: Mutex<Option<ProcessHandle>>,
    /// Set once the current process has accepted a connection.
    ready: Arc<AtomicBool>,
}

impl WorkerSupervisor {
    pub fn new(config: &ConfigContext, command: Arc<dyn WorkerCommand>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(WorkerSupervisor {
            port: config.worker_port,
            base_url: config.worker_url(),
            command,
            http,
            logs: Arc::new(LogBuffer::new()),
            process: Mutex::new(None),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn from_config(config: &ConfigContext) -> Result<Self> {
        let command = PythonWorker {
            python: config.python.clone(),
            module: config.worker_module.clone(),
        };
        Self::new(config, Arc::new(command))
    }

    /// Shared log of the worker's stdout and stderr.
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub async fn status(&self) -> WorkerStatus {
        let process = self.process.lock().await;
        self.status_of(process.as_ref())
    }

    fn status_of(&self, handle: Option<&ProcessHandle>) -> WorkerStatus {
        let live = handle.filter(|h| h.is_running());
        WorkerStatus {
            running: live.is_some(),
            pid: live.and_then(|h| h.pid()),
            port: self.port,
        }
    }

    /// Start the worker unless it is already running. Concurrent callers
    /// are serialised, so at most one process is ever spawned.
    pub async fn ensure_started(&self, opts: WorkerOptions) -> Result<WorkerStatus> {
        let mut process = self.process.lock().await;
        if process.as_ref().is_some_and(|h| h.is_running()) {
            return Ok(self.status_of(process.as_ref()));
        }

        let spec = self.command.command(self.port);
        info!(program = %spec.program, port = self.port, "Starting worker");
        self.ready.store(false, Ordering::SeqCst);
        let (handle, mut events) = runner::start(&spec);
        if !handle.spawned() {
            let detail = match events.recv().await {
                Some(ProcessEvent::SpawnError(err)) => err,
                _ => "worker did not start".to_string(),
            };
            self.logs.append(format!("[worker] spawn failed: {detail}"));
            return Err(Error::Spawn(detail));
        }

        let logs = self.logs.clone();
        tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    match event {
                        ProcessEvent::Stdout(line) => {
                            logs.append(format!("[worker] {line}"));
                        }
                        ProcessEvent::Stderr(line) => {
                            logs.append(format!("[worker.err] {line}"));
                        }
                        ProcessEvent::Exited(code) => {
                            warn!(code = ?code, "Worker exited");
                            logs.append(format!("[worker] exited code={code:?}"));
                        }
                        ProcessEvent::SpawnError(err) => {
                            logs.append(format!("[worker] spawn failed: {err}"));
                        }
                    }
                }
            }
            .instrument(info_span!("worker_log", pid = ?handle.pid())),
        );

        if opts.warmup {
            tokio::spawn(warm_up(
                self.http.clone(),
                self.base_url.clone(),
                self.port,
                self.ready.clone(),
            ));
        }

        *process = Some(handle);
        Ok(self.status_of(process.as_ref()))
    }

    /// Start the worker if needed and give a fresh process a bounded window
    /// to open its port. A port that never opens is left for the request
    /// itself to report.
    async fn ensure_ready(&self) -> Result<()> {
        self.ensure_started(WorkerOptions::default()).await?;
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        for _ in 0..READY_ATTEMPTS {
            if port_open(self.port).await {
                self.ready.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if !self.status().await.running {
                break;
            }
            tokio::time::sleep(READY_INTERVAL).await;
        }
        warn!(port = self.port, "Worker port did not open");
        Ok(())
    }

    /// Request termination and forget the handle. Returns whether a
    /// running worker was asked to stop.
    pub async fn stop(&self) -> bool {
        match self.process.lock().await.take() {
            Some(handle) if handle.is_running() => {
                info!(pid = ?handle.pid(), "Stopping worker");
                handle.kill();
                self.ready.store(false, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Relay a request to the worker and return its reply as is, error
    /// statuses included. Only failing to reach the worker is an error.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<WorkerResponse> {
        if !path.starts_with('/') {
            return Err(Error::InvalidInput(format!("worker path must start with '/': {path}")));
        }
        self.ensure_ready().await?;

        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "Forwarding to worker");
        let mut request = self.http.request(method, url.as_str());
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        let response = request.send().await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await?.to_vec();
        Ok(WorkerResponse {
            status,
            content_type,
            body,
        })
    }

    pub async fn analyze(&self, payload: &serde_json::Value) -> Result<WorkerResponse> {
        self.forward(Method::POST, "/analyze", Some(payload)).await
    }

    pub async fn warmup(&self) -> Result<WorkerResponse> {
        self.forward(Method::POST, "/warmup", None).await
    }

    pub async fn jobs(&self) -> Result<WorkerResponse> {
        self.forward(Method::GET, "/jobs", None).await
    }

    pub async fn job_logs(&self, job_id: &str) -> Result<WorkerResponse> {
        let job_id = validate_job_id(job_id)?;
        self.forward(Method::GET, &format!("/jobs/{job_id}/logs"), None).await
    }

    /// Relay the worker's live log stream for one of its jobs. Dropping the
    /// returned stream closes the upstream connection.
    pub async fn proxy_stream(&self, job_id: &str) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let job_id = validate_job_id(job_id)?;
        self.ensure_ready().await?;

        let url = format!("{}/jobs/{job_id}/logs/stream", self.base_url);
        let response = self.http.get(url.as_str()).send().await?;
        if !response.status().is_success() {
            return Err(Error::Forward(format!(
                "worker answered {} for {url}",
                response.status()
            )));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from))
            .boxed())
    }
}

/// Worker job ids end up in a URL path.
fn validate_job_id(job_id: &str) -> Result<&str> {
    let ok = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(job_id)
    } else {
        Err(Error::InvalidInput(format!("invalid worker job id '{job_id}'")))
    }
}

async fn port_open(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

async fn warm_up(http: reqwest::Client, base_url: String, port: u16, ready: Arc<AtomicBool>) {
    for _ in 0..READY_ATTEMPTS {
        if port_open(port).await {
            ready.store(true, Ordering::SeqCst);
            break;
        }
        tokio::time::sleep(READY_INTERVAL).await;
    }
    match http.post(format!("{base_url}/warmup")).send().await {
        Ok(response) => info!(status = %response.status(), "Worker warm-up sent"),
        Err(err) => warn!(error = %err, "Worker warm-up failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_worker_command() {
        let spec = PythonWorker {
            python: "python3".into(),
            module: "analysis.worker".into(),
        }
        .command(8765);
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.args, ["-m", "analysis.worker", "--port", "8765"]);
    }

    #[test]
    fn worker_job_ids_are_path_safe() {
        assert!(validate_job_id("a1-b2_c3").is_ok());
        for bad in ["", "../x", "a/b", "a?b=1", "a b"] {
            assert!(validate_job_id(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn response_success_range() {
        let response = WorkerResponse {
            status: 404,
            content_type: None,
            body: b"{\"error\":\"no such job\"}".to_vec(),
        };
        assert!(!response.is_success());
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["error"], "no such job");
    }
}
