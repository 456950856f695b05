//! Wraps one external process invocation.
//!
//! [`start`] spawns the process and returns a [`ProcessHandle`] plus a
//! channel of [`ProcessEvent`]s. Output is delivered line by line as it
//! arrives. Exactly one terminal event (`Exited` or `SpawnError`) is sent,
//! always after the last output line, and nothing follows it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// How long to wait for the output pipes to drain once the process is gone.
/// A grandchild holding the pipe open must not stall the exit event forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// `None` when the process was terminated by a signal.
    Exited(Option<i32>),
    SpawnError(String),
}

impl ProcessEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessEvent::Exited(_) | ProcessEvent::SpawnError(_))
    }
}

/// Control side of a running process. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    spawned: bool,
    kill: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the OS accepted the process at all.
    pub fn spawned(&self) -> bool {
        self.spawned
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Request termination. Advisory and idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

pub fn start(spec: &CommandSpec) -> (ProcessHandle, UnboundedReceiver<ProcessEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let alive = Arc::new(AtomicBool::new(false));

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(program = %spec.program, error = %err, "Failed to spawn process");
            let _ = tx.send(ProcessEvent::SpawnError(err.to_string()));
            return (
                ProcessHandle {
                    pid: None,
                    spawned: false,
                    kill,
                    alive,
                },
                rx,
            );
        }
    };

    let pid = child.id();
    alive.store(true, Ordering::SeqCst);
    debug!(program = %spec.program, pid = ?pid, "Process started");

    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, tx.clone(), ProcessEvent::Stdout)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, tx.clone(), ProcessEvent::Stderr)));

    let handle = ProcessHandle {
        pid,
        spawned: true,
        kill: kill.clone(),
        alive: alive.clone(),
    };

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                debug!(pid = ?pid, "Kill requested");
                if let Err(err) = child.start_kill() {
                    warn!(pid = ?pid, error = %err, "Failed to kill process");
                }
                child.wait().await
            }
        };

        for mut pipe in [stdout, stderr].into_iter().flatten() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut pipe).await.is_err() {
                warn!(pid = ?pid, "Output pipe still open after exit, detaching");
                pipe.abort();
                let _ = pipe.await;
            }
        }

        alive.store(false, Ordering::SeqCst);
        let event = match status {
            Ok(status) => ProcessEvent::Exited(status.code()),
            Err(err) => {
                error!(pid = ?pid, error = %err, "Failed waiting on process");
                ProcessEvent::Exited(None)
            }
        };
        let _ = tx.send(event);
    });

    (handle, rx)
}

/// Forward one pipe to the event channel. Lines split on `\n` and on
/// carriage returns, since progress bars redraw in place with `\r`.
async fn pump<R, F>(reader: R, tx: UnboundedSender<ProcessEvent>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> ProcessEvent,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for line in text.split(['\n', '\r']).filter(|l| !l.is_empty()) {
                    if tx.send(wrap(line.to_string())).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "Output pipe read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: UnboundedReceiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut events = vec![];
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn streams_output_then_exit() {
        let (handle, rx) = start(&sh("echo one; echo two >&2; printf 'a\\rb\\n'; exit 3"));
        assert!(handle.pid().is_some());
        let events = collect(rx).await;

        assert_eq!(events.last(), Some(&ProcessEvent::Exited(Some(3))));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.contains(&ProcessEvent::Stdout("one".into())));
        assert!(events.contains(&ProcessEvent::Stderr("two".into())));
        assert!(events.contains(&ProcessEvent::Stdout("a".into())));
        assert!(events.contains(&ProcessEvent::Stdout("b".into())));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let (handle, rx) = start(&CommandSpec::new("/definitely/not/here"));
        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProcessEvent::SpawnError(_)));
        assert!(handle.pid().is_none());
        assert!(!handle.spawned());
        handle.kill();
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_ends_process() {
        let (handle, rx) = start(&sh("sleep 30"));
        assert!(handle.is_running());
        handle.kill();
        handle.kill();
        let events = collect(rx).await;
        assert_eq!(events, vec![ProcessEvent::Exited(None)]);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo $QUESO_TEST; pwd")
            .env("QUESO_TEST", "hello")
            .current_dir(dir.path());
        let (_, rx) = start(&spec);
        let events = collect(rx).await;
        assert_eq!(events[0], ProcessEvent::Stdout("hello".into()));
        let cwd = dir.path().canonicalize().unwrap();
        assert_eq!(
            events[1],
            ProcessEvent::Stdout(cwd.to_string_lossy().into_owned())
        );
    }
}
