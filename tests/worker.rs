use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::StreamExt;
use reqwest::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use queso_jobs::config::ConfigContext;
use queso_jobs::runner::CommandSpec;
use queso_jobs::worker::{WorkerCommand, WorkerOptions, WorkerSupervisor};
use queso_jobs::Error;

/// Stands in for the python worker; the HTTP side is served by the test.
struct Idle(&'static str);

impl WorkerCommand for Idle {
    fn command(&self, _port: u16) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(self.0)
    }
}

struct Absent;

impl WorkerCommand for Absent {
    fn command(&self, _port: u16) -> CommandSpec {
        CommandSpec::new("/nonexistent/queso-worker")
    }
}

fn config(port: u16) -> ConfigContext {
    ConfigContext {
        worker_port: port,
        ..ConfigContext::defaults()
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal HTTP/1.1 responder. Each request line is reported on the
/// returned channel together with its body.
async fn fake_worker() -> (u16, mpsc::UnboundedReceiver<(String, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(serve(listener, tx));
    (port, rx)
}

/// Like [`fake_worker`], but the port only opens after `delay`, the way a
/// freshly spawned worker loads before listening.
async fn slow_fake_worker(delay: Duration) -> (u16, mpsc::UnboundedReceiver<(String, String)>) {
    let port = free_port().await;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        serve(listener, tx).await;
    });
    (port, rx)
}

async fn serve(listener: TcpListener, seen: mpsc::UnboundedSender<(String, String)>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(respond(stream, seen.clone()));
    }
}

/// Sends log events until the client goes away, then reports the
/// disconnect as `(request line, "closed")`.
async fn stream_forever(
    mut stream: TcpStream,
    request_line: String,
    seen: mpsc::UnboundedSender<(String, String)>,
) {
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
    if stream.write_all(head.as_bytes()).await.is_ok() {
        loop {
            if stream.write_all(b"data: tick\n\n").await.is_err() {
                break;
            }
            if stream.flush().await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    let _ = seen.send((request_line, "closed".into()));
}

async fn respond(mut stream: TcpStream, seen: mpsc::UnboundedSender<(String, String)>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while raw.len() < header_end + length {
        let n = stream.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
    }
    let body = String::from_utf8_lossy(&raw[header_end..]).to_string();
    let request_line = head.lines().next().unwrap_or_default().to_string();

    if request_line.starts_with("GET /jobs/forever/logs/stream ") {
        stream_forever(stream, request_line, seen).await;
        return;
    }

    let (status, content_type, reply) = if request_line.starts_with("POST /analyze ") {
        ("202 Accepted", "application/json", r#"{"jobId":"w-1"}"#)
    } else if request_line.starts_with("POST /warmup ") {
        ("200 OK", "application/json", r#"{"ok":true}"#)
    } else if request_line.starts_with("GET /jobs ") {
        ("200 OK", "application/json", r#"{"jobs":[]}"#)
    } else if request_line.starts_with("GET /jobs/missing/logs ") {
        ("404 Not Found", "application/json", r#"{"error":"no such job"}"#)
    } else if request_line.starts_with("GET /jobs/w-1/logs/stream ") {
        ("200 OK", "text/event-stream", "data: one\n\ndata: two\n\n")
    } else {
        ("500 Internal Server Error", "text/plain", "unexpected")
    };
    let _ = seen.send((request_line, body));

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
        reply.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[tokio::test]
async fn concurrent_starts_share_one_process() {
    let worker = Arc::new(
        WorkerSupervisor::new(&config(free_port().await), Arc::new(Idle("exec sleep 30"))).unwrap(),
    );

    let (a, b) = tokio::join!(
        worker.ensure_started(WorkerOptions::default()),
        worker.ensure_started(WorkerOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.running);
    assert!(a.pid.is_some());
    assert_eq!(a.pid, b.pid);

    let again = worker.ensure_started(WorkerOptions::default()).await.unwrap();
    assert_eq!(again.pid, a.pid);

    assert!(worker.stop().await);
    let status = worker.status().await;
    assert!(!status.running);
    assert_eq!(status.pid, None);
    assert!(!worker.stop().await);
}

#[tokio::test]
async fn worker_output_lands_in_shared_log() {
    let worker = WorkerSupervisor::new(
        &config(free_port().await),
        Arc::new(Idle("echo ready; echo oops >&2; exec sleep 30")),
    )
    .unwrap();
    worker.ensure_started(WorkerOptions::default()).await.unwrap();

    let mut lines = Vec::new();
    for _ in 0..100 {
        lines = worker.logs().tail(10).into_iter().map(|e| e.line).collect();
        if lines.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(lines.contains(&"[worker] ready".to_string()), "{lines:?}");
    assert!(lines.contains(&"[worker.err] oops".to_string()), "{lines:?}");
    worker.stop().await;
}

#[tokio::test]
async fn spawn_failure_is_reported() {
    let worker = WorkerSupervisor::new(&config(free_port().await), Arc::new(Absent)).unwrap();

    let err = worker.ensure_started(WorkerOptions::default()).await.unwrap_err();
    assert_matches!(err, Error::Spawn(_));
    assert!(!worker.status().await.running);
}

#[tokio::test]
async fn forward_returns_worker_reply_verbatim() {
    let (port, mut seen) = fake_worker().await;
    let worker = WorkerSupervisor::new(&config(port), Arc::new(Idle("exec sleep 30"))).unwrap();

    let payload = serde_json::json!({ "input": "song.wav" });
    let response = worker.analyze(&payload).await.unwrap();
    assert_eq!(response.status, 202);
    assert_eq!(response.content_type.as_deref(), Some("application/json"));
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["jobId"], "w-1");

    let (request_line, sent) = seen.recv().await.unwrap();
    assert!(request_line.starts_with("POST /analyze "));
    assert_eq!(serde_json::from_str::<serde_json::Value>(&sent).unwrap(), payload);

    // Error statuses are the worker's answer, not a forwarding failure.
    let missing = worker.job_logs("missing").await.unwrap();
    assert_eq!(missing.status, 404);
    assert!(!missing.is_success());

    let warm = worker.warmup().await.unwrap();
    assert!(warm.is_success());

    assert!(worker.status().await.running);
    worker.stop().await;
}

#[tokio::test]
async fn forward_rejects_relative_paths() {
    let worker = WorkerSupervisor::new(&config(free_port().await), Arc::new(Absent)).unwrap();
    assert_matches!(
        worker.forward(Method::GET, "jobs", None).await,
        Err(Error::InvalidInput(_))
    );
    assert_matches!(worker.job_logs("../etc").await, Err(Error::InvalidInput(_)));
}

#[tokio::test]
async fn unreachable_worker_is_forward_error() {
    // Exits without ever listening.
    let worker =
        WorkerSupervisor::new(&config(free_port().await), Arc::new(Idle("exit 0"))).unwrap();

    let result = worker.forward(Method::GET, "/jobs", None).await;
    assert_matches!(result, Err(Error::Forward(_)));
    worker.stop().await;
}

#[tokio::test]
async fn proxy_stream_relays_bytes() {
    let (port, _seen) = fake_worker().await;
    let worker = WorkerSupervisor::new(&config(port), Arc::new(Idle("exec sleep 30"))).unwrap();

    let chunks: Vec<Vec<u8>> = worker
        .proxy_stream("w-1")
        .await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.concat(), b"data: one\n\ndata: two\n\n");

    assert_matches!(worker.proxy_stream("missing").await.err(), Some(Error::Forward(_)));
    worker.stop().await;
}

#[tokio::test]
async fn first_forward_waits_for_fresh_worker() {
    let (port, mut seen) = slow_fake_worker(Duration::from_millis(300)).await;
    let worker = WorkerSupervisor::new(&config(port), Arc::new(Idle("exec sleep 30"))).unwrap();

    let response = worker.jobs().await.unwrap();
    assert_eq!(response.status, 200);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["jobs"], serde_json::json!([]));

    let (request_line, _) = seen.recv().await.unwrap();
    assert!(request_line.starts_with("GET /jobs "));
    worker.stop().await;
}

#[tokio::test]
async fn detached_stream_closes_upstream() {
    let (port, mut seen) = fake_worker().await;
    let worker = WorkerSupervisor::new(&config(port), Arc::new(Idle("exec sleep 30"))).unwrap();

    for _ in 0..3 {
        let mut stream = worker.proxy_stream("forever").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(stream);

        let (request_line, event) = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("upstream connection left open")
            .unwrap();
        assert!(request_line.starts_with("GET /jobs/forever/logs/stream "));
        assert_eq!(event, "closed");
    }
    worker.stop().await;
}
