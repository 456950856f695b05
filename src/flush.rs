//! Write-coalescing flush scheduler.
//!
//! One task owns all writes to a [`FlushTarget`], so two flushes never run
//! at the same time. [`FlushHandle::schedule`] arms a timer if none is
//! pending; further schedules inside the window ride along with it.
//! [`FlushHandle::flush_now`] writes immediately and cancels the timer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::*;

pub trait FlushTarget: Send + Sync + 'static {
    fn flush(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

#[derive(Debug)]
enum FlushRequest {
    Schedule,
    Now(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct FlushHandle {
    tx: mpsc::UnboundedSender<FlushRequest>,
}

impl FlushHandle {
    /// Request a write within the debounce window.
    pub fn schedule(&self) {
        if self.tx.send(FlushRequest::Schedule).is_err() {
            debug!("Flusher stopped, dropping scheduled write");
        }
    }

    /// Write now and wait for the write to finish.
    pub async fn flush_now(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(FlushRequest::Now(ack)).is_err() {
            debug!("Flusher stopped, dropping immediate write");
            return;
        }
        let _ = done.await;
    }

    /// Write anything pending and stop the flusher.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(FlushRequest::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

pub fn spawn(target: Arc<dyn FlushTarget>, delay: Duration) -> FlushHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(target, delay, rx).instrument(info_span!("flusher")));
    FlushHandle { tx }
}

async fn run(
    target: Arc<dyn FlushTarget>,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<FlushRequest>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let request = match deadline {
            Some(at) => tokio::select! {
                request = rx.recv() => request,
                _ = tokio::time::sleep_until(at) => {
                    deadline = None;
                    write(&*target).await;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match request {
            Some(FlushRequest::Schedule) => {
                if deadline.is_none() {
                    deadline = Some(Instant::now() + delay);
                }
            }
            Some(FlushRequest::Now(ack)) => {
                deadline = None;
                write(&*target).await;
                let _ = ack.send(());
            }
            Some(FlushRequest::Shutdown(ack)) => {
                if deadline.take().is_some() {
                    write(&*target).await;
                }
                let _ = ack.send(());
                break;
            }
            None => {
                if deadline.take().is_some() {
                    write(&*target).await;
                }
                break;
            }
        }
    }

    debug!("Flusher stopped.");
}

async fn write(target: &dyn FlushTarget) {
    if let Err(err) = target.flush().await {
        warn!(error = ?err, "Failed to persist state");
    }
}
