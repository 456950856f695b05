//! Bounded in-memory log with live fan-out.
//!
//! Appends and subscriptions share one lock, so a subscriber sees the
//! backlog snapshot followed by every later line with no gap and no
//! duplicate at the boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Maximum number of entries retained per buffer.
pub const LOG_CAP: usize = 2000;
/// Entries replayed to a newly attached subscriber.
pub const BACKLOG: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl LogEntry {
    pub fn now(line: impl Into<String>) -> Self {
        LogEntry {
            timestamp: Utc::now(),
            line: line.into(),
        }
    }
}

pub struct LogBuffer {
    cap: usize,
    backlog: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<LogEntry>,
    subscribers: HashMap<u64, UnboundedSender<LogEntry>>,
    next_id: u64,
    closed: bool,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_limits(LOG_CAP, BACKLOG)
    }

    pub fn with_limits(cap: usize, backlog: usize) -> Self {
        LogBuffer {
            cap: cap.max(1),
            backlog,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a line and forward it to every current subscriber.
    ///
    /// Delivery never blocks: each subscriber has its own unbounded queue.
    /// A subscriber whose receiving side is gone is dropped here.
    pub fn append(&self, line: impl Into<String>) -> LogEntry {
        let entry = LogEntry::now(line);
        let mut inner = self.lock();
        inner.entries.push_back(entry.clone());
        while inner.entries.len() > self.cap {
            inner.entries.pop_front();
        }
        inner
            .subscribers
            .retain(|_, tx| tx.send(entry.clone()).is_ok());
        entry
    }

    /// Most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let inner = self.lock();
        let skip = inner.entries.len().saturating_sub(n);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Attach a subscriber. The returned [`Subscription`] carries the
    /// backlog snapshot and detaches itself when dropped.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let skip = inner.entries.len().saturating_sub(self.backlog);
        let backlog = inner.entries.iter().skip(skip).cloned().collect();
        let id = inner.next_id;
        inner.next_id += 1;
        // On a closed buffer the sender is dropped right away, so the
        // subscriber gets the backlog and then end of stream.
        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }
        Subscription {
            id,
            backlog,
            rx,
            buffer: Arc::downgrade(self),
        }
    }

    /// End every live subscription. Lines appended later are still kept
    /// for tails but no longer broadcast.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.remove(&id);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    id: u64,
    backlog: Vec<LogEntry>,
    rx: UnboundedReceiver<LogEntry>,
    buffer: Weak<LogBuffer>,
}

impl Subscription {
    pub fn backlog(&self) -> &[LogEntry] {
        &self.backlog
    }

    /// Next live entry; `None` once the buffer is closed.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Backlog followed by live entries, ending when the buffer closes.
    pub fn into_stream(mut self) -> impl Stream<Item = LogEntry> + Send + 'static {
        let backlog = std::mem::take(&mut self.backlog);
        stream::iter(backlog).chain(stream::unfold(self, |mut sub| async move {
            sub.rx.recv().await.map(|entry| (entry, sub))
        }))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn lines(entries: &[LogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.line.as_str()).collect()
    }

    #[test]
    fn never_exceeds_cap() {
        let buffer = LogBuffer::with_limits(5, 2);
        for i in 0..100 {
            buffer.append(format!("line {i}"));
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(lines(&buffer.tail(10)), ["line 95", "line 96", "line 97", "line 98", "line 99"]);
        assert_eq!(lines(&buffer.tail(2)), ["line 98", "line 99"]);
    }

    #[test]
    fn default_limits_hold_under_volume() {
        let buffer = Arc::new(LogBuffer::new());
        for i in 0..(LOG_CAP * 3) {
            buffer.append(i.to_string());
        }
        assert_eq!(buffer.len(), LOG_CAP);
        let sub = buffer.subscribe();
        assert_eq!(sub.backlog().len(), BACKLOG);
        assert_eq!(sub.backlog().last().unwrap().line, (LOG_CAP * 3 - 1).to_string());
    }

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_live_without_gap() {
        let buffer = Arc::new(LogBuffer::with_limits(100, 3));
        for i in 0..5 {
            buffer.append(format!("{i}"));
        }
        let mut sub = buffer.subscribe();
        assert_eq!(lines(sub.backlog()), ["2", "3", "4"]);

        buffer.append("5");
        buffer.append("6");
        assert_eq!(sub.recv().await.unwrap().line, "5");
        assert_eq!(sub.recv().await.unwrap().line, "6");
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let buffer = Arc::new(LogBuffer::new());
        let mut keep = buffer.subscribe();
        let gone = buffer.subscribe();
        assert_eq!(buffer.subscriber_count(), 2);

        drop(gone);
        assert_eq!(buffer.subscriber_count(), 1);

        buffer.append("still here");
        assert_eq!(keep.recv().await.unwrap().line, "still here");
    }

    #[tokio::test]
    async fn close_ends_stream_in_append_order() {
        let buffer = Arc::new(LogBuffer::new());
        buffer.append("a");
        let stream = buffer.subscribe().into_stream();
        buffer.append("b");
        buffer.append("c");
        buffer.close();
        buffer.append("d");

        let seen: Vec<String> = stream.map(|e| e.line).collect().await;
        assert_eq!(seen, ["a", "b", "c"]);
        assert_eq!(buffer.subscriber_count(), 0);

        let after: Vec<String> = buffer.subscribe().into_stream().map(|e| e.line).collect().await;
        assert_eq!(after, ["a", "b", "c", "d"]);
    }

    #[test]
    fn default_buffer_is_open_and_empty() {
        let buffer = LogBuffer::default();
        assert!(buffer.is_empty());
        assert!(!buffer.is_closed());
        buffer.close();
        assert!(buffer.is_closed());
    }
}
