//! BFE work queue: deduplicating, rate limited, one sync at a time

#![forbid(unsafe_code)]

pub mod backoff;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bfe_core::ObjectKey;
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;

/// Offset given to non-skippable tasks so no successful sync can ever supersede them.
pub const NON_SKIPPABLE_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("could not derive a queue key: object has no name")]
    MissingKey,
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub key: String,
    /// Logical enqueue time, compared against the last successful sync.
    pub timestamp: Instant,
    pub skippable: bool,
}

impl Task {
    pub fn new(key: impl Into<String>, timestamp: Instant, skippable: bool) -> Self {
        Self { key: key.into(), timestamp, skippable }
    }

    fn merge(&mut self, other: Task) {
        self.timestamp = self.timestamp.max(other.timestamp);
        self.skippable = self.skippable && other.skippable;
    }
}

/// The action run for each dequeued key. Must tolerate being called repeatedly for unchanged state.
#[async_trait::async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, key: &str) -> anyhow::Result<()>;
}

pub type KeyFn = Arc<dyn Fn(&dyn ObjectKey) -> Result<String, QueueError> + Send + Sync>;

fn default_key(obj: &dyn ObjectKey) -> Result<String, QueueError> { obj.object_key().ok_or(QueueError::MissingKey) }

struct Delayed {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for Delayed {
    // min-heap on (at, seq)
    fn cmp(&self, other: &Self) -> Ordering { other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq)) }
}

#[derive(Default)]
struct State {
    order: VecDeque<String>,
    pending: FxHashMap<String, Task>,
    delayed: BinaryHeap<Delayed>,
    seq: u64,
    backoff: ExponentialBackoff,
    last_sync: Option<Instant>,
}

impl State {
    fn add(&mut self, task: Task) {
        match self.pending.get_mut(&task.key) {
            Some(existing) => existing.merge(task),
            None => {
                self.order.push_back(task.key.clone());
                self.pending.insert(task.key.clone(), task);
            }
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.at <= now) {
            if let Some(d) = self.delayed.pop() { self.add(d.task); }
        }
    }

    fn pop(&mut self) -> Option<Task> {
        while let Some(key) = self.order.pop_front() {
            if let Some(task) = self.pending.remove(&key) { return Some(task); }
        }
        None
    }
}

/// Strictly serialized task queue.
///
/// Tasks are deduplicated by key. A task whose timestamp is older than the last successful sync is
/// dropped on dequeue; failed syncs are retried after a per-key exponential delay.
pub struct TaskQueue {
    state: Mutex<State>,
    notify: Notify,
    handler: Arc<dyn SyncHandler>,
    key_fn: KeyFn,
    shutting_down: AtomicBool,
    worker_idle: watch::Sender<bool>,
}

impl TaskQueue {
    pub fn new(handler: Arc<dyn SyncHandler>) -> Self { Self::with_backoff(handler, ExponentialBackoff::default()) }

    pub fn with_backoff(handler: Arc<dyn SyncHandler>, backoff: ExponentialBackoff) -> Self {
        let (worker_idle, _) = watch::channel(true);
        Self {
            state: Mutex::new(State { backoff, ..State::default() }),
            notify: Notify::new(),
            handler,
            key_fn: Arc::new(default_key),
            shutting_down: AtomicBool::new(false),
            worker_idle,
        }
    }

    /// Replace how object identities become queue keys.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Enqueue work that must never be skipped.
    pub fn enqueue_task(&self, obj: &dyn ObjectKey) { self.enqueue(obj, false) }

    /// Enqueue work that a later successful sync may supersede.
    pub fn enqueue_skippable_task(&self, obj: &dyn ObjectKey) { self.enqueue(obj, true) }

    fn enqueue(&self, obj: &dyn ObjectKey, skippable: bool) {
        let key = match (self.key_fn)(obj) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "dropping task");
                return;
            }
        };
        let now = Instant::now();
        let timestamp = if skippable { now } else { now + NON_SKIPPABLE_HORIZON };
        self.push(Task { key, timestamp, skippable });
    }

    /// Add a task with an explicit timestamp.
    pub fn push(&self, task: Task) {
        if self.is_shutting_down() {
            warn!(key = %task.key, "queue has been shut down; ignoring task");
            return;
        }
        debug!(key = %task.key, skippable = task.skippable, "queuing task");
        let depth = {
            let mut st = self.lock();
            st.add(task);
            st.pending.len()
        };
        gauge!("queue_depth", depth as f64);
        self.notify.notify_one();
    }

    fn add_rate_limited(&self, task: Task) {
        if self.is_shutting_down() { return; }
        let delay = {
            let mut st = self.lock();
            let delay = st.backoff.when(&task.key);
            st.seq += 1;
            let seq = st.seq;
            st.delayed.push(Delayed { at: Instant::now() + delay, seq, task });
            delay
        };
        debug!(delay_ms = delay.as_millis() as u64, "requeued with backoff");
        self.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool { self.shutting_down.load(AtomicOrdering::SeqCst) }

    /// Tasks waiting to run, including those waiting out a retry delay.
    pub fn len(&self) -> usize {
        let st = self.lock();
        st.pending.len() + st.delayed.len()
    }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Time the most recent successful sync was dequeued.
    pub fn last_sync(&self) -> Option<Instant> { self.lock().last_sync }

    pub fn retries(&self, key: &str) -> u32 { self.lock().backoff.retries(key) }

    /// Drive the worker until shutdown or cancellation. Should the worker ever return early it is
    /// restarted after `period`.
    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        self.worker_idle.send_replace(false);
        info!("starting task queue worker");
        loop {
            self.worker(&cancel).await;
            if self.is_shutting_down() || cancel.is_cancelled() { break; }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        info!("task queue worker stopped");
        self.worker_idle.send_replace(true);
    }

    /// Stop accepting work and wait for the in-flight sync (if any) and the worker to finish.
    /// Tasks still pending are discarded.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, AtomicOrdering::SeqCst) { return self.wait_idle().await; }
        info!("shutting down task queue");
        self.notify.notify_one();
        self.wait_idle().await;
        let mut st = self.lock();
        let dropped = st.pending.len() + st.delayed.len();
        st.order.clear();
        st.pending.clear();
        st.delayed.clear();
        if dropped > 0 { debug!(dropped, "discarded pending tasks on shutdown"); }
    }

    async fn wait_idle(&self) {
        let mut rx = self.worker_idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    async fn worker(&self, cancel: &CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                t = self.next_task() => t,
            };
            let Some(task) = next else { return };
            self.process(task).await;
        }
    }

    async fn next_task(&self) -> Option<Task> {
        loop {
            let wake_at = {
                let mut st = self.lock();
                if self.is_shutting_down() { return None; }
                st.promote_due(Instant::now());
                if let Some(task) = st.pop() { return Some(task); }
                st.delayed.peek().map(|d| d.at)
            };
            match wake_at {
                Some(at) => tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                },
                None => self.notify.notified().await,
            }
        }
    }

    async fn process(&self, task: Task) {
        let dequeued = Instant::now();
        if let Some(last) = self.last_sync() {
            if last > task.timestamp {
                debug!(key = %task.key, "skipping task superseded by a newer sync");
                counter!("queue_skipped_total", 1u64);
                return;
            }
        }
        debug!(key = %task.key, "syncing");
        match self.handler.sync(&task.key).await {
            Ok(()) => {
                {
                    let mut st = self.lock();
                    st.backoff.forget(&task.key);
                    st.last_sync = Some(dequeued);
                }
                counter!("queue_syncs_total", 1u64, "result" => "ok");
                histogram!("queue_sync_duration_seconds", dequeued.elapsed().as_secs_f64());
            }
            Err(e) => {
                warn!(key = %task.key, error = %e, "requeuing task");
                counter!("queue_syncs_total", 1u64, "result" => "error");
                self.add_rate_limited(Task { key: task.key, timestamp: Instant::now(), skippable: false });
            }
        }
    }
}
