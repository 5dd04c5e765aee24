//! Bounded event channel that never blocks producers: when full, the oldest entry is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use metrics::counter;
use tokio::sync::Notify;
use tracing::debug;

struct Inner<T> {
    buf: VecDeque<T>,
    cap: usize,
    dropped: u64,
    senders: usize,
    receiver_alive: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
}

/// Create a ring channel holding at most `cap` undelivered items (minimum 1).
pub fn ring_channel<T>(cap: usize) -> (RingSender<T>, RingReceiver<T>) {
    let cap = cap.max(1);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner { buf: VecDeque::with_capacity(cap), cap, dropped: 0, senders: 1, receiver_alive: true }),
        notify: Notify::new(),
    });
    (RingSender { shared: Arc::clone(&shared) }, RingReceiver { shared })
}

pub struct RingSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RingSender<T> {
    /// Enqueue `item`, evicting the oldest pending item if the ring is full.
    /// Returns `false` when the receiver is gone and the item was discarded.
    pub fn send(&self, item: T) -> bool {
        {
            let mut g = self.shared.lock();
            if !g.receiver_alive { return false; }
            if g.buf.len() >= g.cap && g.buf.pop_front().is_some() {
                g.dropped += 1;
                counter!("ring_dropped_total", 1u64);
                debug!(dropped = g.dropped, "ring full; dropped oldest event");
            }
            g.buf.push_back(item);
        }
        self.shared.notify.notify_one();
        true
    }

    pub fn dropped(&self) -> u64 { self.shared.lock().dropped }
}

impl<T> Clone for RingSender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> Drop for RingSender<T> {
    fn drop(&mut self) {
        let last = {
            let mut g = self.shared.lock();
            g.senders -= 1;
            g.senders == 0
        };
        if last { self.shared.notify.notify_one(); }
    }
}

pub struct RingReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RingReceiver<T> {
    /// Wait for the next item; `None` once every sender is dropped and the ring is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut g = self.shared.lock();
                if let Some(v) = g.buf.pop_front() { return Some(v); }
                if g.senders == 0 { return None; }
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> { self.shared.lock().buf.pop_front() }

    pub fn len(&self) -> usize { self.shared.lock().buf.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn dropped(&self) -> u64 { self.shared.lock().dropped }
}

impl<T> Drop for RingReceiver<T> {
    fn drop(&mut self) {
        let mut g = self.shared.lock();
        g.receiver_alive = false;
        g.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let (tx, mut rx) = ring_channel(3);
        for i in 0..5 { assert!(tx.send(i)); }
        assert_eq!(rx.dropped(), 2);
        let got: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(got, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn recv_ends_after_last_sender_drops() {
        let (tx, mut rx) = ring_channel(4);
        let tx2 = tx.clone();
        tx.send("a");
        drop(tx);
        tx2.send("b");
        drop(tx2);
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, Some("b"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn recv_wakes_on_send() {
        let (tx, mut rx) = ring_channel::<u32>(2);
        let h = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.send(7);
        assert_eq!(h.await.unwrap(), Some(7));
    }

    #[test]
    fn send_fails_without_receiver() {
        let (tx, rx) = ring_channel::<u8>(1);
        drop(rx);
        assert!(!tx.send(1));
    }
}
