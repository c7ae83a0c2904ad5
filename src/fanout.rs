//! Bounded single-producer, many-consumer line queue.
//!
//! A [`FanoutQueue`] is a singly linked list with a sentinel head. Appending
//! past the capacity unlinks the oldest element, but unlinked nodes stay
//! reachable from any [`Cursor`] that already holds them, so a slow reader
//! keeps seeing the history it has not yet consumed. Nodes are reclaimed
//! once the queue head and every cursor have moved past them.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

struct Node {
    /// `None` only on the sentinel.
    value: Option<Bytes>,
    next: Mutex<Option<Arc<Node>>>,
}

struct State {
    tail: Arc<Node>,
    len: usize,
    done: bool,
}

struct Inner {
    sentinel: Arc<Node>,
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

/// Bounded append-only queue fanning lines out to any number of cursors.
///
/// The queue is a cheaply clonable handle; clones and cursors share the
/// same elements.
#[derive(Clone)]
pub struct FanoutQueue {
    inner: Arc<Inner>,
}

impl FanoutQueue {
    /// Creates a queue holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        let sentinel = Arc::new(Node {
            value: None,
            next: Mutex::new(None),
        });
        Ok(FanoutQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tail: sentinel.clone(),
                    len: 0,
                    done: false,
                }),
                sentinel,
                notify: Notify::new(),
                capacity,
            }),
        })
    }

    /// Appends a line at the tail, evicting and returning the oldest line
    /// when the queue is at capacity. Wakes every parked [`Cursor`].
    pub fn append(&self, line: Bytes) -> Option<Bytes> {
        let inner = &*self.inner;
        let node = Arc::new(Node {
            value: Some(line),
            next: Mutex::new(None),
        });
        let evicted = {
            let mut state = inner.state.lock();
            *state.tail.next.lock() = Some(node.clone());
            state.tail = node;
            state.len += 1;
            if state.len > inner.capacity {
                // Unlink the oldest; cursors already past the sentinel
                // still reach it through their own node.
                let mut first = inner.sentinel.next.lock();
                match first.take() {
                    Some(oldest) => {
                        *first = oldest.next.lock().clone();
                        state.len -= 1;
                        oldest.value.clone()
                    }
                    None => None,
                }
            } else {
                None
            }
        };
        inner.notify.notify_waiters();
        evicted
    }

    /// Inserts a line in front of the current oldest element. Used to seed
    /// history before readers exist; fails with [`Error::QueueFull`] at
    /// capacity.
    pub fn append_head(&self, line: Bytes) -> Result<()> {
        let inner = &*self.inner;
        {
            let mut state = inner.state.lock();
            if state.len >= inner.capacity {
                return Err(Error::QueueFull);
            }
            let mut first = inner.sentinel.next.lock();
            let node = Arc::new(Node {
                value: Some(line),
                next: Mutex::new(first.clone()),
            });
            *first = Some(node.clone());
            if state.len == 0 {
                state.tail = node;
            }
            state.len += 1;
        }
        inner.notify.notify_waiters();
        Ok(())
    }

    /// Returns a cursor positioned before the oldest element.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            node: self.inner.sentinel.clone(),
            queue: self.clone(),
        }
    }

    /// Returns a cursor at the oldest element, or `None` if empty.
    pub fn head(&self) -> Option<Cursor> {
        let first = self.inner.sentinel.next.lock().clone()?;
        Some(Cursor {
            node: first,
            queue: self.clone(),
        })
    }

    /// Marks the queue terminal: every parked and future `wait_next`
    /// resolves to `None`. Idempotent.
    pub fn done(&self) {
        self.inner.state.lock().done = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl std::fmt::Debug for FanoutQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FanoutQueue")
            .field("len", &state.len)
            .field("capacity", &self.inner.capacity)
            .field("done", &state.done)
            .finish()
    }
}

/// A position within a [`FanoutQueue`], owned by one reader.
///
/// Cloning yields an independent cursor at the same position. A cursor never
/// regresses, and holding one keeps the queue (and any nodes evicted from
/// under it) alive.
#[derive(Clone)]
pub struct Cursor {
    queue: FanoutQueue,
    node: Arc<Node>,
}

impl Cursor {
    /// The line at the current position, or `None` on the pre-head position.
    pub fn get(&self) -> Option<Bytes> {
        self.node.value.clone()
    }

    /// Advances to the successor if one exists and returns its line.
    pub fn next(&mut self) -> Option<Bytes> {
        let next = self.node.next.lock().clone()?;
        let line = next.value.clone();
        self.node = next;
        line
    }

    /// Waits until a successor exists and returns its line, or returns
    /// `None` once the queue is done. Tolerates spurious wakeups.
    pub async fn wait_next(&mut self) -> Option<Bytes> {
        let queue = self.queue.clone();
        loop {
            let notified = queue.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so an append between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(line) = self.next() {
                return Some(line);
            }
            if queue.is_done() {
                return None;
            }
            notified.await;
        }
    }

    /// Moves back to the pre-head position; the next advance yields the
    /// oldest element still in the queue.
    pub fn rewind(&mut self) {
        self.node = self.queue.inner.sentinel.clone();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("at", &self.node.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn line(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(FanoutQueue::new(0), Err(Error::InvalidCapacity)));
        assert!(FanoutQueue::new(1).is_ok());
    }

    #[test]
    fn nonblocking_walk() {
        let q = FanoutQueue::new(4).unwrap();
        assert!(q.head().is_none());

        q.append(line("3"));
        let mut head = q.head().unwrap();
        assert_eq!(head.get(), Some(line("3")));
        assert_eq!(head.next(), None);

        q.append(line("4"));
        assert_eq!(head.next(), Some(line("4")));

        q.append_head(line("2")).unwrap();
        q.append_head(line("1")).unwrap();

        let mut cur = q.cursor();
        for expect in ["1", "2", "3", "4"] {
            assert_eq!(cur.next(), Some(line(expect)));
        }
        assert_eq!(cur.next(), None);

        assert!(matches!(q.append_head(line("0")), Err(Error::QueueFull)));

        // Appending past capacity returns the evicted head.
        assert_eq!(q.append(line("5")), Some(line("1")));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let q = FanoutQueue::new(3).unwrap();
        for i in 0..100 {
            q.append(line(&i.to_string()));
            assert!(q.len() <= 3);
        }
        let mut cur = q.cursor();
        for expect in ["97", "98", "99"] {
            assert_eq!(cur.next(), Some(line(expect)));
        }
    }

    #[test]
    fn slow_cursor_survives_eviction() {
        let q = FanoutQueue::new(2).unwrap();
        q.append(line("a"));
        let mut cur = q.cursor();
        assert_eq!(cur.next(), Some(line("a")));

        // "a" is evicted while the cursor still holds it.
        for s in ["b", "c", "d", "e"] {
            q.append(line(s));
        }
        for expect in ["b", "c", "d", "e"] {
            assert_eq!(cur.next(), Some(line(expect)));
        }

        // A cursor created now only sees what the queue retains.
        let mut late = q.cursor();
        assert_eq!(late.next(), Some(line("d")));
        assert_eq!(late.next(), Some(line("e")));
    }

    #[test]
    fn rewind_rereads_retained_history() {
        let q = FanoutQueue::new(4).unwrap();
        for s in ["1", "2", "3"] {
            q.append(line(s));
        }
        let mut cur = q.cursor();
        while cur.next().is_some() {}
        cur.rewind();
        assert_eq!(cur.next(), Some(line("1")));
    }

    #[tokio::test]
    async fn waiters_all_observe_one_append() {
        let q = FanoutQueue::new(4).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..32 {
            let mut cur = q.cursor();
            let tx = tx.clone();
            tokio::spawn(async move {
                tx.send(cur.wait_next().await).ok();
            });
        }

        sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "waiter returned before append");

        q.append(line("x"));
        for _ in 0..32 {
            let got = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("waiter did not wake")
                .unwrap();
            assert_eq!(got, Some(line("x")));
        }
    }

    #[tokio::test]
    async fn done_wakes_all_waiters() {
        let q = FanoutQueue::new(4).unwrap();
        q.append(line("only"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..32 {
            let mut cur = q.head().unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                tx.send(cur.wait_next().await).ok();
            });
        }

        sleep(Duration::from_millis(50)).await;
        q.done();
        for _ in 0..32 {
            let got = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("waiter did not wake on done")
                .unwrap();
            assert_eq!(got, None);
        }

        // Terminal state is sticky, but buffered lines stay readable.
        let mut cur = q.cursor();
        assert_eq!(cur.wait_next().await, Some(line("only")));
        assert_eq!(cur.wait_next().await, None);
    }

    #[tokio::test]
    async fn wait_next_returns_buffered_history_immediately() {
        let q = FanoutQueue::new(8).unwrap();
        for s in ["1", "2", "3"] {
            q.append(line(s));
        }
        let mut cur = q.cursor();
        for expect in ["1", "2", "3"] {
            let got = timeout(Duration::from_secs(1), cur.wait_next())
                .await
                .unwrap();
            assert_eq!(got, Some(line(expect)));
        }
    }
}
