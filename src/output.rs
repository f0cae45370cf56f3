//! The manager's output channel.
//!
//! A bounded queue that refuses to block the producer: when full it doubles
//! its capacity instead, up to a hard ceiling, past which the oldest unread
//! result is dropped and counted. Results are never reordered.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::leech::IndexingResult;

/// Growth stops here; a consumer this far behind is not coming back.
pub const HARD_CAP: usize = 1 << 16;

#[derive(Debug)]
pub struct ResultChannel {
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<IndexingResult>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

impl ResultChannel {
    pub fn new(capacity: usize) -> Self {
        ResultChannel {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues a result without ever suspending the caller. Returns false
    /// once the channel is closed.
    pub fn push(&self, result: IndexingResult) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            if inner.queue.len() >= inner.capacity {
                if inner.capacity < HARD_CAP {
                    let grown = (inner.capacity * 2).min(HARD_CAP);
                    tracing::debug!(from = inner.capacity, to = grown, "output channel grew");
                    inner.capacity = grown;
                } else {
                    inner.queue.pop_front();
                    inner.dropped += 1;
                }
            }
            inner.queue.push_back(result);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeues the next result, suspending while the queue is empty.
    /// `None` means closed and fully drained.
    pub async fn recv(&self) -> Option<IndexingResult> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(result) = inner.queue.pop_front() {
                    return Some(result);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-suspending variant for drains and tests.
    pub fn try_recv(&self) -> Option<IndexingResult> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        // A receiver parked between its queue check and `notified().await`
        // holds a stored permit from notify_one; wake that one too.
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}
