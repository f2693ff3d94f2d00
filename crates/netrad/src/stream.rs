//! Bounded latest-frame-wins handoff between the session thread and
//! stream readers.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Frames held before the oldest is dropped.
pub const FRAME_BUFFER_CAPACITY: usize = 2;

/// Outcome of waiting for the next encoded frame.
#[derive(Debug, PartialEq)]
pub enum Next {
    Frame(Bytes),
    /// No frame within the wait; the caller should re-check and retry.
    Timeout,
    /// The session has stopped and no frames remain.
    Closed,
}

pub struct FrameBuffer {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    closed: AtomicBool,
    notify: Notify,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_capacity(FRAME_BUFFER_CAPACITY)
    }
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue an encoded frame, evicting the oldest when full. Never blocks.
    ///
    /// Returns `false` once the buffer is closed.
    pub fn push(&self, jpeg: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            while queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(jpeg);
        }
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<Bytes> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the buffer closed and wake every waiting reader.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Wait up to `timeout` for the next frame.
    pub async fn next(&self, timeout: Duration) -> Next {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push or close between the check
            // and the await is not missed.
            notified.as_mut().enable();

            if let Some(frame) = self.pop() {
                return Next::Frame(frame);
            }
            if self.is_closed() {
                return Next::Closed;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Next::Timeout;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn jpeg(tag: u8) -> Bytes {
        Bytes::from(vec![tag])
    }

    #[tokio::test]
    async fn test_latest_frames_win() {
        let buffer = FrameBuffer::default();
        for tag in 1..=5 {
            assert!(buffer.push(jpeg(tag)));
        }
        assert_eq!(buffer.len(), FRAME_BUFFER_CAPACITY);
        let wait = Duration::from_millis(10);
        assert_eq!(buffer.next(wait).await, Next::Frame(jpeg(4)));
        assert_eq!(buffer.next(wait).await, Next::Frame(jpeg(5)));
        assert_eq!(buffer.next(wait).await, Next::Timeout);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_reader() {
        let buffer = Arc::new(FrameBuffer::default());
        let reader = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.next(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        let outcome = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader not woken")
            .unwrap();
        assert_eq!(outcome, Next::Closed);
        assert!(!buffer.push(jpeg(1)));
    }

    #[tokio::test]
    async fn test_push_wakes_waiting_reader() {
        let buffer = Arc::new(FrameBuffer::default());
        let reader = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.next(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(jpeg(9));
        let outcome = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader not woken")
            .unwrap();
        assert_eq!(outcome, Next::Frame(jpeg(9)));
    }

    #[tokio::test]
    async fn test_drains_remaining_frames_after_close() {
        let buffer = FrameBuffer::default();
        buffer.push(jpeg(1));
        buffer.close();
        let wait = Duration::from_millis(10);
        assert_eq!(buffer.next(wait).await, Next::Frame(jpeg(1)));
        assert_eq!(buffer.next(wait).await, Next::Closed);
    }
}
