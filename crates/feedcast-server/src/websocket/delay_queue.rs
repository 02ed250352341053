//! FIFO of outbound frames tagged with the delay to wait before writing.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A serialized frame and the delay captured when it was enqueued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledMessage {
    /// Encoded frame bytes.
    pub data: Bytes,
    /// Sleep before writing this frame.
    pub delay: Duration,
}

/// Unbounded queue with a coalescing "work pending" signal.
///
/// Any number of pushes between two waits collapse into a single wakeup. A
/// push that happens while nobody waits is remembered, so the consumer never
/// misses work.
#[derive(Debug, Default)]
pub struct DelayQueue {
    items: Mutex<VecDeque<ScheduledMessage>>,
    pending: Notify,
}

impl DelayQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and signal. Returns the queue length after the push.
    pub fn push_back(&self, item: ScheduledMessage) -> usize {
        let len = {
            let mut items = self.items.lock();
            items.push_back(item);
            items.len()
        };
        self.pending.notify_one();
        len
    }

    /// Remove the oldest item.
    pub fn pop_front(&self) -> Option<ScheduledMessage> {
        self.items.lock().pop_front()
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Wait until at least one push happened since the previous wait.
    pub async fn pending(&self) {
        self.pending.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;

    fn msg(n: u32) -> ScheduledMessage {
        ScheduledMessage {
            data: Bytes::from(n.to_string()),
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn fifo_order() {
        let queue = DelayQueue::new();
        assert_eq!(queue.push_back(msg(1)), 1);
        assert_eq!(queue.push_back(msg(2)), 2);
        assert_eq!(queue.pop_front(), Some(msg(1)));
        assert_eq!(queue.pop_front(), Some(msg(2)));
        assert!(queue.pop_front().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn pushes_coalesce_into_one_signal() {
        let queue = DelayQueue::new();
        for n in 0..5 {
            let _ = queue.push_back(msg(n));
        }
        assert!(queue.pending().now_or_never().is_some());
        assert!(queue.pending().now_or_never().is_none());
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn no_signal_without_push() {
        let queue = DelayQueue::new();
        assert!(queue.pending().now_or_never().is_none());
    }

    #[tokio::test]
    async fn waiter_woken_by_push() {
        let queue = Arc::new(DelayQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.pending().await;
                queue.pop_front()
            })
        };
        tokio::task::yield_now().await;
        let _ = queue.push_back(msg(7));
        assert_eq!(waiter.await.unwrap(), Some(msg(7)));
    }

    #[tokio::test]
    async fn concurrent_producers_keep_per_producer_order() {
        let queue = Arc::new(DelayQueue::new());
        let mut handles = Vec::new();
        for p in 0..4u32 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                for i in 0..100u32 {
                    let _ = queue.push_back(msg(p * 1000 + i));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut last = [None::<u32>; 4];
        let mut total = 0;
        while let Some(item) = queue.pop_front() {
            let n: u32 = std::str::from_utf8(&item.data).unwrap().parse().unwrap();
            let (p, i) = ((n / 1000) as usize, n % 1000);
            if let Some(prev) = last[p] {
                assert!(i > prev);
            }
            last[p] = Some(i);
            total += 1;
        }
        assert_eq!(total, 400);
    }
}
