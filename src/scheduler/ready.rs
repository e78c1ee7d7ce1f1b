use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded FIFO of dispatchable task ids.
///
/// `push` suspends while the queue is full; this is how submission
/// backpressure propagates all the way to the input reader. `pop_batch`
/// suspends while the queue is empty unless it has been closed.
#[derive(Debug)]
pub struct ReadyQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    not_full: Notify,
    not_empty: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    ids: VecDeque<i64>,
    members: HashSet<i64>,
    closed: bool,
}

impl Inner {
    fn enqueue(&mut self, id: i64) -> bool {
        if self.members.insert(id) {
            self.ids.push_back(id);
            true
        } else {
            false
        }
    }
}

impl ReadyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ready queue poisoned").ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now; zero while full.
    pub fn room(&self) -> usize {
        self.capacity - self.len()
    }

    /// True while the id sits in the queue. Used to re-enqueue READY work
    /// that fell out (a requeue against a full queue, a session torn down
    /// mid-lease) without creating duplicates.
    pub fn contains(&self, id: i64) -> bool {
        self.inner
            .lock()
            .expect("ready queue poisoned")
            .members
            .contains(&id)
    }

    /// Enqueue one id, waiting for room. Returns false if the queue was
    /// closed before the id could be enqueued. An id already queued is
    /// left in place.
    pub async fn push(&self, id: i64) -> bool {
        loop {
            // Register for the wakeup before re-checking state so a
            // notify between the check and the await is not lost.
            let mut wait = std::pin::pin!(self.not_full.notified());
            wait.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("ready queue poisoned");
                if inner.closed {
                    return false;
                }
                if inner.members.contains(&id) {
                    return true;
                }
                if inner.ids.len() < self.capacity {
                    inner.enqueue(id);
                    self.not_empty.notify_waiters();
                    return true;
                }
            }
            wait.await;
        }
    }

    /// Enqueue without waiting. Returns false when full or closed.
    pub fn try_push(&self, id: i64) -> bool {
        let mut inner = self.inner.lock().expect("ready queue poisoned");
        if inner.closed || inner.ids.len() >= self.capacity {
            return false;
        }
        inner.enqueue(id);
        self.not_empty.notify_waiters();
        true
    }

    /// Dequeue between 1 and `max` ids, waiting for the first. Returns an
    /// empty vec only after close-and-drain.
    pub async fn pop_batch(&self, max: usize) -> Vec<i64> {
        let max = max.max(1);
        loop {
            let mut wait = std::pin::pin!(self.not_empty.notified());
            wait.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("ready queue poisoned");
                if !inner.ids.is_empty() {
                    let take = max.min(inner.ids.len());
                    let batch: Vec<i64> = inner.ids.drain(..take).collect();
                    for id in &batch {
                        inner.members.remove(id);
                    }
                    self.not_full.notify_waiters();
                    return batch;
                }
                if inner.closed {
                    return Vec::new();
                }
            }
            wait.await;
        }
    }

    /// Close the queue: pending and future `push` calls return false and
    /// `pop_batch` drains the remainder then returns empty.
    pub fn close(&self) {
        self.inner.lock().expect("ready queue poisoned").closed = true;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn push_pop_fifo() {
        let queue = ReadyQueue::new(10);
        for id in 1..=3 {
            assert!(queue.push(id).await);
        }
        assert_eq!(queue.pop_batch(2).await, vec![1, 2]);
        assert_eq!(queue.pop_batch(2).await, vec![3]);
    }

    #[tokio::test]
    async fn push_blocks_when_full() {
        let queue = Arc::new(ReadyQueue::new(2));
        assert!(queue.push(1).await);
        assert!(queue.push(2).await);

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(3).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "push should be suspended while full");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop_batch(1).await, vec![1]);
        assert!(blocked.await.unwrap());
        assert_eq!(queue.pop_batch(10).await, vec![2, 3]);
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let queue = Arc::new(ReadyQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_batch(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(waiter.await.unwrap().is_empty());
        assert!(!queue.push(1).await);
    }

    #[tokio::test]
    async fn close_drains_before_empty() {
        let queue = ReadyQueue::new(4);
        assert!(queue.push(7).await);
        queue.close();
        assert_eq!(queue.pop_batch(4).await, vec![7]);
        assert!(queue.pop_batch(4).await.is_empty());
    }
}
