use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use strata_model::EventSource;
use tokio::sync::Notify;

use super::SourceQueue;
use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<EventSource>,
    closed: bool,
}

/// Capacity-bounded queue shared between the walk and the foreman.
///
/// The lock is never held across an await point; waiting happens on the two
/// [`Notify`] handles instead.
pub struct BoundedSourceQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
}

impl fmt::Debug for BoundedSourceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedSourceQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl BoundedSourceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<EventSource> {
        let popped = self.lock().items.pop_front();
        if popped.is_some() {
            self.not_full.notify_one();
        }
        popped
    }
}

#[async_trait]
impl SourceQueue for BoundedSourceQueue {
    async fn enqueue(&self, source: EventSource) -> Result<()> {
        let mut source = Some(source);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(CoreError::QueueClosed);
                }
                if state.items.len() < self.capacity
                    && let Some(source) = source.take()
                {
                    state.items.push_back(source);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    async fn dequeue(&self) -> Option<EventSource> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(source) = self.pop() {
                return Some(source);
            }
            if self.lock().closed {
                return None;
            }

            notified.await;
        }
    }

    fn try_dequeue(&self) -> Option<EventSource> {
        self.pop()
    }

    fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::queue::contract::{exercise, source};

    #[tokio::test]
    async fn satisfies_queue_contract() {
        exercise(BoundedSourceQueue::new(8)).await;
    }

    #[tokio::test]
    async fn producer_blocks_until_consumer_frees_capacity() {
        let queue = Arc::new(BoundedSourceQueue::new(1));
        queue.enqueue(source("a")).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(source("b")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "full queue must hold the producer");
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.dequeue().await, Some(source("a")));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await, Some(source("b")));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumers() {
        let queue = Arc::new(BoundedSourceQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_fails_blocked_producers() {
        let queue = Arc::new(BoundedSourceQueue::new(1));
        queue.enqueue(source("a")).await.unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(source("b")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(matches!(
            producer.await.unwrap(),
            Err(CoreError::QueueClosed)
        ));
        assert_eq!(queue.drain(), vec![source("a")]);
    }
}
