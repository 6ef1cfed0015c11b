use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use strata_model::EventSource;
use tokio::sync::Notify;

use super::SourceQueue;
use crate::error::{CoreError, Result};

/// Unbounded in-memory deque for the single-threaded fallback mode.
///
/// Enqueue never waits. Dequeue on an empty, open queue parks until a
/// producer pushes or closes.
#[derive(Debug, Default)]
pub struct LocalSourceQueue {
    items: Mutex<VecDeque<EventSource>>,
    closed: std::sync::atomic::AtomicBool,
    available: Notify,
}

impl LocalSourceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an already-closed queue from a known list, the common shape in
    /// single-threaded runs where discovery finishes before extraction.
    pub fn from_sources(
        sources: impl IntoIterator<Item = EventSource>,
    ) -> Self {
        let queue = Self::new();
        queue.items().extend(sources);
        queue.close();
        queue
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<EventSource>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SourceQueue for LocalSourceQueue {
    async fn enqueue(&self, source: EventSource) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::QueueClosed);
        }
        self.items().push_back(source);
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<EventSource> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(source) = self.try_dequeue() {
                return Some(source);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    fn try_dequeue(&self) -> Option<EventSource> {
        self.items().pop_front()
    }

    fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Release);
        self.available.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.items().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::contract::{exercise, source};

    #[tokio::test]
    async fn satisfies_queue_contract() {
        exercise(LocalSourceQueue::new()).await;
    }

    #[tokio::test]
    async fn from_sources_is_closed_and_ordered() {
        let queue = LocalSourceQueue::from_sources([source("a"), source("b")]);
        assert!(queue.is_closed());
        assert_eq!(queue.drain(), vec![source("a"), source("b")]);
        assert_eq!(queue.dequeue().await, None);
    }
}
