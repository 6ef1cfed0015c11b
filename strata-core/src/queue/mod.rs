//! Event source queues.
//!
//! The collection walk pushes discovered [`EventSource`]s in; the foreman
//! claims them into tasks. Two implementations satisfy the same contract and
//! can be swapped without touching foreman logic:
//!
//! - [`BoundedSourceQueue`]: shared, capacity-bounded; producers block when it
//!   is full, which is how the walk feels backpressure from the worker pool.
//! - [`LocalSourceQueue`]: unbounded deque for the single-threaded fallback
//!   mode where the walk and the foreman share one thread of control.

use async_trait::async_trait;
use strata_model::EventSource;

use crate::error::Result;

mod bounded;
mod local;

pub use bounded::BoundedSourceQueue;
pub use local::LocalSourceQueue;

#[async_trait]
pub trait SourceQueue: Send + Sync {
    /// Appends a source. Fails with `QueueClosed` once [`close`](Self::close)
    /// has been called. May wait for capacity.
    async fn enqueue(&self, source: EventSource) -> Result<()>;

    /// Waits for the next source. Returns `None` only when the queue is
    /// closed and drained. Cancel-safe: a dropped call never loses a source.
    async fn dequeue(&self) -> Option<EventSource>;

    /// Non-blocking variant of [`dequeue`](Self::dequeue).
    fn try_dequeue(&self) -> Option<EventSource>;

    /// Signals that no more sources will be added. Outstanding sources can
    /// still be dequeued.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Estimate only; producers may race with this.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything still queued. Used at shutdown to
    /// persist unclaimed sources for a later resume.
    fn drain(&self) -> Vec<EventSource> {
        let mut out = Vec::new();
        while let Some(source) = self.try_dequeue() {
            out.push(source);
        }
        out
    }
}

/// Claims up to `max` sources: waits for the first, then takes whatever else
/// is immediately available. `None` means the queue is closed and drained.
///
/// Cancel-safe because everything after the first await is synchronous.
pub async fn claim_batch<Q>(queue: &Q, max: usize) -> Option<Vec<EventSource>>
where
    Q: SourceQueue + ?Sized,
{
    let first = queue.dequeue().await?;
    let mut batch = Vec::with_capacity(max.max(1));
    batch.push(first);
    while batch.len() < max {
        match queue.try_dequeue() {
            Some(source) => batch.push(source),
            None => break,
        }
    }
    Some(batch)
}

#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::error::CoreError;

    pub(crate) fn source(name: &str) -> EventSource {
        EventSource::file(format!("/evidence/{name}"))
    }

    /// Behaviour both queue implementations must share.
    pub(crate) async fn exercise<Q: SourceQueue>(queue: Q) {
        queue.enqueue(source("a")).await.unwrap();
        queue.enqueue(source("b")).await.unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue().await, Some(source("a")));

        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(source("c")).await,
            Err(CoreError::QueueClosed)
        ));

        // Closed queues still drain.
        assert_eq!(queue.dequeue().await, Some(source("b")));
        assert_eq!(queue.dequeue().await, None);
        assert!(queue.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn claim_batch_takes_available_sources_up_to_limit() {
        let queue = LocalSourceQueue::new();
        for name in ["a", "b", "c"] {
            queue.enqueue(source(name)).await.unwrap();
        }

        let batch = claim_batch(&queue, 2).await.unwrap();
        assert_eq!(batch, vec![source("a"), source("b")]);
        assert_eq!(queue.len(), 1);

        queue.close();
        assert_eq!(claim_batch(&queue, 2).await.unwrap(), vec![source("c")]);
        assert!(claim_batch(&queue, 2).await.is_none());
    }
}
