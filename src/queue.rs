//! Check-job queue boundary
//!
//! The core only needs FIFO worker-pull semantics plus introspectable
//! pending/active/reserved counts, so the broker technology stays behind
//! this trait. `MemoryQueue` is the in-process backend; a distributed broker
//! implementation can be swapped in without touching the dispatcher or
//! workers.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::proxy::models::CheckJob;
use crate::Result;

/// FIFO job queue with worker pull semantics.
///
/// Job lifecycle: enqueued (pending) -> claimed by a worker (reserved) ->
/// started (active) -> completed. `purge_pending` drops only jobs nobody has
/// claimed yet; in-flight work always finishes normally.
///
/// Methods are desugared `async fn`s with an explicit `Send` bound so
/// generic callers can hand the futures to `tokio::spawn`.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: CheckJob) -> impl Future<Output = Result<()>> + Send;

    /// Pull the oldest pending job, marking it reserved
    fn claim(&self) -> impl Future<Output = Result<Option<CheckJob>>> + Send;

    /// Transition a claimed job from reserved to actively running
    fn start(&self, job: &CheckJob) -> impl Future<Output = Result<()>> + Send;

    /// Mark an active job finished
    fn complete(&self, job: &CheckJob) -> impl Future<Output = Result<()>> + Send;

    fn pending_len(&self) -> impl Future<Output = Result<usize>> + Send;
    fn active_len(&self) -> impl Future<Output = Result<usize>> + Send;
    fn reserved_len(&self) -> impl Future<Output = Result<usize>> + Send;

    fn purge_pending(&self) -> impl Future<Output = Result<()>> + Send;
}

/// In-process queue backend
#[derive(Debug, Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<CheckJob>>,
    reserved: AtomicUsize,
    active: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: CheckJob) -> Result<()> {
        self.pending.lock().await.push_back(job);
        Ok(())
    }

    async fn claim(&self) -> Result<Option<CheckJob>> {
        let job = self.pending.lock().await.pop_front();
        if job.is_some() {
            self.reserved.fetch_add(1, Ordering::SeqCst);
        }
        Ok(job)
    }

    async fn start(&self, _job: &CheckJob) -> Result<()> {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete(&self, _job: &CheckJob) -> Result<()> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pending_len(&self) -> Result<usize> {
        Ok(self.pending.lock().await.len())
    }

    async fn active_len(&self) -> Result<usize> {
        Ok(self.active.load(Ordering::SeqCst))
    }

    async fn reserved_len(&self) -> Result<usize> {
        Ok(self.reserved.load(Ordering::SeqCst))
    }

    async fn purge_pending(&self) -> Result<()> {
        self.pending.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new();
        queue.enqueue(CheckJob::new(1, None)).await.unwrap();
        queue.enqueue(CheckJob::new(2, None)).await.unwrap();

        assert_eq!(queue.claim().await.unwrap().unwrap().endpoint_id, 1);
        assert_eq!(queue.claim().await.unwrap().unwrap().endpoint_id, 2);
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_counts() {
        let queue = MemoryQueue::new();
        queue.enqueue(CheckJob::new(1, None)).await.unwrap();
        queue.enqueue(CheckJob::new(2, None)).await.unwrap();

        assert_eq!(queue.pending_len().await.unwrap(), 2);
        assert_eq!(queue.reserved_len().await.unwrap(), 0);

        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(queue.pending_len().await.unwrap(), 1);
        assert_eq!(queue.reserved_len().await.unwrap(), 1);
        assert_eq!(queue.active_len().await.unwrap(), 0);

        queue.start(&job).await.unwrap();
        assert_eq!(queue.reserved_len().await.unwrap(), 0);
        assert_eq!(queue.active_len().await.unwrap(), 1);

        queue.complete(&job).await.unwrap();
        assert_eq!(queue.active_len().await.unwrap(), 0);
        assert_eq!(queue.pending_len().await.unwrap(), 1);
    }

    use std::sync::Arc;

    /// Exercises the queue through the trait bound from a spawned task, the
    /// way the worker loop drives it; needs the methods' futures to be `Send`
    async fn claim_from_task<Q: JobQueue + 'static>(queue: Arc<Q>) -> Option<CheckJob> {
        tokio::spawn(async move { queue.claim().await })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_claim_from_spawned_generic_task() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(CheckJob::new(7, None)).await.unwrap();

        let job = claim_from_task(Arc::clone(&queue)).await.unwrap();
        assert_eq!(job.endpoint_id, 7);
        assert_eq!(queue.reserved_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_pending_spares_claimed_jobs() {
        let queue = MemoryQueue::new();
        queue.enqueue(CheckJob::new(1, None)).await.unwrap();
        queue.enqueue(CheckJob::new(2, None)).await.unwrap();

        let claimed = queue.claim().await.unwrap().unwrap();
        queue.start(&claimed).await.unwrap();

        queue.purge_pending().await.unwrap();

        assert_eq!(queue.pending_len().await.unwrap(), 0);
        // the in-flight job is untouched
        assert_eq!(queue.active_len().await.unwrap(), 1);
    }
}
