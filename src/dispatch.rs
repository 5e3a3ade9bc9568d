//! Job dispatch and batch progress tracking
//!
//! Progress is a computed view: `current_len` is introspected from the queue
//! (pending + active + reserved) while `initial_len` lives in the shared
//! store under a TTL sized to the predicted duration of the batch.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::SharedStore;
use crate::proxy::models::{CheckJob, Endpoint, Protocol};
use crate::proxy::retry::RetryPolicy;
use crate::queue::JobQueue;
use crate::Result;

/// Shared-store key holding the batch's starting job count
pub const INITIAL_LEN_KEY: &str = "initial_len";

/// Shared-store list of freshly confirmed endpoints awaiting streaming
pub const GOOD_LIST_KEY: &str = "good_proxies";

/// Grace period the good list survives after a batch completes, so slow
/// stream consumers can still drain it
const DEFAULT_DRAIN_TTL: Duration = Duration::from_secs(120);

/// Snapshot for progress indicators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub current_len: usize,
    pub initial_len: usize,
    pub progressbar_width: f64,
    pub value_now: i64,
}

/// Submits check jobs and tracks how many are left
pub struct Dispatcher<Q, S> {
    queue: Arc<Q>,
    store: Arc<S>,
    policy: RetryPolicy,
    drain_ttl: Duration,
}

impl<Q: JobQueue, S: SharedStore> Dispatcher<Q, S> {
    pub fn new(queue: Arc<Q>, store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            store,
            policy,
            drain_ttl: DEFAULT_DRAIN_TTL,
        }
    }

    pub fn with_drain_ttl(mut self, drain_ttl: Duration) -> Self {
        self.drain_ttl = drain_ttl;
        self
    }

    /// Jobs still outstanding: queued + actively running + claimed by a
    /// worker but not yet started
    pub async fn current_len(&self) -> Result<usize> {
        Ok(self.queue.pending_len().await?
            + self.queue.active_len().await?
            + self.queue.reserved_len().await?)
    }

    async fn get_initial_len(&self) -> Result<usize> {
        Ok(self
            .store
            .get(INITIAL_LEN_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Fold `additional` new jobs into the batch counter; jobs still in
    /// flight from a previous batch stay counted. The key's TTL is sized to
    /// the predicted worst-case duration of the whole batch.
    pub async fn update_initial_len(&self, additional: usize) -> Result<usize> {
        let new_len = additional + self.current_len().await?;
        self.store
            .set(
                INITIAL_LEN_KEY,
                new_len.to_string(),
                Some(self.policy.predict_check_time(new_len)),
            )
            .await?;
        info!("Set initial_len={}", new_len);
        Ok(new_len)
    }

    /// Compute the progress snapshot.
    ///
    /// When the batch has fully drained this also schedules the good-result
    /// list to expire after the drain grace period rather than clearing it.
    pub async fn get_progress(&self) -> Result<Progress> {
        let current_len = self.current_len().await?;

        // fall back to the live count when the stored value expired
        let stored = self.get_initial_len().await?;
        let initial_len = if stored > 0 { stored } else { current_len };

        let progressbar_width = if initial_len > 0 {
            100.0 - (100.0 * current_len as f64 / initial_len as f64)
        } else {
            0.0
        };

        if progressbar_width >= 100.0 {
            self.store.expire(GOOD_LIST_KEY, self.drain_ttl).await?;
        }

        Ok(Progress {
            current_len,
            initial_len,
            progressbar_width,
            value_now: initial_len as i64 - current_len as i64,
        })
    }

    /// Enqueue one job per endpoint, all scoped to `protocol` when given,
    /// and bump the batch counter. Returns the new initial length.
    pub async fn dispatch(
        &self,
        endpoints: &[Endpoint],
        protocol: Option<Protocol>,
    ) -> Result<usize> {
        let jobs = endpoints
            .iter()
            .map(|endpoint| CheckJob::new(endpoint.id, protocol))
            .collect();
        self.dispatch_jobs(jobs).await
    }

    /// Enqueue prepared jobs, each carrying its own protocol scope, and bump
    /// the batch counter. Returns the new initial length.
    pub async fn dispatch_jobs(&self, jobs: Vec<CheckJob>) -> Result<usize> {
        let initial_len = self.update_initial_len(jobs.len()).await?;

        for job in jobs {
            debug!(
                "Dispatching check for endpoint {} ({:?})",
                job.endpoint_id, job.protocol
            );
            self.queue.enqueue(job).await?;
        }

        Ok(initial_len)
    }

    /// Drop all pending jobs; anything a worker already claimed finishes
    /// normally
    pub async fn purge_queues(&self) -> Result<()> {
        self.queue.purge_pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::queue::MemoryQueue;

    fn endpoints(n: usize) -> Vec<Endpoint> {
        (0..n)
            .map(|i| {
                let mut e = Endpoint::new(
                    format!("10.0.0.{}", i + 1),
                    8080,
                    String::new(),
                    String::new(),
                );
                e.id = i as i64 + 1;
                e
            })
            .collect()
    }

    fn dispatcher(
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryStore>,
    ) -> Dispatcher<MemoryQueue, MemoryStore> {
        Dispatcher::new(queue, store, RetryPolicy::new(Duration::from_secs(10), 3))
    }

    #[tokio::test]
    async fn test_progress_right_after_dispatch() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        let initial = dispatcher.dispatch(&endpoints(10), None).await.unwrap();
        assert_eq!(initial, 10);

        let progress = dispatcher.get_progress().await.unwrap();
        assert_eq!(progress.initial_len, 10);
        assert_eq!(progress.current_len, 10);
        assert_eq!(progress.progressbar_width, 0.0);
        assert_eq!(progress.value_now, 0);
    }

    #[tokio::test]
    async fn test_progress_reaches_100_when_drained() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        dispatcher.dispatch(&endpoints(10), None).await.unwrap();

        while let Some(job) = queue.claim().await.unwrap() {
            queue.start(&job).await.unwrap();
            queue.complete(&job).await.unwrap();
        }

        let progress = dispatcher.get_progress().await.unwrap();
        assert_eq!(progress.current_len, 0);
        assert_eq!(progress.progressbar_width, 100.0);
        assert_eq!(progress.value_now, 10);
    }

    #[tokio::test]
    async fn test_progress_halfway() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        dispatcher.dispatch(&endpoints(4), None).await.unwrap();

        for _ in 0..2 {
            let job = queue.claim().await.unwrap().unwrap();
            queue.start(&job).await.unwrap();
            queue.complete(&job).await.unwrap();
        }

        let progress = dispatcher.get_progress().await.unwrap();
        assert_eq!(progress.current_len, 2);
        assert_eq!(progress.progressbar_width, 50.0);
        assert_eq!(progress.value_now, 2);
    }

    #[tokio::test]
    async fn test_claimed_jobs_still_count_as_current() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        dispatcher.dispatch(&endpoints(3), None).await.unwrap();

        // one reserved, one active, one still pending
        let reserved = queue.claim().await.unwrap().unwrap();
        let active = queue.claim().await.unwrap().unwrap();
        queue.start(&active).await.unwrap();
        let _ = reserved;

        assert_eq!(dispatcher.current_len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_completed_batch_schedules_good_list_expiry() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store.clone())
            .with_drain_ttl(Duration::from_millis(30));

        store
            .rpush(GOOD_LIST_KEY, "socks5://1.2.3.4:1080".to_string())
            .await
            .unwrap();

        dispatcher.dispatch(&endpoints(1), None).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        queue.start(&job).await.unwrap();
        queue.complete(&job).await.unwrap();

        let progress = dispatcher.get_progress().await.unwrap();
        assert!(progress.progressbar_width >= 100.0);

        // not cleared immediately: trailing consumers may still drain it
        assert_eq!(store.llen(GOOD_LIST_KEY).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.llen(GOOD_LIST_KEY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_jobs_preserves_per_job_protocol() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        let initial = dispatcher
            .dispatch_jobs(vec![
                CheckJob::new(1, Some(Protocol::Socks5)),
                CheckJob::new(2, None),
                CheckJob::new(3, Some(Protocol::Http)),
            ])
            .await
            .unwrap();
        assert_eq!(initial, 3);

        let first = queue.claim().await.unwrap().unwrap();
        assert_eq!(first.protocol, Some(Protocol::Socks5));
        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(second.protocol, None);
        let third = queue.claim().await.unwrap().unwrap();
        assert_eq!(third.protocol, Some(Protocol::Http));
    }

    #[tokio::test]
    async fn test_progress_serializes_to_json() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        dispatcher.dispatch(&endpoints(10), None).await.unwrap();

        let progress = dispatcher.get_progress().await.unwrap();
        assert_eq!(
            serde_json::to_string(&progress).unwrap(),
            r#"{"current_len":10,"initial_len":10,"progressbar_width":0.0,"value_now":0}"#
        );
    }

    #[tokio::test]
    async fn test_update_initial_len_includes_in_flight_jobs() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        dispatcher.dispatch(&endpoints(2), None).await.unwrap();
        let new_len = dispatcher.update_initial_len(5).await.unwrap();
        assert_eq!(new_len, 7);
    }

    #[tokio::test]
    async fn test_purge_queues_only_drops_pending() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(queue.clone(), store);

        dispatcher.dispatch(&endpoints(3), None).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        queue.start(&job).await.unwrap();

        dispatcher.purge_queues().await.unwrap();
        assert_eq!(dispatcher.current_len().await.unwrap(), 1);
    }
}
