//! Check-job worker
//!
//! Pulls jobs from the queue, runs the endpoint checker and persists the
//! verdict. A contract error (job naming an unknown endpoint) drops that one
//! job; infrastructure errors leave the job uncompleted so the queue's own
//! redelivery can retry it.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::cache::SharedStore;
use crate::database::ProxyDatabase;
use crate::proxy::checker::EndpointChecker;
use crate::proxy::models::{CheckJob, Protocol};
use crate::queue::JobQueue;
use crate::stream::publish_good;
use crate::Result;

/// Default number of jobs one worker keeps in flight
const DEFAULT_JOB_CONCURRENCY: usize = 10;

/// One worker process over the shared queue
pub struct Worker<Q, S> {
    queue: Arc<Q>,
    cache: Arc<S>,
    db: ProxyDatabase,
    checker: EndpointChecker,
    concurrency: usize,
}

impl<Q, S> Worker<Q, S>
where
    Q: JobQueue + 'static,
    S: SharedStore + 'static,
{
    pub fn new(queue: Arc<Q>, cache: Arc<S>, db: ProxyDatabase, checker: EndpointChecker) -> Self {
        Self {
            queue,
            cache,
            db,
            checker,
            concurrency: DEFAULT_JOB_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Process a single job end to end.
    ///
    /// A job naming an unknown endpoint is logged and dropped without
    /// failing the worker. Database or cache failures bubble up as `Err`.
    pub async fn process_job(&self, job: &CheckJob) -> Result<()> {
        let Some(endpoint) = self.db.get(job.endpoint_id).await? else {
            error!("Unknown endpoint id {} in job, dropping it", job.endpoint_id);
            return Ok(());
        };

        debug!(
            "Started check for {} with protocol {}",
            endpoint.credentials_ip_port(),
            job.protocol.map_or("to find".to_string(), |p| p.to_string()),
        );

        let scope: Vec<Protocol> = job.protocol.into_iter().collect();
        let checked = self.checker.check_endpoint(endpoint, &scope).await;

        debug!(
            "Updated data about {} ({:?})",
            checked.credentials_ip_port(),
            checked.status
        );
        let checked = self.db.update_with_check_timestamp(&checked).await?;

        if checked.is_alive() {
            let line = match job.protocol {
                // client asked about one protocol; answer only if it works
                Some(protocol) if checked.protocol_flag(protocol) => {
                    Some(checked.url_with(protocol))
                }
                Some(_) => None,
                // client asked us to find the protocols, and we did
                None => Some(checked.to_string()),
            };

            if let Some(line) = line {
                publish_good(self.cache.as_ref(), line).await?;
            }
        } else {
            debug!("Bad proxy: {}", checked);
        }

        Ok(())
    }

    /// Claim a job, mark it running and process it. The job is completed
    /// only on success; a failed job stays claimed for redelivery.
    async fn handle(&self, job: CheckJob) {
        if let Err(e) = self.queue.start(&job).await {
            error!("Failed to start job for endpoint {}: {e:#}", job.endpoint_id);
            return;
        }

        match self.process_job(&job).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&job).await {
                    error!(
                        "Failed to complete job for endpoint {}: {e:#}",
                        job.endpoint_id
                    );
                }
            }
            Err(e) => error!("Job for endpoint {} failed: {e:#}", job.endpoint_id),
        }
    }

    /// Pull and process jobs with bounded concurrency until the queue is
    /// empty and every claimed job has finished
    pub async fn run_until_drained(self: Arc<Self>) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            while tasks.len() >= self.concurrency {
                tasks.join_next().await;
            }

            match self.queue.claim().await? {
                Some(job) => {
                    let worker = Arc::clone(&self);
                    tasks.spawn(async move { worker.handle(job).await });
                }
                None => {
                    if tasks.join_next().await.is_none() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Blocking adapter for synchronous call sites at the job boundary; the
/// checker itself stays fully asynchronous
pub fn process_job_blocking<Q, S>(worker: &Worker<Q, S>, job: &CheckJob) -> Result<()>
where
    Q: JobQueue + 'static,
    S: SharedStore + 'static,
{
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(worker.process_job(job))
}
