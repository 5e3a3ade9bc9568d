//! Endpoint checker: runs protocol probes concurrently and reduces their
//! verdicts into the endpoint's status, protocol flags and latency

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::proxy::models::{Endpoint, Protocol, Status};
use crate::proxy::probes::{self, ProbeParams, DEFAULT_ECHO_ENDPOINT};
use crate::proxy::retry::{measure, ProbeOutcome, RetryPolicy, DEFAULT_RETRIES};
use crate::Result;

/// Default per-attempt timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of endpoints checked concurrently by `check_many`
const DEFAULT_CONCURRENCY: usize = 10;

/// Configuration for the endpoint checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Per-attempt timeout for each probe
    pub timeout: Duration,
    /// Attempt budget per probe
    pub retries: u32,
    /// Number of concurrent endpoint checks in batch mode
    pub concurrency: usize,
    /// Echo endpoint the HTTP(S) probe requests through the proxy
    pub echo_endpoint: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: DEFAULT_RETRIES,
            concurrency: DEFAULT_CONCURRENCY,
            echo_endpoint: DEFAULT_ECHO_ENDPOINT.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_echo_endpoint(mut self, echo_endpoint: String) -> Self {
        self.echo_endpoint = echo_endpoint;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.timeout, self.retries)
    }
}

/// Checker for validating endpoints against their wire protocols
#[derive(Debug, Clone)]
pub struct EndpointChecker {
    config: CheckerConfig,
}

impl EndpointChecker {
    pub fn new() -> Self {
        Self {
            config: CheckerConfig::default(),
        }
    }

    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    fn probe_params(&self, endpoint: &Endpoint) -> ProbeParams {
        let mut params = ProbeParams::new(endpoint.ip.clone(), endpoint.port);
        if !endpoint.username.is_empty() {
            params = params
                .with_credentials(endpoint.username.clone(), endpoint.password.clone());
        }
        params
    }

    /// One retried, latency-tagged probe for a single protocol
    async fn run_probe(&self, protocol: Protocol, params: ProbeParams) -> Result<ProbeOutcome> {
        let policy = self.config.retry_policy();
        let echo_endpoint = self.config.echo_endpoint.clone();

        policy
            .run(move || {
                let params = params.clone();
                let echo_endpoint = echo_endpoint.clone();
                async move {
                    let outcome = measure(protocol, async {
                        match protocol {
                            Protocol::Socks4 => probes::check_socks4(&params).await,
                            Protocol::Socks5 => probes::check_socks5(&params).await,
                            Protocol::Http => {
                                probes::check_http(&params, false, &echo_endpoint).await
                            }
                            Protocol::Https => {
                                probes::check_http(&params, true, &echo_endpoint).await
                            }
                        }
                    })
                    .await;
                    Ok(outcome)
                }
            })
            .await
    }

    /// Check one endpoint against the requested protocols.
    ///
    /// An empty `scope` means a full check of every supported protocol, which
    /// is authoritative: protocol flags are rewritten from scratch. A
    /// non-empty scope is a targeted recheck that toggles only the scoped
    /// flags and leaves the rest of the record alone.
    ///
    /// All selected probes run concurrently; a failing probe never aborts its
    /// siblings, it just contributes no working protocol.
    pub async fn check_endpoint(&self, mut endpoint: Endpoint, scope: &[Protocol]) -> Endpoint {
        let full_check = scope.is_empty();
        let protocols: Vec<Protocol> = if full_check {
            Protocol::all().to_vec()
        } else {
            scope.to_vec()
        };

        debug!("Run {:?} for {}", protocols, endpoint.credentials_ip_port());

        let params = self.probe_params(&endpoint);
        let probes = protocols
            .iter()
            .map(|protocol| self.run_probe(*protocol, params.clone()));
        let results = join_all(probes).await;

        debug!(
            "Got results {:?} for {}",
            results,
            endpoint.credentials_ip_port()
        );

        reduce_outcomes(&mut endpoint, &protocols, full_check, results);

        debug!(
            "Working protocols for {} are {:?}",
            endpoint.credentials_ip_port(),
            endpoint.working_protocols()
        );

        endpoint
    }

    /// Check many endpoints concurrently with a worker-internal limit
    pub async fn check_many(&self, endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        stream::iter(endpoints)
            .map(|endpoint| {
                let sem = Arc::clone(&semaphore);
                let checker = self.clone();
                async move {
                    // the semaphore lives as long as the whole batch, so
                    // acquire can only fail if it was closed explicitly
                    let _permit = sem.acquire().await.expect("Semaphore closed unexpectedly");
                    checker.check_endpoint(endpoint, &[]).await
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await
    }
}

impl Default for EndpointChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold heterogeneous probe results into the endpoint record.
///
/// The reduction is order-independent: working protocols form a set and the
/// latency taken is the minimum over all positive outcomes.
fn reduce_outcomes(
    endpoint: &mut Endpoint,
    protocols: &[Protocol],
    full_check: bool,
    results: Vec<Result<ProbeOutcome>>,
) {
    let mut working: Vec<Protocol> = Vec::new();
    let mut best_latency: Option<f64> = None;

    for result in results {
        match result {
            Ok(outcome) if outcome.ok => {
                working.push(outcome.protocol);
                best_latency = Some(match best_latency {
                    Some(current) => current.min(outcome.latency_ms),
                    None => outcome.latency_ms,
                });
            }
            Ok(_) => {}
            Err(e) => {
                // exhausted retries (timeouts included); counts as not working
                error!(
                    "Probe error for {}: {}",
                    endpoint.credentials_ip_port(),
                    e
                );
            }
        }
    }

    if full_check {
        endpoint.set_working_protocols(&working);
        endpoint.latency = best_latency;
    } else {
        for protocol in protocols {
            endpoint.set_protocol_flag(*protocol, working.contains(protocol));
        }
        if let Some(observed) = best_latency {
            endpoint.latency = Some(match endpoint.latency {
                Some(current) => current.min(observed),
                None => observed,
            });
        }
    }

    if endpoint.working_protocols().is_empty() {
        endpoint.status = Some(Status::Dead);
        endpoint.latency = None;
    } else {
        endpoint.status = Some(Status::Alive);
    }
}
