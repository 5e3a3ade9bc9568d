//! Bounded retry/timeout wrapper and latency tagging
//!
//! The layers compose as retry(measure(probe)): `measure` turns a bare bool
//! probe into a protocol-tagged, latency-annotated outcome, and `RetryPolicy`
//! re-runs the whole attempt when it times out, errors, or reports a negative
//! verdict. Timeouts and transient resets are retried identically to explicit
//! negative answers, so flaky endpoints get a fair shot within one check.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::{timeout, Instant};

use crate::proxy::models::Protocol;
use crate::Result;

/// Default attempt budget per probe
pub const DEFAULT_RETRIES: u32 = 3;

/// Normalized result of one tagged probe attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub protocol: Protocol,
    /// Wall-clock duration of the wrapped call in milliseconds, reported
    /// even on failure
    pub latency_ms: f64,
}

/// Anything the retry wrapper can inspect for "did this attempt fail"
pub trait Verdict {
    fn is_negative(&self) -> bool;
}

impl Verdict for bool {
    fn is_negative(&self) -> bool {
        !*self
    }
}

impl Verdict for ProbeOutcome {
    fn is_negative(&self) -> bool {
        !self.ok
    }
}

/// Run a future and tag its boolean verdict with the protocol name and the
/// measured latency
pub async fn measure<F>(protocol: Protocol, probe: F) -> ProbeOutcome
where
    F: Future<Output = bool>,
{
    let start = Instant::now();
    let ok = probe.await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    ProbeOutcome {
        ok,
        protocol,
        latency_ms,
    }
}

/// Per-attempt timeout plus a bounded, backoff-less retry budget
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: DEFAULT_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    /// Predicted worst-case duration for a batch of `count` checks
    pub fn predict_check_time(&self, count: usize) -> Duration {
        self.timeout * self.retries * count as u32
    }

    /// Run `make_attempt` up to `retries` times, each attempt bounded by
    /// `timeout`.
    ///
    /// A timed-out, errored or negative attempt that is not the last one is
    /// retried silently. On the last attempt a timeout or error propagates
    /// as `Err`, while a completed negative verdict is returned as a concrete
    /// `Ok` value, never swallowed.
    pub async fn run<T, F, Fut>(&self, make_attempt: F) -> Result<T>
    where
        T: Verdict,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retries.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            let is_last = attempt == attempts;
            match timeout(self.timeout, make_attempt()).await {
                Ok(Ok(verdict)) => {
                    if !verdict.is_negative() {
                        return Ok(verdict);
                    }
                    last = Some(verdict);
                }
                Ok(Err(e)) => {
                    if is_last {
                        return Err(e);
                    }
                }
                Err(_) => {
                    if is_last {
                        return Err(anyhow!(
                            "probe attempt timed out after {:?}",
                            self.timeout
                        ));
                    }
                }
            }
        }

        // every attempt completed with a negative verdict
        last.ok_or_else(|| anyhow!("probe produced no result"))
    }
}
