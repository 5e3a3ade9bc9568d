//! Proxy validation core
//!
//! This module provides functionality for:
//! - Parsing proxy endpoints from various formats (IP:PORT, URL, with credentials)
//! - Wire-level SOCKS4(a)/SOCKS5/HTTP(S) protocol probes
//! - Bounded retry/timeout and latency measurement around probes
//! - Reducing concurrent probe verdicts into one endpoint status

pub mod checker;
pub mod models;
pub mod parser;
pub mod probes;
pub mod retry;

pub use checker::{CheckerConfig, EndpointChecker};
pub use models::{CheckJob, Endpoint, Protocol, Status};
pub use parser::{ParsedProxy, ProxyParser};
pub use probes::ProbeParams;
pub use retry::{ProbeOutcome, RetryPolicy};
