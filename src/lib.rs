//! Proxy Sentinel - Proxy Validator and Streamer
//!
//! Validates SOCKS4(a), SOCKS5, HTTP and HTTPS proxies by speaking their
//! wire protocols, keeps the verdicts in a local database and streams
//! freshly confirmed proxies to connected subscribers.

pub mod cache;
pub mod database;
pub mod dispatch;
pub mod proxy;
pub mod queue;
pub mod stream;
pub mod worker;

pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
