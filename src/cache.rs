//! Shared transient store boundary
//!
//! TTL'd keys plus list operations, the subset of a Redis-style store the
//! progress tracker and the good-result buffer need. Every operation is a
//! single-key atomic step. `MemoryStore` is the in-process backend.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::Result;

/// Key-value store with TTL support and FIFO lists.
///
/// Methods are desugared `async fn`s with an explicit `Send` bound so
/// generic callers can hand the futures to `tokio::spawn`.
pub trait SharedStore: Send + Sync {
    /// Set a string value, optionally expiring after `ttl`
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Re-arm (or arm) the TTL of an existing key; no-op for missing keys
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<()>> + Send;

    /// Atomic integer increment; missing keys count from zero
    fn incr_by(&self, key: &str, delta: i64) -> impl Future<Output = Result<i64>> + Send;

    /// Append to the right end of a list, creating it if needed
    fn rpush(&self, key: &str, item: String) -> impl Future<Output = Result<()>> + Send;

    /// Pop from the left end of a list
    fn lpop(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn llen(&self, key: &str) -> impl Future<Output = Result<usize>> + Send;
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Instant::now() >= deadline)
    }
}

/// In-process store backend with lazy TTL expiry
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drops the entry if its TTL has passed, then hands back the live one
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| e.expired()) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

impl SharedStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = live_entry(&mut entries, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let current = match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => s.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + delta;

        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn rpush(&self, key: &str, item: String) -> Result<()> {
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.push_back(item),
            _ => {
                let mut list = VecDeque::new();
                list.push_back(item);
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(list),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.pop_front(),
            _ => None,
        })
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        Ok(match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.len(),
            _ => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryStore::new();
        store.set("k", "v".to_string(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expires_key() {
        let store = MemoryStore::new();
        store
            .set("k", "v".to_string(), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_by_from_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("n", 5).await.unwrap(), 5);
        assert_eq!(store.incr_by("n", -2).await.unwrap(), 3);
        assert_eq!(store.get("n").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_list_fifo() {
        let store = MemoryStore::new();
        store.rpush("l", "a".to_string()).await.unwrap();
        store.rpush("l", "b".to_string()).await.unwrap();

        assert_eq!(store.llen("l").await.unwrap(), 2);
        assert_eq!(store.lpop("l").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.lpop("l").await.unwrap(), Some("b".to_string()));
        assert_eq!(store.lpop("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expire_on_list() {
        let store = MemoryStore::new();
        store.rpush("l", "a".to_string()).await.unwrap();
        store.expire("l", Duration::from_millis(30)).await.unwrap();
        assert_eq!(store.llen("l").await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.llen("l").await.unwrap(), 0);
    }

    /// Exercises the store through the trait bound from a spawned task, the
    /// way stream relays drive it; needs the methods' futures to be `Send`
    async fn push_from_task<S: SharedStore + 'static>(store: std::sync::Arc<S>, item: String) {
        tokio::spawn(async move { store.rpush("l", item).await })
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rpush_from_spawned_generic_task() {
        let store = std::sync::Arc::new(MemoryStore::new());
        push_from_task(store.clone(), "a".to_string()).await;
        assert_eq!(store.lpop("l").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_expire_missing_key_is_noop() {
        let store = MemoryStore::new();
        store.expire("ghost", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.get("ghost").await.unwrap(), None);
    }
}
