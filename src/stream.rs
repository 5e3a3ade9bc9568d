//! Good-result publishing and live streaming
//!
//! Confirmed endpoints are pushed onto a shared transient list; each
//! connected subscriber gets a long-lived task that drains the list in FIFO
//! order and relays one line per endpoint. Delivery is fire-and-forget: a
//! subscriber that disconnects is simply removed, nothing is redelivered.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::cache::SharedStore;
use crate::dispatch::GOOD_LIST_KEY;
use crate::Result;

/// How long an idle subscriber waits before re-polling the list
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Append a confirmed-alive endpoint line to the shared good-results list
pub async fn publish_good<S: SharedStore>(store: &S, line: String) -> Result<()> {
    debug!("Good proxy: {}", line);
    store.rpush(GOOD_LIST_KEY, line).await
}

/// Line-oriented push server for freshly confirmed endpoints
pub struct StreamServer<S> {
    store: Arc<S>,
}

impl<S: SharedStore + 'static> StreamServer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Accept subscribers forever, one relay task per connection
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            info!("Connected stream subscriber {}", peer);

            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                if let Err(e) = relay_to_subscriber(store.as_ref(), socket).await {
                    debug!("Subscriber {} dropped: {}", peer, e);
                }
                info!("Disconnected stream subscriber {}", peer);
            });
        }
    }
}

/// Pop-and-forward loop for one subscriber.
///
/// While the list has a backlog items are relayed back to back; only an
/// empty list waits out the poll interval. A write failure ends the loop
/// and thereby unsubscribes the client.
async fn relay_to_subscriber<S: SharedStore>(store: &S, mut socket: TcpStream) -> Result<()> {
    loop {
        if store.llen(GOOD_LIST_KEY).await? > 0 {
            if let Some(line) = store.lpop(GOOD_LIST_KEY).await? {
                socket.write_all(line.as_bytes()).await?;
                socket.write_all(b"\n").await?;
            }
        } else {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_subscriber_receives_published_lines_in_order() {
        let store = Arc::new(MemoryStore::new());
        publish_good(store.as_ref(), "socks5://1.2.3.4:1080".to_string())
            .await
            .unwrap();
        publish_good(store.as_ref(), "http://5.6.7.8:8080".to_string())
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = StreamServer::new(store.clone());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(client).lines();

        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "socks5://1.2.3.4:1080"
        );
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "http://5.6.7.8:8080"
        );
        assert_eq!(store.llen(GOOD_LIST_KEY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_late_publish_reaches_connected_subscriber() {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = StreamServer::new(store.clone());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(client).lines();

        // published only after the subscriber is already polling
        tokio::time::sleep(Duration::from_millis(50)).await;
        publish_good(store.as_ref(), "socks4://9.9.9.9:1080".to_string())
            .await
            .unwrap();

        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "socks4://9.9.9.9:1080"
        );
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_does_not_kill_server() {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = StreamServer::new(store.clone());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        // connect and immediately hang up
        drop(TcpStream::connect(addr).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        publish_good(store.as_ref(), "http://1.1.1.1:80".to_string())
            .await
            .unwrap();

        // a fresh subscriber still gets served
        let client = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(client).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "http://1.1.1.1:80");
    }
}
