//! Key-value / pub-sub transport
//!
//! The coordination layer talks to the remote store only through
//! [`Transport`]. Every conditional write is a single server-side atomic
//! operation; callers never read and then write to decide ownership.
//!
//! Backends:
//! - [`MemoryTransport`]: in-process, always available (tests, embedding)
//! - `RedisTransport`: Redis/Valkey (feature `redis-backend`)

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis_client;

pub use memory::{MemoryBackend, MemoryTransport};
#[cfg(feature = "redis-backend")]
pub use redis_client::{RedisConnector, RedisTransport};

use crate::common::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Swap {
    /// The expectation held and the write was applied
    Applied,
    /// The expectation failed; carries the value found instead
    Conflict { current: Option<Vec<u8>> },
}

impl Swap {
    pub fn is_applied(&self) -> bool {
        matches!(self, Swap::Applied)
    }
}

/// Health of the underlying connection, observed by every dependent component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Live subscription; dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            rx,
            forwarder: None,
        }
    }

    /// Subscription fed by a background task that is aborted on drop
    pub fn with_forwarder(rx: mpsc::UnboundedReceiver<Message>, forwarder: JoinHandle<()>) -> Self {
        Self {
            rx,
            forwarder: Some(forwarder),
        }
    }

    /// Next message; `None` once the stream is gone (connection dropped or closed)
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("forwarded", &self.forwarder.is_some())
            .finish()
    }
}

/// Remote store operations used by the coordination layer
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// SET with an optional expiry
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// SET NX PX: write only when the key is absent (expired keys are absent)
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Atomically replace the value when it currently equals `expected`
    /// (`None` = key absent). `new = None` deletes the key.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<Swap>;

    /// Atomically reset the expiry when the value equals `expected`
    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<Swap>;

    /// PEXPIRE; false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// DEL; returns the number of keys removed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Every key starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// PUBLISH; returns the number of receivers
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64>;

    /// SUBSCRIBE to every channel in `channels`
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription>;

    /// Watch the connection state
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Close the connection; later operations fail with a transport error
    async fn close(&self) -> Result<()>;
}

/// Opens new connections to one store.
///
/// Components that need their own connection (the context store, the
/// cluster node) are handed a connector rather than a shared client.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(MemoryBackend::connect(self)))
    }
}
