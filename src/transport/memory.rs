//! In-process transport
//!
//! A [`MemoryBackend`] plays the role of the remote server; each
//! [`MemoryTransport`] is one client connection to it with its own
//! lifecycle, so several instances can share a backend in one process.
//! Expiry uses `tokio::time::Instant`, which makes leases testable with a
//! paused clock.

use super::{ConnectionState, Message, Subscription, Swap, Transport};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Subscriber {
    connection: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Shared {
    map: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    drop_messages: AtomicBool,
    reject_publish: AtomicBool,
    next_connection: AtomicU64,
}

/// Drop the entry if it has expired and return the live one
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
        map.remove(key);
    }
    map.get_mut(key)
}

/// Shared in-memory server
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection
    pub fn connect(&self) -> MemoryTransport {
        let (state, _) = watch::channel(ConnectionState::Connected);
        MemoryTransport {
            shared: self.shared.clone(),
            connection: self.shared.next_connection.fetch_add(1, Ordering::SeqCst),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            state,
        }
    }

    /// Silently lose every published message (lossy pub/sub)
    pub fn set_drop_messages(&self, drop: bool) {
        self.shared.drop_messages.store(drop, Ordering::SeqCst);
    }

    /// Fail every PUBLISH while keys stay writable
    pub fn set_reject_publish(&self, reject: bool) {
        self.shared.reject_publish.store(reject, Ordering::SeqCst);
    }

    /// Raw stored bytes, bypassing any connection
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        let mut map = self.shared.map.lock().unwrap();
        live(&mut map, key).map(|e| e.value.clone())
    }

    /// Number of live subscribers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// One connection to a [`MemoryBackend`]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    connection: u64,
    available: AtomicBool,
    closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Connection to a private backend
    pub fn new() -> Self {
        MemoryBackend::new().connect()
    }

    /// Simulate losing (or regaining) the connection.
    ///
    /// While unavailable every operation fails with [`Error::Transport`] and
    /// this connection's subscriptions are terminated.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available && !self.closed.load(Ordering::SeqCst) {
            self.state.send_replace(ConnectionState::Connected);
        } else {
            self.drop_subscriptions();
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection closed".into()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection lost".into()));
        }
        Ok(())
    }

    fn drop_subscriptions(&self) {
        let mut channels = self.shared.channels.lock().unwrap();
        for subs in channels.values_mut() {
            subs.retain(|s| s.connection != self.connection);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let mut map = self.shared.map.lock().unwrap();
        Ok(live(&mut map, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        let mut map = self.shared.map.lock().unwrap();
        map.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut map = self.shared.map.lock().unwrap();
        if live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry::new(value, Some(ttl)));
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<Swap> {
        self.check()?;
        let mut map = self.shared.map.lock().unwrap();
        let current = live(&mut map, key).map(|e| e.value.clone());
        if current.as_deref() != expected {
            return Ok(Swap::Conflict { current });
        }
        match new {
            Some(value) => {
                map.insert(key.to_string(), Entry::new(value, ttl));
            }
            None => {
                map.remove(key);
            }
        }
        Ok(Swap::Applied)
    }

    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<Swap> {
        self.check()?;
        let mut map = self.shared.map.lock().unwrap();
        match live(&mut map, key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(Swap::Applied)
            }
            Some(entry) => Ok(Swap::Conflict {
                current: Some(entry.value.clone()),
            }),
            None => Ok(Swap::Conflict { current: None }),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut map = self.shared.map.lock().unwrap();
        Ok(match live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.check()?;
        let mut map = self.shared.map.lock().unwrap();
        let mut removed = 0;
        for key in keys {
            if live(&mut map, key).is_some() {
                map.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let mut map = self.shared.map.lock().unwrap();
        map.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64> {
        self.check()?;
        if self.shared.reject_publish.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("publish to {} rejected", channel)));
        }
        if self.shared.drop_messages.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut channels = self.shared.channels.lock().unwrap();
        let Some(subs) = channels.get_mut(channel) else {
            return Ok(0);
        };
        let message = Message {
            channel: channel.to_string(),
            payload,
        };
        subs.retain(|s| s.tx.send(message.clone()).is_ok());
        Ok(subs.len() as u64)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.shared.channels.lock().unwrap();
        for channel in channels {
            registry.entry(channel.clone()).or_default().push(Subscriber {
                connection: self.connection,
                tx: tx.clone(),
            });
        }
        Ok(Subscription::new(rx))
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.drop_subscriptions();
        self.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}
