//! Redis / Valkey transport
//!
//! Conditional writes run as Lua scripts so the compare and the write are one
//! server-side step. A dropped connection is reported to the failing call and
//! re-established in the background with capped exponential backoff, so the
//! connection state recovers even when nothing else is calling; the failed
//! call itself is never replayed.

use super::{ConnectionState, Connector, Message, Subscription, Swap, Transport};
use crate::common::{retry_with_backoff, Error, Result, StoreConfig};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult, Script};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const SCAN_COUNT: usize = 500;

/// ARGV: expected_present, expected, new_present, new, ttl_ms
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
local matches
if ARGV[1] == '0' then
  matches = (current == false)
else
  matches = (current == ARGV[2])
end
if matches then
  if ARGV[3] == '0' then
    redis.call('DEL', KEYS[1])
  elseif tonumber(ARGV[5]) > 0 then
    redis.call('SET', KEYS[1], ARGV[4], 'PX', ARGV[5])
  else
    redis.call('SET', KEYS[1], ARGV[4])
  end
  return {1, 0, ''}
end
if current == false then
  return {0, 0, ''}
end
return {0, 1, current}
"#;

/// ARGV: expected, ttl_ms
const COMPARE_AND_EXPIRE: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return {1, 0, ''}
end
if current == false then
  return {0, 0, ''}
end
return {0, 1, current}
"#;

struct Link {
    conn: Option<MultiplexedConnection>,
    failures: u32,
    retry_at: Option<Instant>,
}

/// Connection state shared with the reconnect task
struct Shared {
    client: Client,
    link: Mutex<Link>,
    timeout: Duration,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

pub struct RedisTransport {
    shared: Arc<Shared>,
    timeout: Duration,
    cas: Script,
    cae: Script,
}

fn backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Escape glob metacharacters for SCAN MATCH
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

fn to_swap((applied, present, current): (i64, i64, Vec<u8>)) -> Swap {
    if applied == 1 {
        Swap::Applied
    } else {
        Swap::Conflict {
            current: (present == 1).then_some(current),
        }
    }
}

impl RedisTransport {
    /// Connect to a single-node deployment, retrying with capped backoff.
    pub async fn connect(config: &StoreConfig, timeout: Duration) -> Result<Self> {
        if config.is_multi_node() {
            return Err(Error::InvalidConfig(
                "sentinel and cluster topologies are not supported by the redis backend".into(),
            ));
        }
        let client = Client::open(config.url())
            .map_err(|e| Error::InvalidConfig(format!("store url: {}", e)))?;

        tracing::info!(
            "Connecting to {}:{} (db {}, tls {})",
            config.host,
            config.port,
            config.db,
            config.tls
        );
        let conn = retry_with_backoff(
            || {
                let client = client.clone();
                async move {
                    match tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
                        .await
                    {
                        Ok(Ok(conn)) => Ok(conn),
                        Ok(Err(e)) => Err(Error::ConnectionFailed(e.to_string())),
                        Err(_) => Err(Error::Timeout("connect".into())),
                    }
                }
            },
            config.connect_retries.max(1),
            INITIAL_BACKOFF,
            MAX_BACKOFF,
        )
        .await?;
        tracing::info!("Connected to Redis/Valkey");

        Ok(Self::from_shared(Shared::new(client, Some(conn), timeout)))
    }

    fn from_shared(shared: Shared) -> Self {
        Self {
            timeout: shared.timeout,
            shared: Arc::new(shared),
            cas: Script::new(COMPARE_AND_SWAP),
            cae: Script::new(COMPARE_AND_EXPIRE),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.shared.connection().await
    }

    /// Run one command with the operation timeout; connection failures mark the link broken.
    async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal() {
                    self.shared.mark_broken().await;
                }
                Err(e.into())
            }
            Err(_) => {
                self.shared.mark_broken().await;
                Err(Error::Timeout(op.to_string()))
            }
        }
    }
}

impl Shared {
    fn new(client: Client, conn: Option<MultiplexedConnection>, timeout: Duration) -> Self {
        let initial = if conn.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let (state, _) = watch::channel(initial);
        Self {
            client,
            link: Mutex::new(Link {
                conn,
                failures: 0,
                retry_at: None,
            }),
            timeout,
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            state,
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection closed".into()));
        }
        let mut link = self.link.lock().await;
        if let Some(conn) = &link.conn {
            return Ok(conn.clone());
        }
        if link.retry_at.is_some_and(|at| Instant::now() < at) {
            return Err(Error::Transport("reconnecting".into()));
        }

        let attempt =
            tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection()).await;
        match attempt {
            Ok(Ok(conn)) => {
                link.conn = Some(conn.clone());
                link.failures = 0;
                link.retry_at = None;
                self.state.send_replace(ConnectionState::Connected);
                tracing::info!("Reconnected to Redis/Valkey");
                Ok(conn)
            }
            failed => {
                link.failures += 1;
                let delay = backoff(link.failures);
                link.retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    "Reconnect attempt {} failed, next attempt in {:?}",
                    link.failures,
                    delay
                );
                match failed {
                    Ok(Err(e)) => Err(Error::ConnectionFailed(e.to_string())),
                    _ => Err(Error::Timeout("reconnect".into())),
                }
            }
        }
    }

    async fn mark_broken(self: &Arc<Self>) {
        let mut link = self.link.lock().await;
        if link.conn.take().is_some() {
            tracing::warn!("Connection to Redis/Valkey lost");
        }
        self.state.send_replace(ConnectionState::Disconnected);
        drop(link);
        self.spawn_reconnect();
    }

    /// Keep reconnecting until the link is back or the transport is closed.
    /// At most one task runs at a time; it ends when the transport is dropped.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(shared) = weak.upgrade() {
                if shared.closed.load(Ordering::SeqCst) || shared.connection().await.is_ok() {
                    shared.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                let wait = shared
                    .link
                    .lock()
                    .await
                    .retry_at
                    .map_or(INITIAL_BACKOFF, |at| at.saturating_duration_since(Instant::now()));
                drop(shared);
                tokio::time::sleep(wait).await;
            }
        });
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        self.run("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.run("SET", cmd.query_async(&mut conn)).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = self
            .run(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<Swap> {
        let mut conn = self.connection().await?;
        let reply: (i64, i64, Vec<u8>) = self
            .run(
                "CAS",
                self.cas
                    .key(key)
                    .arg(if expected.is_some() { "1" } else { "0" })
                    .arg(expected.unwrap_or_default())
                    .arg(if new.is_some() { "1" } else { "0" })
                    .arg(new.unwrap_or_default())
                    .arg(ttl.map(ttl_millis).unwrap_or(0))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(to_swap(reply))
    }

    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<Swap> {
        let mut conn = self.connection().await?;
        let reply: (i64, i64, Vec<u8>) = self
            .run(
                "CAS EXPIRE",
                self.cae
                    .key(key)
                    .arg(expected)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(to_swap(reply))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: i64 = self
            .run(
                "PEXPIRE",
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        self.run("DEL", redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64> {
        let mut conn = self.connection().await?;
        self.run(
            "PUBLISH",
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn),
        )
        .await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection closed".into()));
        }
        let mut pubsub = match tokio::time::timeout(self.timeout, self.shared.client.get_async_pubsub())
            .await
        {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => return Err(Error::ConnectionFailed(e.to_string())),
            Err(_) => return Err(Error::Timeout("subscribe".into())),
        };
        for channel in channels {
            self.run("SUBSCRIBE", pubsub.subscribe(channel.as_str()))
                .await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = pubsub.into_on_message();
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let message = Message {
                    channel: msg.get_channel_name().to_string(),
                    payload: msg.get_payload_bytes().to_vec(),
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            tracing::debug!("Pub/sub stream ended");
        });
        Ok(Subscription::with_forwarder(rx, forwarder))
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.link.lock().await.conn = None;
        self.shared.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("Disconnected from Redis/Valkey");
        Ok(())
    }
}

/// Opens a fresh [`RedisTransport`] per call
#[derive(Debug, Clone)]
pub struct RedisConnector {
    store: StoreConfig,
    timeout: Duration,
}

impl RedisConnector {
    pub fn new(store: StoreConfig, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let transport = RedisTransport::connect(&self.store, self.timeout).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("nodered:context:"), "nodered:context:*");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(50));
        assert_eq!(backoff(2), Duration::from_millis(100));
        assert_eq!(backoff(10), MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_to_swap() {
        assert_eq!(to_swap((1, 0, vec![])), Swap::Applied);
        assert_eq!(to_swap((0, 0, vec![])), Swap::Conflict { current: None });
        assert_eq!(
            to_swap((0, 1, b"hostA".to_vec())),
            Swap::Conflict {
                current: Some(b"hostA".to_vec())
            }
        );
    }

    #[tokio::test]
    async fn test_rejects_sentinel_topology() {
        let config = StoreConfig {
            sentinels: vec!["sentinel-1:26379".into()],
            sentinel_name: Some("mymaster".into()),
            ..Default::default()
        };
        let err = RedisTransport::connect(&config, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_credentials_survive_url_round_trip() {
        let store = StoreConfig {
            username: Some("ops".into()),
            password: Some("p@ss:w/rd".into()),
            db: 2,
            ..Default::default()
        };
        let client = Client::open(store.url()).unwrap();
        let info = client.get_connection_info();
        assert_eq!(info.redis.username.as_deref(), Some("ops"));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss:w/rd"));
        assert_eq!(info.redis.db, 2);
    }

    #[tokio::test]
    async fn test_reconnect_runs_without_callers_until_closed() {
        let client = Client::open("redis://127.0.0.1:1/").unwrap();
        let shared = Arc::new(Shared::new(client, None, Duration::from_millis(200)));
        let state = shared.state.subscribe();

        shared.mark_broken().await;
        assert!(shared.reconnecting.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(shared.link.lock().await.failures >= 1);
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        shared.closed.store(true, Ordering::SeqCst);
        tokio::time::sleep(MAX_BACKOFF + Duration::from_millis(500)).await;
        assert!(!shared.reconnecting.load(Ordering::SeqCst));
    }
}
