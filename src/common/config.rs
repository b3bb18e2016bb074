//! Configuration for nodered-cluster instances
//!
//! Loaded from an optional TOML file and `NRCLUSTER__*` environment
//! variables (double underscore separates nested sections, e.g.
//! `NRCLUSTER__STORE__HOST`).

use crate::common::utils::encode_userinfo;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "nodered-cluster.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "NRCLUSTER";

/// Instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Role (admin or worker)
    pub role: NodeRole,

    /// Identity override (falls back to HOSTNAME, then the OS hostname)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Remote store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Prefix for every key this instance reads or writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Compress payloads above `compression_threshold`
    #[serde(default)]
    pub enable_compression: bool,

    /// Compression threshold in bytes
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Per-operation timeout
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Channel carrying flow revision notifications
    #[serde(default = "default_update_channel")]
    pub update_channel: String,

    /// Channel carrying package manifest notifications
    #[serde(default = "default_package_channel")]
    pub package_channel: String,

    /// Admin publishes a notification after each save
    #[serde(default = "default_true")]
    pub publish_on_save: bool,

    /// Worker subscribes to revision notifications
    #[serde(default = "default_true")]
    pub subscribe_to_updates: bool,

    /// Synchronize package manifests from admin to workers
    #[serde(default)]
    pub sync_packages: bool,

    /// Sessions TTL
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Leader lease settings
    #[serde(default)]
    pub leader: LeaderConfig,

    /// Poll-and-compare fallback interval for subscribers
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_key_prefix() -> String {
    "nodered:".to_string()
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_timeout() -> u64 {
    5000
}
fn default_update_channel() -> String {
    "nodered:flows:updated".to_string()
}
fn default_package_channel() -> String {
    "nodered:packages:updated".to_string()
}
fn default_true() -> bool {
    true
}
fn default_session_ttl() -> u64 {
    86_400
}
fn default_reconcile_interval() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Admin,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Admin => write!(f, "admin"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Remote store connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Connect with TLS (`rediss://`)
    #[serde(default)]
    pub tls: bool,

    /// Sentinel endpoints (`host:port`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sentinels: Vec<String>,

    /// Sentinel master name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel_name: Option<String>,

    /// Cluster seed nodes (`host:port`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_nodes: Vec<String>,

    /// Connection attempts before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    6379
}
fn default_connect_retries() -> usize {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            username: None,
            password: None,
            tls: false,
            sentinels: Vec::new(),
            sentinel_name: None,
            cluster_nodes: Vec::new(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl StoreConfig {
    /// Connection URL for a single-node deployment; credentials are percent-encoded.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let user = self.username.as_deref().map(encode_userinfo);
        let pass = self.password.as_deref().map(encode_userinfo);
        let auth = match (user, pass) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (None, Some(pass)) => format!(":{}@", pass),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };
        format!("{}://{}{}:{}/{}", scheme, auth, self.host, self.port, self.db)
    }

    /// Is this a sentinel or cluster topology?
    pub fn is_multi_node(&self) -> bool {
        !self.sentinels.is_empty() || !self.cluster_nodes.is_empty()
    }
}

/// Leader lease settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Lock name appended to the key prefix
    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    #[serde(default = "default_lease")]
    pub lease_ms: u64,

    #[serde(default = "default_renew_interval")]
    pub renew_interval_ms: u64,
}

fn default_lock_name() -> String {
    "leader".to_string()
}
fn default_lease() -> u64 {
    10_000
}
fn default_renew_interval() -> u64 {
    3_000
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_name: default_lock_name(),
            lease_ms: default_lease(),
            renew_interval_ms: default_renew_interval(),
        }
    }
}

impl LeaderConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

impl Config {
    /// Minimal configuration for the given role, everything else defaulted.
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            identity: None,
            store: StoreConfig::default(),
            key_prefix: default_key_prefix(),
            enable_compression: false,
            compression_threshold: default_compression_threshold(),
            timeout_ms: default_timeout(),
            update_channel: default_update_channel(),
            package_channel: default_package_channel(),
            publish_on_save: true,
            subscribe_to_updates: true,
            sync_packages: false,
            session_ttl_secs: default_session_ttl(),
            leader: LeaderConfig::default(),
            reconcile_interval_ms: default_reconcile_interval(),
            log_level: default_log_level(),
        }
    }

    /// `NRCLUSTER_CONFIG`, or `nodered-cluster.toml`
    pub fn default_path() -> PathBuf {
        std::env::var(format!("{}_CONFIG", ENV_PREFIX))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load from [`Config::default_path`] plus environment.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from a specific file; the file is optional, the environment overrides it.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(path, None)
    }

    /// Like [`Config::load_from`], with `role` used when neither the file
    /// nor the environment sets one. A file that exists but does not parse
    /// is still an error.
    pub fn load_with_role(path: Option<&Path>, role: NodeRole) -> Result<Self> {
        match path {
            Some(path) => Self::build(path, Some(role)),
            None => Self::build(&Self::default_path(), Some(role)),
        }
    }

    fn build(path: &Path, default_role: Option<NodeRole>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(role) = default_role {
            builder = builder.set_default("role", role.to_string())?;
        }
        let settings = builder
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("store.sentinels")
                    .with_list_parse_key("store.cluster_nodes")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(Error::InvalidConfig("key_prefix cannot be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeout_ms must be positive".into()));
        }
        if self.reconcile_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconcile_interval_ms must be positive".into(),
            ));
        }
        if self.leader.renew_interval_ms == 0
            || self.leader.renew_interval_ms >= self.leader.lease_ms
        {
            return Err(Error::InvalidConfig(format!(
                "leader.renew_interval_ms ({}) must be positive and shorter than leader.lease_ms ({})",
                self.leader.renew_interval_ms, self.leader.lease_ms
            )));
        }
        if self.update_channel == self.package_channel {
            return Err(Error::InvalidConfig(
                "update_channel and package_channel must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Compression threshold, or `None` when compression is disabled.
    pub fn compression(&self) -> Option<usize> {
        self.enable_compression.then_some(self.compression_threshold)
    }
}
