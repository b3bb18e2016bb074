//! Per-instance lifecycle
//!
//! A [`ClusterNode`] owns its store connections and background tasks:
//!
//! - admin: leadership keeper, publisher; edits are refused unless this
//!   instance holds the lease
//! - worker: configuration subscriber and, optionally, package subscriber
//!
//! Everything started by `open` is stopped by `close`.

use crate::bus::{ChangePublisher, ChangeSubscriber, Channels, PackageInstaller, PackageSubscriber, ReloadHandler};
use crate::common::{resolve_identity, Config, Error, KeyCodec, NodeRole, Result, ValueCodec};
use crate::context::ContextStore;
use crate::coordinator::{start_leadership_tasks, LeaderLock, LeaderRole, Leadership};
use crate::storage::{ConfigStore, Library, LibraryListing, ProjectMetadata, ResourceKind, Versioned};
use crate::transport::{Connector, Transport};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Resources a worker reloads when they change
const WATCHED_KINDS: [ResourceKind; 3] = [
    ResourceKind::Flows,
    ResourceKind::Credentials,
    ResourceKind::Settings,
];

/// Result of a leader-side save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub revision: u64,
    /// A change notification was published
    pub notified: bool,
    /// Non-fatal problem, e.g. the notification could not be published
    pub warning: Option<String>,
}

pub struct ClusterNodeBuilder {
    config: Config,
    reload_handler: Option<Arc<dyn ReloadHandler>>,
    package_installer: Option<Arc<dyn PackageInstaller>>,
    initial_revisions: HashMap<ResourceKind, u64>,
}

impl ClusterNodeBuilder {
    /// Required for workers that subscribe to updates
    pub fn reload_handler(mut self, handler: Arc<dyn ReloadHandler>) -> Self {
        self.reload_handler = Some(handler);
        self
    }

    /// Required for workers with `sync_packages`
    pub fn package_installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.package_installer = Some(installer);
        self
    }

    /// Revisions the host already runs. Watched kinds not listed here start
    /// from the revision stored when the node opens.
    pub fn initial_revisions(mut self, revisions: impl IntoIterator<Item = (ResourceKind, u64)>) -> Self {
        self.initial_revisions.extend(revisions);
        self
    }

    pub async fn open(self, connector: &dyn Connector) -> Result<ClusterNode> {
        let config = self.config;
        config.validate()?;
        if config.role == NodeRole::Worker {
            if config.subscribe_to_updates && self.reload_handler.is_none() {
                return Err(Error::InvalidConfig(
                    "a worker subscribing to updates needs a reload handler".into(),
                ));
            }
            if config.sync_packages && self.package_installer.is_none() {
                return Err(Error::InvalidConfig("sync_packages needs a package installer".into()));
            }
        }

        let identity = resolve_identity(config.identity.as_deref());
        let keys = KeyCodec::new(config.key_prefix.clone());
        let codec = ValueCodec::with_threshold(config.compression());
        let lock_key = keys.singleton(&config.leader.lock_name);
        let channels = Channels::from_config(&config);

        let transport = connector.connect().await?;
        let store = Arc::new(
            ConfigStore::new(transport.clone(), keys.clone(), codec).with_session_ttl(config.session_ttl()),
        );
        let library = Library::new(transport.clone(), keys.clone(), codec);
        let context = Arc::new(ContextStore::open(connector, keys, codec).await?);

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut leadership = None;
        let mut publisher = None;

        match config.role {
            NodeRole::Admin => {
                let keeper = Arc::new(Leadership::new(
                    LeaderLock::new(transport.clone()),
                    lock_key.clone(),
                    identity.clone(),
                    config.leader.lease(),
                    config.leader.renew_interval(),
                ));
                keeper.step().await;
                tasks.push(start_leadership_tasks(
                    keeper.clone(),
                    transport.connection_state(),
                    shutdown.child_token(),
                ));
                leadership = Some(keeper);

                if config.publish_on_save {
                    publisher = Some(ChangePublisher::new(transport.clone(), channels, identity.clone()));
                }
            }
            NodeRole::Worker => {
                if let (true, Some(handler)) = (config.subscribe_to_updates, self.reload_handler) {
                    let mut seeds = self.initial_revisions;
                    let unseeded: Vec<ResourceKind> =
                        WATCHED_KINDS.into_iter().filter(|k| !seeds.contains_key(k)).collect();
                    for kind in unseeded {
                        let revision = store.revision(kind).await?;
                        seeds.insert(kind, revision);
                    }
                    tracing::debug!("Worker starts from revisions {:?}", seeds);
                    let subscriber = Arc::new(
                        ChangeSubscriber::new(store.clone(), channels.clone(), WATCHED_KINDS.to_vec(), handler)
                            .starting_at(seeds),
                    );
                    tasks.push(subscriber.start(
                        transport.clone(),
                        config.reconcile_interval(),
                        shutdown.child_token(),
                    ));
                }
                if let (true, Some(installer)) = (config.sync_packages, self.package_installer) {
                    let packages = PackageSubscriber::open(store.clone(), channels, installer).await?;
                    tasks.push(packages.start(
                        transport.clone(),
                        config.reconcile_interval(),
                        shutdown.child_token(),
                    ));
                }
            }
        }

        tracing::info!(
            "Cluster node {} opened as {} (prefix {})",
            identity,
            config.role,
            config.key_prefix
        );

        Ok(ClusterNode {
            config,
            identity,
            lock_key,
            transport,
            store,
            library,
            context,
            leadership,
            publisher,
            shutdown,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct ClusterNode {
    config: Config,
    identity: String,
    lock_key: String,
    transport: Arc<dyn Transport>,
    store: Arc<ConfigStore>,
    library: Library,
    context: Arc<ContextStore>,
    leadership: Option<Arc<Leadership>>,
    publisher: Option<ChangePublisher>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClusterNode {
    pub fn builder(config: Config) -> ClusterNodeBuilder {
        ClusterNodeBuilder {
            config,
            reload_handler: None,
            package_installer: None,
            initial_revisions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Leadership keeper (admins only)
    pub fn leadership(&self) -> Option<&Arc<Leadership>> {
        self.leadership.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.leadership
            .as_ref()
            .is_some_and(|l| l.role() == LeaderRole::Leader)
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub async fn current_leader(&self) -> Result<Option<String>> {
        LeaderLock::new(self.transport.clone())
            .current_holder(&self.lock_key)
            .await
    }

    pub async fn get_flows(&self) -> Result<Versioned<Value>> {
        self.store.get(ResourceKind::Flows).await
    }

    pub async fn save_flows(&self, flows: &Value) -> Result<SaveOutcome> {
        self.save(ResourceKind::Flows, flows).await
    }

    pub async fn get_credentials(&self) -> Result<Versioned<Value>> {
        self.store.get(ResourceKind::Credentials).await
    }

    pub async fn save_credentials(&self, credentials: &Value) -> Result<SaveOutcome> {
        self.save(ResourceKind::Credentials, credentials).await
    }

    pub async fn get_settings(&self) -> Result<Versioned<Value>> {
        self.store.get(ResourceKind::Settings).await
    }

    pub async fn save_settings(&self, settings: &Value) -> Result<SaveOutcome> {
        self.save(ResourceKind::Settings, settings).await
    }

    pub async fn get_sessions(&self) -> Result<Versioned<Value>> {
        self.store.get(ResourceKind::Sessions).await
    }

    pub async fn save_sessions(&self, sessions: &Value) -> Result<SaveOutcome> {
        self.save(ResourceKind::Sessions, sessions).await
    }

    /// Publish a new package manifest to workers
    pub async fn save_packages(&self, manifest: &Value) -> Result<SaveOutcome> {
        self.save(ResourceKind::Packages, manifest).await
    }

    pub async fn get_project(&self) -> Result<Option<ProjectMetadata>> {
        self.store.get_project().await
    }

    /// Record the project the admin editor has open
    pub async fn save_project(&self, project: &ProjectMetadata) -> Result<SaveOutcome> {
        self.save(ResourceKind::Project, &serde_json::to_value(project)?).await
    }

    pub async fn get_library_entry(&self, entry_type: &str, path: &str) -> Result<LibraryListing> {
        self.library.get_entry(entry_type, path).await
    }

    pub async fn save_library_entry(
        &self,
        entry_type: &str,
        path: &str,
        meta: Map<String, Value>,
        body: impl Into<String>,
    ) -> Result<u64> {
        self.ensure_leader().await?;
        self.library.save_entry(entry_type, path, meta, body).await
    }

    async fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }
        let holder = match self.current_leader().await {
            Ok(Some(holder)) => holder,
            Ok(None) => "none".to_string(),
            Err(e) => format!("unknown ({})", e),
        };
        Err(Error::NotLeader(holder))
    }

    async fn save(&self, kind: ResourceKind, body: &Value) -> Result<SaveOutcome> {
        self.ensure_leader().await?;
        let revision = self.store.save(kind, body).await?;

        let Some(publisher) = &self.publisher else {
            return Ok(SaveOutcome {
                revision,
                notified: false,
                warning: None,
            });
        };
        match publisher.publish(kind, revision).await {
            Ok(_) => Ok(SaveOutcome {
                revision,
                notified: true,
                warning: None,
            }),
            Err(e) => {
                tracing::warn!("Saved {} revision {} but could not notify workers: {}", kind, revision, e);
                Ok(SaveOutcome {
                    revision,
                    notified: false,
                    warning: Some(format!("change notification failed: {}", e)),
                })
            }
        }
    }

    /// Stop background tasks, release the lease if held and close connections.
    ///
    /// Every step is bounded by the configured timeout; later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let timeout = self.config.timeout();
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::warn!("Background task did not stop within {:?}, aborting", timeout);
                abort.abort();
            }
        }

        if let Some(leadership) = &self.leadership {
            match bounded(timeout, leadership.resign()).await {
                Ok(result) => tracing::debug!("Lease release on close: {:?}", result),
                Err(e) => tracing::warn!("Could not release {} on close: {}", self.lock_key, e),
            }
        }

        if let Err(e) = bounded(timeout, self.context.close()).await {
            tracing::warn!("Closing context connection failed: {}", e);
        }
        bounded(timeout, self.transport.close()).await?;
        tracing::info!("Cluster node {} closed", self.identity);
        Ok(())
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bounded<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout(format!("gave up after {:?}", timeout)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ConfigUpdate;
    use crate::transport::MemoryBackend;
    use serde_json::json;

    struct Ignore;

    #[async_trait::async_trait]
    impl ReloadHandler for Ignore {
        async fn reload(&self, _: ConfigUpdate) -> Result<()> {
            Ok(())
        }
    }

    fn config(role: NodeRole, identity: &str) -> Config {
        let mut config = Config::new(role);
        config.identity = Some(identity.to_string());
        config
    }

    #[tokio::test]
    async fn test_admin_is_leader_after_open() {
        let backend = MemoryBackend::new();
        let node = ClusterNode::builder(config(NodeRole::Admin, "admin-1"))
            .open(&backend)
            .await
            .unwrap();
        assert!(node.is_leader());
        assert_eq!(node.lock_key(), "nodered:leader");
        assert_eq!(node.current_leader().await.unwrap().as_deref(), Some("admin-1"));

        let outcome = node.save_flows(&json!([{"id": "f1"}])).await.unwrap();
        assert_eq!(outcome.revision, 1);
        assert!(outcome.notified);
        assert_eq!(node.get_flows().await.unwrap().body, json!([{"id": "f1"}]));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_cannot_edit() {
        let backend = MemoryBackend::new();
        let admin = ClusterNode::builder(config(NodeRole::Admin, "admin-1"))
            .open(&backend)
            .await
            .unwrap();
        let worker = ClusterNode::builder(config(NodeRole::Worker, "worker-1"))
            .reload_handler(Arc::new(Ignore))
            .open(&backend)
            .await
            .unwrap();

        let err = worker.save_settings(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(ref holder) if holder == "admin-1"));
        let err = worker
            .save_library_entry("functions", "a.js", Map::new(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader(_)));
        let err = worker.save_project(&ProjectMetadata::new("p")).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(_)));

        admin.save_project(&ProjectMetadata::new("line-3")).await.unwrap();
        assert_eq!(worker.get_project().await.unwrap().unwrap().name, "line-3");

        worker.close().await.unwrap();
        admin.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_without_handler_is_rejected() {
        let backend = MemoryBackend::new();
        let result = ClusterNode::builder(config(NodeRole::Worker, "w")).open(&backend).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let mut quiet = config(NodeRole::Worker, "w");
        quiet.subscribe_to_updates = false;
        quiet.sync_packages = true;
        let result = ClusterNode::builder(quiet).open(&backend).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_save() {
        let backend = MemoryBackend::new();
        let node = ClusterNode::builder(config(NodeRole::Admin, "admin-1"))
            .open(&backend)
            .await
            .unwrap();
        backend.set_reject_publish(true);

        let outcome = node.save_settings(&json!({"theme": "dark"})).await.unwrap();
        assert_eq!(outcome.revision, 1);
        assert!(!outcome.notified);
        assert!(outcome.warning.unwrap().contains("notification failed"));
        assert_eq!(node.get_settings().await.unwrap().body, json!({"theme": "dark"}));
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_disabled() {
        let backend = MemoryBackend::new();
        let mut config = config(NodeRole::Admin, "admin-1");
        config.publish_on_save = false;
        let node = ClusterNode::builder(config).open(&backend).await.unwrap();
        let outcome = node.save_flows(&json!([])).await.unwrap();
        assert_eq!(
            outcome,
            SaveOutcome {
                revision: 1,
                notified: false,
                warning: None
            }
        );
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_lease_and_is_idempotent() {
        let backend = MemoryBackend::new();
        let node = ClusterNode::builder(config(NodeRole::Admin, "admin-1"))
            .open(&backend)
            .await
            .unwrap();
        node.close().await.unwrap();
        node.close().await.unwrap();
        assert_eq!(backend.raw_get("nodered:leader"), None);
        assert!(!node.is_leader());
    }
}
