//! Worker-side configuration reload

use super::{drive, ChangeNotification, Channels, Reactor};
use crate::common::Result;
use crate::storage::{ConfigStore, ResourceKind};
use crate::transport::{Message, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A newer revision fetched from the store
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigUpdate {
    pub kind: ResourceKind,
    pub revision: u64,
    pub body: Value,
}

/// Applies fetched configuration to the running instance.
///
/// An error leaves the instance on its last-known-good configuration; the
/// same revision is offered again on the next notification or reconcile.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    async fn reload(&self, update: ConfigUpdate) -> Result<()>;
}

pub struct ChangeSubscriber {
    name: &'static str,
    store: Arc<ConfigStore>,
    channels: Channels,
    kinds: Vec<ResourceKind>,
    handler: Arc<dyn ReloadHandler>,
    /// Last applied revision per kind; held across fetch and reload
    applied: Mutex<HashMap<ResourceKind, u64>>,
}

impl ChangeSubscriber {
    pub fn new(
        store: Arc<ConfigStore>,
        channels: Channels,
        kinds: Vec<ResourceKind>,
        handler: Arc<dyn ReloadHandler>,
    ) -> Self {
        Self {
            name: "config subscriber",
            store,
            channels,
            kinds,
            handler,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Treat these revisions as already applied, e.g. the ones the host
    /// loaded at boot. Only newer revisions trigger a reload.
    pub fn starting_at(mut self, revisions: impl IntoIterator<Item = (ResourceKind, u64)>) -> Self {
        self.applied.get_mut().extend(revisions);
        self
    }

    pub(crate) fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }

    /// Revision currently applied (0 = nothing applied yet)
    pub async fn applied_revision(&self, kind: ResourceKind) -> u64 {
        self.applied.lock().await.get(&kind).copied().unwrap_or(0)
    }

    /// React to one notification; returns whether a reload happened.
    ///
    /// Notifications for a revision already applied (or older) are ignored.
    pub async fn handle_notification(&self, kind: ResourceKind, notification: &ChangeNotification) -> Result<bool> {
        if !self.kinds.contains(&kind) {
            return Ok(false);
        }
        let mut applied = self.applied.lock().await;
        let current = applied.get(&kind).copied().unwrap_or(0);
        if notification.revision <= current {
            tracing::debug!(
                "Ignoring {} notification for revision {} (applied {})",
                kind,
                notification.revision,
                current
            );
            return Ok(false);
        }
        self.sync(kind, &mut applied).await
    }

    /// Compare every watched revision with the store and reload what changed.
    ///
    /// A revision lower than the applied one (after a purge) also reloads.
    /// Returns the number of kinds reloaded; failures are logged and retried
    /// on the next call.
    pub async fn reconcile(&self) -> usize {
        let mut reloaded = 0;
        let mut applied = self.applied.lock().await;
        for kind in &self.kinds {
            match self.sync(*kind, &mut applied).await {
                Ok(true) => reloaded += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Reconcile of {} failed, keeping current configuration: {}", kind, e),
            }
        }
        reloaded
    }

    async fn sync(&self, kind: ResourceKind, applied: &mut HashMap<ResourceKind, u64>) -> Result<bool> {
        let current = applied.get(&kind).copied().unwrap_or(0);
        let record = self.store.get(kind).await?;
        if record.revision == current {
            return Ok(false);
        }

        let revision = record.revision;
        self.handler
            .reload(ConfigUpdate {
                kind,
                revision,
                body: record.body,
            })
            .await?;
        applied.insert(kind, revision);
        tracing::info!("Reloaded {} at revision {} (was {})", kind, revision, current);
        Ok(true)
    }

    /// Run the subscription loop until `shutdown` is cancelled
    pub fn start(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        reconcile_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(drive(self, transport, reconcile_interval, shutdown))
    }
}

#[async_trait]
impl Reactor for ChangeSubscriber {
    fn name(&self) -> &'static str {
        self.name
    }

    fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.kinds.iter().map(|k| self.channels.channel(*k)).collect();
        channels.dedup();
        channels
    }

    async fn on_message(&self, message: Message) {
        let notification = match ChangeNotification::from_bytes(&message.payload) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Malformed notification on {}: {}", message.channel, e);
                return;
            }
        };
        let Some(kind) = notification
            .resource_kind
            .or_else(|| self.channels.kind_of(&message.channel))
        else {
            tracing::debug!("Notification on unknown channel {}", message.channel);
            return;
        };
        if let Err(e) = self.handle_notification(kind, &notification).await {
            tracing::warn!(
                "Reload of {} revision {} failed, keeping current configuration: {}",
                kind,
                notification.revision,
                e
            );
        }
    }

    async fn reconcile(&self) {
        ChangeSubscriber::reconcile(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, KeyCodec, ValueCodec};
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub updates: std::sync::Mutex<Vec<ConfigUpdate>>,
        pub failing: AtomicBool,
    }

    #[async_trait]
    impl ReloadHandler for Recorder {
        async fn reload(&self, update: ConfigUpdate) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Reload("flows rejected".into()));
            }
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    fn setup() -> (Arc<ConfigStore>, Arc<Recorder>, ChangeSubscriber) {
        let store = Arc::new(ConfigStore::new(
            Arc::new(MemoryTransport::new()),
            KeyCodec::new("nodered:"),
            ValueCodec::plain(),
        ));
        let recorder = Arc::new(Recorder::default());
        let subscriber = ChangeSubscriber::new(
            store.clone(),
            Channels::new("nodered:", "nodered:flows:updated", "nodered:packages:updated"),
            vec![ResourceKind::Flows, ResourceKind::Settings],
            recorder.clone(),
        );
        (store, recorder, subscriber)
    }

    #[tokio::test]
    async fn test_newer_revision_reloads_once() {
        let (store, recorder, subscriber) = setup();
        let revision = store.save(ResourceKind::Flows, &json!([{"id": "n1"}])).await.unwrap();
        let n = ChangeNotification::new(ResourceKind::Flows, revision, "admin");

        assert!(subscriber.handle_notification(ResourceKind::Flows, &n).await.unwrap());
        assert!(!subscriber.handle_notification(ResourceKind::Flows, &n).await.unwrap());

        let updates = recorder.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].revision, 1);
        assert_eq!(updates[0].body, json!([{"id": "n1"}]));
    }

    #[tokio::test]
    async fn test_stale_notification_is_ignored() {
        let (store, recorder, subscriber) = setup();
        store.save(ResourceKind::Flows, &json!([1])).await.unwrap();
        store.save(ResourceKind::Flows, &json!([2])).await.unwrap();
        subscriber.reconcile().await;

        let old = ChangeNotification::new(ResourceKind::Flows, 1, "admin");
        assert!(!subscriber.handle_notification(ResourceKind::Flows, &old).await.unwrap());
        assert_eq!(recorder.updates.lock().unwrap().len(), 1);
        assert_eq!(subscriber.applied_revision(ResourceKind::Flows).await, 2);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_last_good_revision() {
        let (store, recorder, subscriber) = setup();
        store.save(ResourceKind::Flows, &json!([1])).await.unwrap();
        assert_eq!(subscriber.reconcile().await, 1);

        recorder.failing.store(true, Ordering::SeqCst);
        let revision = store.save(ResourceKind::Flows, &json!([2])).await.unwrap();
        let n = ChangeNotification::new(ResourceKind::Flows, revision, "admin");
        assert!(subscriber.handle_notification(ResourceKind::Flows, &n).await.is_err());
        assert_eq!(subscriber.applied_revision(ResourceKind::Flows).await, 1);

        recorder.failing.store(false, Ordering::SeqCst);
        assert_eq!(subscriber.reconcile().await, 1);
        assert_eq!(subscriber.applied_revision(ResourceKind::Flows).await, 2);
    }

    #[tokio::test]
    async fn test_unwatched_kind_is_ignored() {
        let (store, recorder, subscriber) = setup();
        let revision = store.save(ResourceKind::Credentials, &json!({"a": 1})).await.unwrap();
        let n = ChangeNotification::new(ResourceKind::Credentials, revision, "admin");
        assert!(!subscriber.handle_notification(ResourceKind::Credentials, &n).await.unwrap());
        assert!(recorder.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_is_picked_up_by_reconcile() {
        let (store, recorder, subscriber) = setup();
        store.save(ResourceKind::Settings, &json!({"a": 1})).await.unwrap();
        subscriber.reconcile().await;
        store.purge(ResourceKind::Settings).await.unwrap();
        assert_eq!(subscriber.reconcile().await, 1);

        let updates = recorder.updates.lock().unwrap();
        assert_eq!(updates.last().unwrap().revision, 0);
        assert_eq!(updates.last().unwrap().body, json!({}));
    }

    #[tokio::test]
    async fn test_seeded_revision_is_not_reloaded() {
        let (store, recorder, subscriber) = setup();
        store.save(ResourceKind::Flows, &json!([1])).await.unwrap();
        let subscriber = subscriber.starting_at([(ResourceKind::Flows, 1)]);
        assert_eq!(subscriber.reconcile().await, 0);

        let revision = store.save(ResourceKind::Flows, &json!([2])).await.unwrap();
        let n = ChangeNotification::new(ResourceKind::Flows, revision, "admin");
        assert!(subscriber.handle_notification(ResourceKind::Flows, &n).await.unwrap());
        assert_eq!(recorder.updates.lock().unwrap().len(), 1);
        assert_eq!(recorder.updates.lock().unwrap()[0].revision, 2);
    }

    #[test]
    fn test_channels_are_deduplicated() {
        let (_, _, subscriber) = setup();
        assert_eq!(
            subscriber.channels(),
            vec!["nodered:flows:updated".to_string(), "nodered:settings:updated".to_string()]
        );
    }
}
