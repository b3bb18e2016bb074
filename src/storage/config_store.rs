//! Singleton configuration resources
//!
//! Stores:
//! - flows, credentials, settings (no expiry)
//! - sessions (expire after the configured TTL)
//! - the package manifest used by package synchronization
//! - the admin's active project
//!
//! Revisions come from a per-kind counter, `{prefix}{kind}:rev`, that is
//! never deleted: a purge or an expired sessions record does not make the
//! next save reuse an old revision.
//!
//! The store never checks who is writing: workers read it directly and the
//! leader-aware front end decides who may save.

use super::{read_versioned, write_versioned, ResourceKind, Versioned};
use crate::common::{timestamp_now_millis, KeyCodec, Result, ValueCodec};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Project the admin editor has open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub name: String,
    /// Milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
}

impl ProjectMetadata {
    /// Metadata stamped with the current time
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            updated: Some(timestamp_now_millis()),
        }
    }
}

pub struct ConfigStore {
    transport: Arc<dyn Transport>,
    keys: KeyCodec,
    codec: ValueCodec,
    session_ttl: Option<Duration>,
}

impl ConfigStore {
    pub fn new(transport: Arc<dyn Transport>, keys: KeyCodec, codec: ValueCodec) -> Self {
        Self {
            transport,
            keys,
            codec,
            session_ttl: None,
        }
    }

    /// Expire the sessions record this long after each save
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    /// `{prefix}{kind}`
    pub fn key(&self, kind: ResourceKind) -> String {
        self.keys.singleton(kind.as_str())
    }

    /// `{prefix}{kind}:rev`
    pub fn revision_key(&self, kind: ResourceKind) -> String {
        self.keys.singleton(&format!("{}:rev", kind.as_str()))
    }

    /// Current body and revision; a resource never saved reads as its default body at revision 0.
    pub async fn get(&self, kind: ResourceKind) -> Result<Versioned<Value>> {
        let record = read_versioned(self.transport.as_ref(), &self.codec, &self.key(kind)).await?;
        Ok(record.unwrap_or_else(|| Versioned::initial(kind.default_body())))
    }

    pub async fn revision(&self, kind: ResourceKind) -> Result<u64> {
        Ok(self.get(kind).await?.revision)
    }

    /// Persist `body` as the next revision.
    pub async fn save(&self, kind: ResourceKind, body: &Value) -> Result<u64> {
        let ttl = match kind {
            ResourceKind::Sessions => self.session_ttl,
            _ => None,
        };
        let revision = write_versioned(
            self.transport.as_ref(),
            &self.codec,
            &self.key(kind),
            Some(&self.revision_key(kind)),
            body,
            ttl,
        )
        .await?;
        tracing::info!("Saved {} (revision {})", kind, revision);
        Ok(revision)
    }

    /// Active project, if one was ever saved
    pub async fn get_project(&self) -> Result<Option<ProjectMetadata>> {
        let record = self.get(ResourceKind::Project).await?;
        if record.revision == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(record.body)?))
    }

    pub async fn save_project(&self, project: &ProjectMetadata) -> Result<u64> {
        self.save(ResourceKind::Project, &serde_json::to_value(project)?).await
    }

    /// Push the sessions expiry out by the TTL without rewriting them
    pub async fn touch_sessions(&self) -> Result<bool> {
        match self.session_ttl {
            Some(ttl) => self.transport.expire(&self.key(ResourceKind::Sessions), ttl).await,
            None => Ok(false),
        }
    }

    /// Administrative delete. Reads return the default body at revision 0
    /// until the next save, which continues from the last revision;
    /// subscribers pick the delete up on their next reconcile.
    pub async fn purge(&self, kind: ResourceKind) -> Result<bool> {
        let removed = self.transport.delete(&[self.key(kind)]).await? > 0;
        if removed {
            tracing::warn!("Purged {}", kind);
        }
        Ok(removed)
    }

    /// Administrative reset: replace the body with the default one.
    ///
    /// The revision keeps increasing so workers still observe the change.
    pub async fn reset(&self, kind: ResourceKind) -> Result<u64> {
        self.save(kind, &kind.default_body()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn store(transport: Arc<MemoryTransport>) -> ConfigStore {
        ConfigStore::new(transport, KeyCodec::new("nodered:"), ValueCodec::compressed(1024))
    }

    #[tokio::test]
    async fn test_missing_resource_reads_default() {
        let store = store(Arc::new(MemoryTransport::new()));
        let flows = store.get(ResourceKind::Flows).await.unwrap();
        assert_eq!(flows.revision, 0);
        assert_eq!(flows.body, json!([]));
        assert_eq!(store.get(ResourceKind::Credentials).await.unwrap().body, json!({}));
    }

    #[tokio::test]
    async fn test_save_then_get_each_revision() {
        let store = store(Arc::new(MemoryTransport::new()));
        let mut last = 0;
        for i in 0..5 {
            let body = json!({ "nodes": [{ "id": format!("n{}", i), "type": "inject" }] });
            let revision = store.save(ResourceKind::Flows, &body).await.unwrap();
            assert!(revision > last);
            last = revision;

            let read = store.get(ResourceKind::Flows).await.unwrap();
            assert_eq!(read.body, body);
            assert_eq!(read.revision, revision);
        }
    }

    #[tokio::test]
    async fn test_large_flows_are_compressed_in_store() {
        let transport = Arc::new(MemoryTransport::new());
        let store = store(transport.clone());
        let nodes: Vec<Value> = (0..200)
            .map(|i| json!({ "id": format!("node-{}", i), "type": "function", "func": "return msg;" }))
            .collect();
        let body = json!(nodes);
        store.save(ResourceKind::Flows, &body).await.unwrap();

        let raw = transport.get("nodered:flows").await.unwrap().unwrap();
        assert!(crate::common::codec::is_compressed(&raw));
        assert_eq!(store.get(ResourceKind::Flows).await.unwrap().body, body);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_expire() {
        let store = store(Arc::new(MemoryTransport::new()))
            .with_session_ttl(Duration::from_secs(60));
        store
            .save(ResourceKind::Sessions, &json!({"token": {"user": "admin"}}))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.revision(ResourceKind::Sessions).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_returns_to_default() {
        let store = store(Arc::new(MemoryTransport::new()));
        store.save(ResourceKind::Credentials, &json!({"n1": {"user": "u"}})).await.unwrap();
        assert!(store.purge(ResourceKind::Credentials).await.unwrap());
        assert!(!store.purge(ResourceKind::Credentials).await.unwrap());
        let read = store.get(ResourceKind::Credentials).await.unwrap();
        assert_eq!((read.revision, read.body), (0, json!({})));
    }

    #[tokio::test]
    async fn test_revision_keeps_increasing_after_purge() {
        let transport = Arc::new(MemoryTransport::new());
        let store = store(transport.clone());
        store.save(ResourceKind::Flows, &json!([1])).await.unwrap();
        store.save(ResourceKind::Flows, &json!([2])).await.unwrap();
        store.purge(ResourceKind::Flows).await.unwrap();
        assert_eq!(store.revision(ResourceKind::Flows).await.unwrap(), 0);

        let revision = store.save(ResourceKind::Flows, &json!([3])).await.unwrap();
        assert_eq!(revision, 3);
        assert_eq!(transport.get("nodered:flows:rev").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_revision_keeps_increasing_after_sessions_expire() {
        let store = store(Arc::new(MemoryTransport::new()))
            .with_session_ttl(Duration::from_secs(60));
        store.save(ResourceKind::Sessions, &json!({"a": 1})).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let revision = store.save(ResourceKind::Sessions, &json!({"b": 1})).await.unwrap();
        assert_eq!(revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_extends_sessions() {
        let store = store(Arc::new(MemoryTransport::new()))
            .with_session_ttl(Duration::from_secs(60));
        assert!(!store.touch_sessions().await.unwrap());
        store.save(ResourceKind::Sessions, &json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(store.touch_sessions().await.unwrap());
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(store.revision(ResourceKind::Sessions).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_project_metadata() {
        let transport = Arc::new(MemoryTransport::new());
        let store = store(transport.clone());
        assert_eq!(store.get_project().await.unwrap(), None);

        let project = ProjectMetadata {
            name: "line-3".into(),
            updated: Some(1_700_000_000_000),
        };
        assert_eq!(store.save_project(&project).await.unwrap(), 1);
        assert_eq!(store.get_project().await.unwrap(), Some(project));

        let raw = transport.get("nodered:project").await.unwrap().unwrap();
        let record: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record["body"], json!({"name": "line-3", "updated": 1_700_000_000_000i64}));

        store.save_project(&ProjectMetadata::new("line-4")).await.unwrap();
        let current = store.get_project().await.unwrap().unwrap();
        assert_eq!(current.name, "line-4");
        assert!(current.updated.is_some());
    }

    #[tokio::test]
    async fn test_reset_keeps_revision_increasing() {
        let store = store(Arc::new(MemoryTransport::new()));
        store.save(ResourceKind::Settings, &json!({"theme": "dark"})).await.unwrap();
        let revision = store.reset(ResourceKind::Settings).await.unwrap();
        assert_eq!(revision, 2);
        assert_eq!(store.get(ResourceKind::Settings).await.unwrap().body, json!({}));
    }
}
