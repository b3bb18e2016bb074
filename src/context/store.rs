//! Scoped context storage
//!
//! Each top-level key of a scope is one store key,
//! `{prefix}context:{scope}:{key}`, holding the encoded JSON value. Nested
//! writes rewrite that value with a compare-and-swap retry loop so
//! concurrent writers to sibling leaves never lose each other's updates.

use super::path::{get_in, remove_in, set_in, PropertyPath};
use crate::common::{Error, KeyCodec, Result, ValueCodec};
use crate::transport::{Connector, Swap, Transport};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Scope shared by every flow
pub const GLOBAL_SCOPE: &str = "global";

const MAX_UPDATE_ATTEMPTS: usize = 16;

pub struct ContextStore {
    transport: Arc<dyn Transport>,
    keys: KeyCodec,
    codec: ValueCodec,
}

impl ContextStore {
    pub fn new(transport: Arc<dyn Transport>, keys: KeyCodec, codec: ValueCodec) -> Self {
        Self {
            transport,
            keys,
            codec,
        }
    }

    /// Open a context store on its own connection
    pub async fn open(connector: &dyn Connector, keys: KeyCodec, codec: ValueCodec) -> Result<Self> {
        let transport = connector.connect().await?;
        tracing::info!("Context store opened (prefix {})", keys.prefix());
        Ok(Self::new(transport, keys, codec))
    }

    /// Close the underlying connection
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    pub async fn get(&self, scope: &str, path: &str) -> Result<Option<Value>> {
        let path = PropertyPath::parse(path)?;
        let key = self.keys.context(scope, path.top())?;
        let Some(bytes) = self.transport.get(&key).await? else {
            return Ok(None);
        };
        let value: Value = self.codec.decode(&bytes)?;
        Ok(get_in(&value, path.rest()).cloned())
    }

    /// Several paths of one scope, in order
    pub async fn get_many<S: AsRef<str>>(&self, scope: &str, paths: &[S]) -> Result<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            values.push(self.get(scope, path.as_ref()).await?);
        }
        Ok(values)
    }

    /// Write `value` at `path`; `None` removes the field.
    pub async fn set(&self, scope: &str, path: &str, value: Option<Value>) -> Result<()> {
        let path = PropertyPath::parse(path)?;
        let key = self.keys.context(scope, path.top())?;

        if !path.is_nested() {
            match value {
                Some(value) => {
                    let encoded = self.codec.encode(&value)?;
                    self.transport.set(&key, encoded, None).await?;
                }
                None => {
                    self.transport.delete(&[key]).await?;
                }
            }
            return Ok(());
        }

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self.transport.get(&key).await?;
            let mut root: Value = match &current {
                Some(bytes) => self.codec.decode(bytes)?,
                None if value.is_none() => return Ok(()),
                None => Value::Object(Map::new()),
            };
            match &value {
                Some(value) => set_in(&mut root, path.rest(), value.clone())?,
                None => {
                    if !remove_in(&mut root, path.rest()) {
                        return Ok(());
                    }
                }
            }

            let encoded = self.codec.encode(&root)?;
            match self
                .transport
                .compare_and_swap(&key, current.as_deref(), Some(encoded), None)
                .await?
            {
                Swap::Applied => return Ok(()),
                Swap::Conflict { .. } => {
                    tracing::debug!("Concurrent update on {} (attempt {}), retrying", key, attempt);
                }
            }
        }
        Err(Error::Conflict(key))
    }

    /// Top-level keys stored under `scope`, sorted
    pub async fn keys(&self, scope: &str) -> Result<Vec<String>> {
        let prefix = self.keys.context_scope_prefix(scope);
        Ok(self
            .transport
            .scan_prefix(&prefix)
            .await?
            .iter()
            .filter_map(|key| self.keys.parse_context(key))
            .filter(|(s, _)| s == scope)
            .map(|(_, name)| name)
            .collect())
    }

    /// Remove every key of `scope`
    pub async fn delete(&self, scope: &str) -> Result<()> {
        let keys = self
            .transport
            .scan_prefix(&self.keys.context_scope_prefix(scope))
            .await?;
        let removed = self.transport.delete(&keys).await?;
        tracing::debug!("Deleted context scope {} ({} keys)", scope, removed);
        Ok(())
    }

    /// Remove the scopes of nodes and flows that are no longer deployed.
    ///
    /// A scope survives when it is global or when its leading id (the text
    /// before the first `:`) is in `active_ids`. Returns the number of keys
    /// removed.
    pub async fn clean<S: AsRef<str>>(&self, active_ids: &[S]) -> Result<u64> {
        let active: BTreeSet<&str> = active_ids.iter().map(AsRef::as_ref).collect();
        let stale: Vec<String> = self
            .transport
            .scan_prefix(&self.keys.context_prefix())
            .await?
            .into_iter()
            .filter(|key| match self.keys.parse_context(key) {
                Some((scope, _)) => {
                    let id = scope.split(':').next().unwrap_or_default();
                    scope != GLOBAL_SCOPE && !active.contains(id)
                }
                None => false,
            })
            .collect();

        let removed = self.transport.delete(&stale).await?;
        if removed > 0 {
            tracing::info!("Cleaned {} context keys of removed nodes", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBackend, MemoryTransport};
    use serde_json::json;

    fn store() -> ContextStore {
        ContextStore::new(
            Arc::new(MemoryTransport::new()),
            KeyCodec::new("nodered:"),
            ValueCodec::compressed(1024),
        )
    }

    #[tokio::test]
    async fn test_top_level_round_trip() {
        let store = store();
        store.set("global", "count", Some(json!(3))).await.unwrap();
        store
            .set("global", "user", Some(json!({"name": "ada", "tags": ["a", "b"]})))
            .await
            .unwrap();
        assert_eq!(store.get("global", "count").await.unwrap(), Some(json!(3)));
        assert_eq!(
            store.get("global", "user.tags[1]").await.unwrap(),
            Some(json!("b"))
        );
        assert_eq!(store.get("global", "missing").await.unwrap(), None);

        store.set("global", "count", None).await.unwrap();
        assert_eq!(store.get("global", "count").await.unwrap(), None);
        assert_eq!(store.keys("global").await.unwrap(), vec!["user"]);
    }

    #[tokio::test]
    async fn test_nested_set_keeps_siblings() {
        let store = store();
        store.set("flow-1", "cfg.a.x", Some(json!(1))).await.unwrap();
        store.set("flow-1", "cfg.a.y", Some(json!(2))).await.unwrap();
        store.set("flow-1", "cfg.b", Some(json!("b"))).await.unwrap();
        assert_eq!(
            store.get("flow-1", "cfg").await.unwrap(),
            Some(json!({"a": {"x": 1, "y": 2}, "b": "b"}))
        );

        store.set("flow-1", "cfg.a.x", None).await.unwrap();
        assert_eq!(
            store.get("flow-1", "cfg").await.unwrap(),
            Some(json!({"a": {"y": 2}, "b": "b"}))
        );

        // removing below a missing key creates nothing
        store.set("flow-1", "other.deep", None).await.unwrap();
        assert_eq!(store.keys("flow-1").await.unwrap(), vec!["cfg"]);
    }

    #[tokio::test]
    async fn test_get_many() {
        let store = store();
        store.set("global", "a", Some(json!(1))).await.unwrap();
        let values = store.get_many("global", &["a", "b"]).await.unwrap();
        assert_eq!(values, vec![Some(json!(1)), None]);
    }

    #[tokio::test]
    async fn test_concurrent_nested_writes() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set("global", &format!("stats.n{}", i), Some(json!(i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let stats = store.get("global", "stats").await.unwrap().unwrap();
        assert_eq!(stats.as_object().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_delete_scope_only_touches_that_scope() {
        let store = store();
        store.set("n1:f1", "a", Some(json!(1))).await.unwrap();
        store.set("n1:f1", "b", Some(json!(2))).await.unwrap();
        store.set("n1", "a", Some(json!(3))).await.unwrap();

        store.delete("n1:f1").await.unwrap();
        assert!(store.keys("n1:f1").await.unwrap().is_empty());
        assert_eq!(store.get("n1", "a").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_clean_removes_inactive_scopes() {
        let store = store();
        store.set("global", "g", Some(json!(1))).await.unwrap();
        store.set("f1", "x", Some(json!(1))).await.unwrap();
        store.set("n1:f1", "x", Some(json!(1))).await.unwrap();
        store.set("n2:f1", "x", Some(json!(1))).await.unwrap();
        store.set("f2", "x", Some(json!(1))).await.unwrap();

        let removed = store.clean(&["f1", "n1"]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.keys("global").await.unwrap(), vec!["g"]);
        assert_eq!(store.keys("f1").await.unwrap(), vec!["x"]);
        assert_eq!(store.keys("n1:f1").await.unwrap(), vec!["x"]);
        assert!(store.keys("n2:f1").await.unwrap().is_empty());
        assert!(store.keys("f2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compressed_value_survives_threshold_change() {
        let backend = MemoryBackend::new();
        let keys = KeyCodec::new("nodered:");
        let writer = ContextStore::open(&backend, keys.clone(), ValueCodec::compressed(1024))
            .await
            .unwrap();
        let text = "0123456789".repeat(200);
        writer.set("global", "blob", Some(json!(text))).await.unwrap();

        let raw = backend.raw_get("nodered:context:global:blob").unwrap();
        assert!(crate::common::codec::is_compressed(&raw));

        let reader = ContextStore::open(&backend, keys, ValueCodec::plain()).await.unwrap();
        assert_eq!(reader.get("global", "blob").await.unwrap(), Some(json!(text)));
        writer.close().await.unwrap();
        assert_eq!(reader.get("global", "blob").await.unwrap(), Some(json!(text)));
    }

    #[tokio::test]
    async fn test_invalid_path_is_rejected() {
        let store = store();
        let err = store.set("global", "a..b", Some(json!(1))).await.unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_rejected() {
        let store = store();
        store.set("global", "list[1]", Some(json!("b"))).await.unwrap();
        for path in ["list[18446744073709551615]", "list[4000000000]"] {
            let err = store.set("global", path, Some(json!(1))).await.unwrap_err();
            assert!(matches!(err, Error::InvalidKey(_)), "{}", path);
        }
        assert_eq!(store.get("global", "list").await.unwrap(), Some(json!([null, "b"])));
    }
}
