//! Callback-style adapters over [`ContextStore`]
//!
//! Each call spawns the async operation on the current tokio runtime and
//! hands the result to the callback once it completes.

use super::ContextStore;
use crate::common::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

impl ContextStore {
    pub fn get_with<F>(self: Arc<Self>, scope: &str, path: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Option<Value>>) + Send + 'static,
    {
        let (scope, path) = (scope.to_string(), path.to_string());
        tokio::spawn(async move { callback(self.get(&scope, &path).await) })
    }

    pub fn set_with<F>(
        self: Arc<Self>,
        scope: &str,
        path: &str,
        value: Option<Value>,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let (scope, path) = (scope.to_string(), path.to_string());
        tokio::spawn(async move { callback(self.set(&scope, &path, value).await) })
    }

    pub fn keys_with<F>(self: Arc<Self>, scope: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Vec<String>>) + Send + 'static,
    {
        let scope = scope.to_string();
        tokio::spawn(async move { callback(self.keys(&scope).await) })
    }
}

#[cfg(test)]
mod tests {
    use crate::common::{KeyCodec, ValueCodec};
    use crate::context::ContextStore;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_callbacks_receive_results() {
        let store = Arc::new(ContextStore::new(
            Arc::new(MemoryTransport::new()),
            KeyCodec::new("nodered:"),
            ValueCodec::plain(),
        ));

        let (tx, rx) = oneshot::channel();
        store
            .clone()
            .set_with("global", "colour", Some(json!("red")), move |result| {
                let _ = tx.send(result.is_ok());
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap());

        let (tx, rx) = oneshot::channel();
        store.clone().get_with("global", "colour", move |result| {
            let _ = tx.send(result.ok().flatten());
        });
        assert_eq!(rx.await.unwrap(), Some(json!("red")));

        let (tx, rx) = oneshot::channel();
        store.keys_with("global", move |result| {
            let _ = tx.send(result.unwrap_or_default());
        });
        assert_eq!(rx.await.unwrap(), vec!["colour".to_string()]);
    }

    #[tokio::test]
    async fn test_callback_receives_errors() {
        let store = Arc::new(ContextStore::new(
            Arc::new(MemoryTransport::new()),
            KeyCodec::new("nodered:"),
            ValueCodec::plain(),
        ));
        let (tx, rx) = oneshot::channel();
        store.get_with("global", "a..b", move |result| {
            let _ = tx.send(result.is_err());
        });
        assert!(rx.await.unwrap());
    }
}
