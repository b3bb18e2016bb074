//! Context storage shared between instances

use nodered_cluster::common::{codec::is_compressed, KeyCodec, ValueCodec};
use nodered_cluster::{ContextStore, MemoryBackend};
use serde_json::json;
use std::sync::Arc;

async fn open(backend: &MemoryBackend, codec: ValueCodec) -> ContextStore {
    ContextStore::open(backend, KeyCodec::new("nodered:"), codec)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_large_value_is_compressed_and_readable_without_compression() {
    let backend = MemoryBackend::new();
    let compressing = open(&backend, ValueCodec::compressed(1024)).await;
    let blob = "x".repeat(2000);
    compressing
        .set("global", "payload", Some(json!(blob)))
        .await
        .unwrap();

    let raw = backend.raw_get("nodered:context:global:payload").unwrap();
    assert!(is_compressed(&raw));
    assert!(raw.len() < 2000);

    let plain = open(&backend, ValueCodec::plain()).await;
    assert_eq!(plain.get("global", "payload").await.unwrap(), Some(json!(blob)));

    // small values stay plain JSON
    compressing.set("global", "small", Some(json!(1))).await.unwrap();
    assert_eq!(backend.raw_get("nodered:context:global:small").unwrap(), b"1".to_vec());
}

#[tokio::test]
async fn test_nested_writes_from_two_instances_keep_siblings() {
    let backend = MemoryBackend::new();
    let a = Arc::new(open(&backend, ValueCodec::plain()).await);
    let b = Arc::new(open(&backend, ValueCodec::plain()).await);

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = if i % 2 == 0 { a.clone() } else { b.clone() };
        handles.push(tokio::spawn(async move {
            store
                .set("flow-1", &format!("counters.c{}", i), Some(json!(i)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let counters = a.get("flow-1", "counters").await.unwrap().unwrap();
    assert_eq!(counters.as_object().unwrap().len(), 20);
    assert_eq!(b.get("flow-1", "counters.c7").await.unwrap(), Some(json!(7)));

    b.set("flow-1", "counters.c7", None).await.unwrap();
    assert_eq!(a.get("flow-1", "counters.c7").await.unwrap(), None);
    assert_eq!(a.get("flow-1", "counters.c8").await.unwrap(), Some(json!(8)));
}

#[tokio::test]
async fn test_scopes_are_isolated() {
    let backend = MemoryBackend::new();
    let store = open(&backend, ValueCodec::plain()).await;
    store.set("global", "k", Some(json!("g"))).await.unwrap();
    store.set("flow:1", "k", Some(json!("f"))).await.unwrap();
    store.set("node1:flow:1", "k", Some(json!("n"))).await.unwrap();

    assert_eq!(store.get("global", "k").await.unwrap(), Some(json!("g")));
    assert_eq!(store.get("flow:1", "k").await.unwrap(), Some(json!("f")));
    assert_eq!(store.keys("flow:1").await.unwrap(), vec!["k"]);

    store.delete("flow:1").await.unwrap();
    assert_eq!(store.get("flow:1", "k").await.unwrap(), None);
    assert_eq!(store.get("node1:flow:1", "k").await.unwrap(), Some(json!("n")));
}

#[tokio::test]
async fn test_clean_after_redeploy() {
    let backend = MemoryBackend::new();
    let store = open(&backend, ValueCodec::plain()).await;
    for scope in ["global", "flowA", "n1:flowA", "flowB", "n2:flowB"] {
        store.set(scope, "v", Some(json!(scope))).await.unwrap();
    }

    // flowB and its node were removed from the deployment
    assert_eq!(store.clean(&["flowA", "n1"]).await.unwrap(), 2);
    assert_eq!(store.get("global", "v").await.unwrap(), Some(json!("global")));
    assert_eq!(store.get("n1:flowA", "v").await.unwrap(), Some(json!("n1:flowA")));
    assert_eq!(store.get("flowB", "v").await.unwrap(), None);
    assert_eq!(store.get("n2:flowB", "v").await.unwrap(), None);
}
