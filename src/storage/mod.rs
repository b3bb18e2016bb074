//! Revisioned configuration storage
//!
//! Every resource is stored as one [`Versioned`] record. Writes go through
//! an optimistic compare-and-swap loop, so the revision of a resource is
//! strictly increasing even if two writers race.

pub mod config_store;
pub mod library;

pub use config_store::{ConfigStore, ProjectMetadata};
pub use library::{Library, LibraryEntry, LibraryItem, LibraryListing};

use crate::common::{Error, Result, ValueCodec};
use crate::transport::{Swap, Transport};
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

/// Attempts before a save gives up with [`Error::Conflict`]
const MAX_SAVE_ATTEMPTS: usize = 16;

/// Singleton configuration resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Flows,
    Credentials,
    Settings,
    Sessions,
    /// Package manifest synchronized from the admin to workers
    Packages,
    /// Active project of the admin editor
    Project,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Flows,
        ResourceKind::Credentials,
        ResourceKind::Settings,
        ResourceKind::Sessions,
        ResourceKind::Packages,
        ResourceKind::Project,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Flows => "flows",
            ResourceKind::Credentials => "credentials",
            ResourceKind::Settings => "settings",
            ResourceKind::Sessions => "sessions",
            ResourceKind::Packages => "packages",
            ResourceKind::Project => "project",
        }
    }

    /// Body returned for a resource that was never saved
    pub fn default_body(&self) -> Value {
        match self {
            ResourceKind::Flows => json!([]),
            _ => json!({}),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidKey(format!("unknown resource kind: {}", s)))
    }
}

/// A stored body with its revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned<T> {
    pub body: T,
    /// 0 means never saved
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl<T> Versioned<T> {
    /// Record for a resource that does not exist yet
    pub fn initial(body: T) -> Self {
        Self {
            body,
            revision: 0,
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

pub(crate) async fn read_versioned<T: DeserializeOwned>(
    transport: &dyn Transport,
    codec: &ValueCodec,
    key: &str,
) -> Result<Option<Versioned<T>>> {
    match transport.get(key).await? {
        Some(bytes) => Ok(Some(codec.decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Write `body` as the next revision of `key` and return that revision.
///
/// With a `counter` key, revisions are allocated from that counter instead
/// of the record alone, so they keep increasing after the record is deleted
/// or expires. Revisions allocated by a losing writer are skipped.
pub(crate) async fn write_versioned<T: Serialize + Sync>(
    transport: &dyn Transport,
    codec: &ValueCodec,
    key: &str,
    counter: Option<&str>,
    body: &T,
    ttl: Option<Duration>,
) -> Result<u64> {
    for attempt in 1..=MAX_SAVE_ATTEMPTS {
        let current = transport.get(key).await?;
        let stored = match &current {
            Some(bytes) => codec.decode::<Versioned<IgnoredAny>>(bytes)?.revision,
            None => 0,
        };
        let revision = match counter {
            Some(counter) => next_revision(transport, counter, stored).await?,
            None => stored + 1,
        };
        let record = Versioned {
            body,
            revision,
            updated_at: Utc::now(),
        };
        let encoded = codec.encode(&record)?;

        match transport
            .compare_and_swap(key, current.as_deref(), Some(encoded), ttl)
            .await?
        {
            Swap::Applied => {
                tracing::debug!("Saved {} at revision {}", key, revision);
                return Ok(revision);
            }
            Swap::Conflict { .. } => {
                tracing::debug!("Concurrent update on {} (attempt {}), retrying", key, attempt);
            }
        }
    }
    Err(Error::Conflict(key.to_string()))
}

/// Raise the counter at `key` above both its value and `floor`
async fn next_revision(transport: &dyn Transport, key: &str, floor: u64) -> Result<u64> {
    for _ in 0..MAX_SAVE_ATTEMPTS {
        let current = transport.get(key).await?;
        let stored = match &current {
            Some(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| Error::Corrupted(format!("revision counter {}", key)))?,
            None => 0,
        };
        let next = stored.max(floor) + 1;
        let swap = transport
            .compare_and_swap(key, current.as_deref(), Some(next.to_string().into_bytes()), None)
            .await?;
        if swap.is_applied() {
            return Ok(next);
        }
    }
    Err(Error::Conflict(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_resource_kind_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("library".parse::<ResourceKind>().is_err());
        assert_eq!(ResourceKind::Flows.default_body(), json!([]));
        assert_eq!(ResourceKind::Settings.default_body(), json!({}));
    }

    #[tokio::test]
    async fn test_write_versioned_increments() {
        let transport = MemoryTransport::new();
        let codec = ValueCodec::plain();
        for expected in 1..=3 {
            let rev = write_versioned(&transport, &codec, "k", None, &json!({"n": expected}), None)
                .await
                .unwrap();
            assert_eq!(rev, expected);
        }
        let record: Versioned<Value> = read_versioned(&transport, &codec, "k")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.revision, 3);
        assert_eq!(record.body, json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_concurrent_writers_get_distinct_revisions() {
        let transport = std::sync::Arc::new(MemoryTransport::new());
        let codec = ValueCodec::plain();
        let mut handles = Vec::new();
        for i in 0..8 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                write_versioned(transport.as_ref(), &codec, "k", None, &json!(i), None).await
            }));
        }
        let mut revisions = Vec::new();
        for handle in handles {
            revisions.push(handle.await.unwrap().unwrap());
        }
        revisions.sort();
        assert_eq!(revisions, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_not_overwritten() {
        let transport = MemoryTransport::new();
        transport.set("k", b"{broken".to_vec(), None).await.unwrap();
        let err = write_versioned(&transport, &ValueCodec::plain(), "k", None, &json!(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(transport.get("k").await.unwrap(), Some(b"{broken".to_vec()));
    }

    #[tokio::test]
    async fn test_counter_survives_record_delete() {
        let transport = MemoryTransport::new();
        let codec = ValueCodec::plain();
        for _ in 0..2 {
            write_versioned(&transport, &codec, "k", Some("k:rev"), &json!(1), None)
                .await
                .unwrap();
        }
        transport.delete(&["k".to_string()]).await.unwrap();
        let rev = write_versioned(&transport, &codec, "k", Some("k:rev"), &json!(2), None)
            .await
            .unwrap();
        assert_eq!(rev, 3);
        assert_eq!(transport.get("k:rev").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn test_counter_catches_up_with_existing_record() {
        let transport = MemoryTransport::new();
        let codec = ValueCodec::plain();
        for _ in 0..4 {
            write_versioned(&transport, &codec, "k", None, &json!(1), None)
                .await
                .unwrap();
        }
        let rev = write_versioned(&transport, &codec, "k", Some("k:rev"), &json!(2), None)
            .await
            .unwrap();
        assert_eq!(rev, 5);
    }
}
