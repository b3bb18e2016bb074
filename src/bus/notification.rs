use crate::common::{timestamp_now_millis, Result};
use crate::storage::ResourceKind;
use serde::{Deserialize, Serialize};

/// Published after every successful save.
///
/// Subscribers treat `revision` as authoritative; arrival order means
/// nothing. Fields added by newer publishers are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    /// Missing on older publishers; the channel then names the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<ResourceKind>,
    pub revision: u64,
    pub origin_identity: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
}

impl ChangeNotification {
    pub fn new(kind: ResourceKind, revision: u64, origin_identity: impl Into<String>) -> Self {
        Self {
            resource_kind: Some(kind),
            revision,
            origin_identity: origin_identity.into(),
            timestamp: timestamp_now_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
