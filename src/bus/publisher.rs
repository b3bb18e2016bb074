//! Admin-side change notifications

use super::{ChangeNotification, Channels};
use crate::common::Result;
use crate::storage::ResourceKind;
use crate::transport::Transport;
use std::sync::Arc;

pub struct ChangePublisher {
    transport: Arc<dyn Transport>,
    channels: Channels,
    identity: String,
}

impl ChangePublisher {
    pub fn new(transport: Arc<dyn Transport>, channels: Channels, identity: impl Into<String>) -> Self {
        Self {
            transport,
            channels,
            identity: identity.into(),
        }
    }

    /// Announce `revision` of `kind`; returns the number of receivers.
    ///
    /// Callers treat an error as a warning: the save it follows has
    /// already been persisted.
    pub async fn publish(&self, kind: ResourceKind, revision: u64) -> Result<u64> {
        let channel = self.channels.channel(kind);
        let payload = ChangeNotification::new(kind, revision, self.identity.as_str()).to_bytes()?;
        let receivers = self.transport.publish(&channel, payload).await?;
        tracing::debug!(
            "Published {} revision {} on {} ({} receivers)",
            kind,
            revision,
            channel,
            receivers
        );
        Ok(receivers)
    }
}
