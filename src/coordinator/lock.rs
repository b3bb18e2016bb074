//! Advisory leader lock
//!
//! The lock value is the holder's identity and the lease is the key's
//! expiry, so a crashed holder is reclaimed once its lease runs out. Every
//! operation is one atomic conditional write on the store.

use crate::common::Result;
use crate::transport::{Swap, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Default lock key used by the action node and the CLI
pub const DEFAULT_LOCK_KEY: &str = "nodered:leader";

/// Outcome of [`LeaderLock::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseResult {
    Released,
    NotHeld,
    HeldByOther(String),
}

#[derive(Clone)]
pub struct LeaderLock {
    transport: Arc<dyn Transport>,
}

impl LeaderLock {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Take the lock if it is free or expired.
    ///
    /// A caller that already holds the lock gets its lease refreshed and
    /// `true` back.
    pub async fn try_acquire(&self, lock_key: &str, identity: &str, lease: Duration) -> Result<bool> {
        if self
            .transport
            .set_if_absent(lock_key, identity.as_bytes().to_vec(), lease)
            .await?
        {
            tracing::debug!("{} acquired {}", identity, lock_key);
            return Ok(true);
        }
        self.renew(lock_key, identity, lease).await
    }

    /// Extend the lease; `false` when the caller is no longer the holder.
    pub async fn renew(&self, lock_key: &str, identity: &str, lease: Duration) -> Result<bool> {
        let swap = self
            .transport
            .compare_and_expire(lock_key, identity.as_bytes(), lease)
            .await?;
        Ok(swap.is_applied())
    }

    /// Delete the lock only if the caller holds it.
    pub async fn release(&self, lock_key: &str, identity: &str) -> Result<ReleaseResult> {
        let swap = self
            .transport
            .compare_and_swap(lock_key, Some(identity.as_bytes()), None, None)
            .await?;
        Ok(match swap {
            Swap::Applied => ReleaseResult::Released,
            Swap::Conflict { current: None } => ReleaseResult::NotHeld,
            Swap::Conflict {
                current: Some(holder),
            } => ReleaseResult::HeldByOther(String::from_utf8_lossy(&holder).into_owned()),
        })
    }

    pub async fn current_holder(&self, lock_key: &str) -> Result<Option<String>> {
        Ok(self
            .transport
            .get(lock_key)
            .await?
            .map(|holder| String::from_utf8_lossy(&holder).into_owned()))
    }
}
