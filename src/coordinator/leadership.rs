//! Leadership keeper
//!
//! Candidates call [`Leadership::step`] on a timer: followers try to take the
//! lock, the leader renews it. The leader steps down on its own when the
//! lease is taken over, when a failed renewal leaves no chance to renew before
//! the lease runs out, or when the connection is reported lost.

use crate::common::Result;
use crate::coordinator::lock::{LeaderLock, ReleaseResult};
use crate::transport::ConnectionState;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderRole {
    Follower,
    Leader,
}

impl std::fmt::Display for LeaderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderRole::Follower => write!(f, "follower"),
            LeaderRole::Leader => write!(f, "leader"),
        }
    }
}

/// The lease as seen by its holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderLease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Local deadline, measured from when the last successful request was sent
    pub expires_at: Instant,
}

pub struct Leadership {
    lock: LeaderLock,
    lock_key: String,
    identity: String,
    lease: Duration,
    renew_interval: Duration,
    current: Mutex<Option<LeaderLease>>,
    role: watch::Sender<LeaderRole>,
}

impl Leadership {
    pub fn new(
        lock: LeaderLock,
        lock_key: impl Into<String>,
        identity: impl Into<String>,
        lease: Duration,
        renew_interval: Duration,
    ) -> Self {
        let (role, _) = watch::channel(LeaderRole::Follower);
        Self {
            lock,
            lock_key: lock_key.into(),
            identity: identity.into(),
            lease,
            renew_interval,
            current: Mutex::new(None),
            role,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn role(&self) -> LeaderRole {
        *self.role.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == LeaderRole::Leader
    }

    pub fn lease(&self) -> Option<LeaderLease> {
        self.current.lock().unwrap().clone()
    }

    /// Watch role changes
    pub fn subscribe(&self) -> watch::Receiver<LeaderRole> {
        self.role.subscribe()
    }

    /// Holder recorded in the store (not just the local view)
    pub async fn current_leader(&self) -> Result<Option<String>> {
        self.lock.current_holder(&self.lock_key).await
    }

    /// One acquire-or-renew round
    pub async fn step(&self) -> LeaderRole {
        let sent_at = Instant::now();
        match self.role() {
            LeaderRole::Follower => {
                match self
                    .lock
                    .try_acquire(&self.lock_key, &self.identity, self.lease)
                    .await
                {
                    Ok(true) => self.become_leader(sent_at),
                    Ok(false) => tracing::debug!("{} is held by another instance", self.lock_key),
                    Err(e) => tracing::warn!("Leader lock acquire failed: {}", e),
                }
            }
            LeaderRole::Leader => {
                match self
                    .lock
                    .renew(&self.lock_key, &self.identity, self.lease)
                    .await
                {
                    Ok(true) => {
                        if let Some(lease) = self.current.lock().unwrap().as_mut() {
                            lease.expires_at = sent_at + self.lease;
                        }
                    }
                    Ok(false) => self.step_down("lease is held by another instance"),
                    Err(e) => {
                        let expires_at = self.lease().map(|l| l.expires_at).unwrap_or(sent_at);
                        if Instant::now() + self.renew_interval >= expires_at {
                            self.step_down(&format!("cannot renew before lease expiry: {}", e));
                        } else {
                            tracing::warn!("Leader lease renewal failed, will retry: {}", e);
                        }
                    }
                }
            }
        }
        self.role()
    }

    fn become_leader(&self, sent_at: Instant) {
        *self.current.lock().unwrap() = Some(LeaderLease {
            holder: self.identity.clone(),
            acquired_at: Utc::now(),
            expires_at: sent_at + self.lease,
        });
        self.role.send_replace(LeaderRole::Leader);
        tracing::info!("{} became leader ({})", self.identity, self.lock_key);
    }

    /// Stop acting as leader locally; the store is not touched
    pub fn step_down(&self, reason: &str) {
        *self.current.lock().unwrap() = None;
        if self.role.send_replace(LeaderRole::Follower) == LeaderRole::Leader {
            tracing::warn!("{} stepped down: {}", self.identity, reason);
        }
    }

    /// Step down and release the lock if this instance still holds it
    pub async fn resign(&self) -> Result<ReleaseResult> {
        self.step_down("resigning");
        let result = self.lock.release(&self.lock_key, &self.identity).await?;
        if result == ReleaseResult::Released {
            tracing::info!("{} released {}", self.identity, self.lock_key);
        }
        Ok(result)
    }
}

/// Start the acquire/renew loop; it ends when `shutdown` is cancelled.
pub fn start_leadership_tasks(
    node: Arc<Leadership>,
    mut connection: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(node.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    node.step().await;
                }
                changed = connection.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *connection.borrow_and_update() == ConnectionState::Disconnected {
                        node.step_down("connection lost");
                    }
                }
            }
        }
        tracing::debug!("Leadership loop for {} stopped", node.identity);
    })
}
