//! Release-leader action node
//!
//! On each input message the node releases the leader lock if this instance
//! holds it and forwards the message enriched with the outcome:
//!
//! | outcome       | `lockReleased` | extra field     | status              |
//! |---------------|----------------|-----------------|---------------------|
//! | `released`    | true           | `releasedBy`    | green dot           |
//! | `heldByOther` | false          | `currentLeader` | yellow ring         |
//! | `notHeld`     | false          |                 | grey ring           |
//!
//! Store failures never escape `handle`: they are logged, shown as a red
//! status, and the message is dropped.

use crate::common::{resolve_identity, Result};
use crate::coordinator::{LeaderLock, ReleaseResult, DEFAULT_LOCK_KEY};
use crate::transport::{ConnectionState, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Green,
    Yellow,
    Grey,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Dot,
    Ring,
}

/// Badge shown under the node in the editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub fill: StatusFill,
    pub shape: StatusShape,
    pub text: String,
}

impl NodeStatus {
    fn new(fill: StatusFill, shape: StatusShape, text: impl Into<String>) -> Self {
        Self {
            fill,
            shape,
            text: text.into(),
        }
    }

    fn error(text: &str) -> Self {
        Self::new(StatusFill::Red, StatusShape::Ring, text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReleaseOutcome {
    Released,
    HeldByOther,
    NotHeld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    pub lock_released: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_leader: Option<String>,
    pub lock_key: String,
    pub outcome: ReleaseOutcome,
}

impl ReleaseReport {
    fn status(&self) -> NodeStatus {
        match self.outcome {
            ReleaseOutcome::Released => NodeStatus::new(StatusFill::Green, StatusShape::Dot, "lock released"),
            ReleaseOutcome::HeldByOther => {
                let leader: String = self
                    .current_leader
                    .as_deref()
                    .unwrap_or_default()
                    .chars()
                    .take(12)
                    .collect();
                NodeStatus::new(StatusFill::Yellow, StatusShape::Ring, format!("leader: {}", leader))
            }
            ReleaseOutcome::NotHeld => NodeStatus::new(StatusFill::Grey, StatusShape::Ring, "no lock"),
        }
    }
}

pub struct ReleaseLeaderAction {
    lock: LeaderLock,
    lock_key: String,
    identity: String,
    connection: watch::Receiver<ConnectionState>,
    status: watch::Sender<Option<NodeStatus>>,
}

impl ReleaseLeaderAction {
    /// `lock_key` defaults to `nodered:leader`; `identity` falls back to
    /// `HOSTNAME`, then the OS hostname.
    pub fn new(transport: Arc<dyn Transport>, lock_key: Option<&str>, identity: Option<&str>) -> Self {
        let (status, _) = watch::channel(None);
        Self {
            connection: transport.connection_state(),
            lock: LeaderLock::new(transport),
            lock_key: lock_key.unwrap_or(DEFAULT_LOCK_KEY).to_string(),
            identity: resolve_identity(identity),
            status,
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Last status shown; `None` before the first message
    pub fn status(&self) -> Option<NodeStatus> {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<NodeStatus>> {
        self.status.subscribe()
    }

    /// Release the lock and describe what happened
    pub async fn release(&self) -> Result<ReleaseReport> {
        let result = self.lock.release(&self.lock_key, &self.identity).await?;
        let lock_key = self.lock_key.clone();
        Ok(match result {
            ReleaseResult::Released => ReleaseReport {
                lock_released: true,
                released_by: Some(self.identity.clone()),
                current_leader: None,
                lock_key,
                outcome: ReleaseOutcome::Released,
            },
            ReleaseResult::HeldByOther(holder) => ReleaseReport {
                lock_released: false,
                released_by: None,
                current_leader: Some(holder),
                lock_key,
                outcome: ReleaseOutcome::HeldByOther,
            },
            ReleaseResult::NotHeld => ReleaseReport {
                lock_released: false,
                released_by: None,
                current_leader: None,
                lock_key,
                outcome: ReleaseOutcome::NotHeld,
            },
        })
    }

    /// Process one input message; `None` means nothing is sent downstream.
    pub async fn handle(&self, msg: Value) -> Option<Value> {
        if *self.connection.borrow() == ConnectionState::Disconnected {
            tracing::warn!("Not connected to the store, dropping message");
            return None;
        }

        let report = match self.release().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Lock release failed: {}", e);
                let text = if e.is_connection_error() { "connection error" } else { "error" };
                self.status.send_replace(Some(NodeStatus::error(text)));
                return None;
            }
        };

        match report.outcome {
            ReleaseOutcome::Released => tracing::info!("Released leadership lock {}", self.lock_key),
            ReleaseOutcome::HeldByOther => tracing::warn!(
                "Cannot release lock - leader is {}",
                report.current_leader.as_deref().unwrap_or_default()
            ),
            ReleaseOutcome::NotHeld => tracing::info!("No lock to release"),
        }
        self.status.send_replace(Some(report.status()));

        let mut object = match msg {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            payload => {
                let mut object = Map::new();
                object.insert("payload".to_string(), payload);
                object
            }
        };
        if let Ok(Value::Object(fields)) = serde_json::to_value(&report) {
            object.extend(fields);
        }
        Some(Value::Object(object))
    }
}
