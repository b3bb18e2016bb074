//! # nodered-cluster
//!
//! Cluster coordination for Node-RED instances sharing one Redis/Valkey store:
//! - A lease-based leader lock electing the single admin
//! - Revisioned configuration storage with optional LZ4 compression
//! - Change notifications over pub/sub with a periodic reconcile fallback
//! - Scoped context storage with nested property paths
//! - Package manifest synchronization from admin to workers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │ Admin (lease holder)     │        │ Worker                   │
//! │  Leadership ─ LeaderLock │        │  ChangeSubscriber        │
//! │  ConfigStore / Library   │        │  PackageSubscriber       │
//! │  ChangePublisher         │        │  ContextStore            │
//! └───────────┬──────────────┘        └────────────▲─────────────┘
//!             │ SET / EVAL / PUBLISH               │ GET / SUBSCRIBE
//!           ┌─▼────────────────────────────────────┴─┐
//!           │            Redis / Valkey              │
//!           │  {prefix}flows  {prefix}leader  ...    │
//!           └────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Who holds the lease?
//! nrcluster leader status
//!
//! # Hand leadership over from this host
//! nrcluster leader release
//!
//! # Current flows revision
//! nrcluster revision flows
//! ```

pub mod bus;
pub mod cluster;
pub mod common;
pub mod context;
pub mod coordinator;
pub mod ops;
pub mod storage;
pub mod transport;

// Re-export commonly used types
pub use cluster::{ClusterNode, ClusterNodeBuilder, SaveOutcome};
pub use common::{Config, Error, NodeRole, Result};
pub use context::ContextStore;
pub use coordinator::{LeaderLock, Leadership, ReleaseResult};
pub use ops::ReleaseLeaderAction;
pub use storage::{ConfigStore, ProjectMetadata, ResourceKind, Versioned};
pub use transport::{Connector, MemoryBackend, MemoryTransport, Transport};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
