//! Operational actions exposed to flows

pub mod release_leader;

pub use release_leader::{NodeStatus, ReleaseLeaderAction, ReleaseOutcome, ReleaseReport, StatusFill, StatusShape};
