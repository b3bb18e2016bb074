//! Admin election
//!
//! - [`lock`]: the advisory leader lock (acquire, renew, release)
//! - [`leadership`]: the timer-driven keeper that holds the lock for an admin candidate

pub mod leadership;
pub mod lock;

pub use leadership::{start_leadership_tasks, LeaderLease, LeaderRole, Leadership};
pub use lock::{LeaderLock, ReleaseResult, DEFAULT_LOCK_KEY};
