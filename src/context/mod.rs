//! Context storage for flows and nodes
//!
//! Values live under a scope: `global`, a flow id, or `{node}:{flow}` for
//! node context. Properties are addressed with paths such as `a.b[0]`.

mod callback;
pub mod path;
pub mod store;

pub use path::{PropertyPath, Segment};
pub use store::{ContextStore, GLOBAL_SCOPE};
