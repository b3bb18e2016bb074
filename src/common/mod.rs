//! Common utilities and types shared across nodered-cluster

pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod utils;

pub use codec::{ValueCodec, DEFAULT_COMPRESSION_THRESHOLD};
pub use config::{Config, LeaderConfig, NodeRole, StoreConfig};
pub use error::{Error, Result};
pub use keys::KeyCodec;
pub use utils::{
    crc32, decode_key, encode_key, parse_duration, resolve_identity, retry_with_backoff,
    timestamp_now_millis,
};
