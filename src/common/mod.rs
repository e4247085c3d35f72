//! Common utilities and types shared across minicoord

pub mod config;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod ring;
pub mod utils;

pub use config::{Config, NodeRole, PeerAddr};
pub use error::{Error, Result};
pub use metrics::{Counter, Histogram, Metrics};
pub use peer::{PeerClient, PeerSet};
pub use ring::ConsistentHashRing;
pub use utils::{crc32, timestamp_now, timestamp_now_millis, validate_key};
