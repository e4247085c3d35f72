//! # minicoord
//!
//! A distributed coordination cluster exposing three cooperating services:
//! - Lock manager: shared/exclusive leasing with Raft-replicated state and
//!   wait-for-graph deadlock detection
//! - Message queue: consistent-hash fan-out with write-ahead durability and
//!   at-least-once delivery
//! - Cache: MESI-style invalidation coherence with LRU eviction
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Lock Ensemble                   │
//! │   (Raft consensus for the lock table)        │
//! │    - Leader: validates, proposes, grants     │
//! │    - Followers: replicate, redirect writes   │
//! └──────────────────────────────────────────────┘
//!
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ Queue node A │  │ Queue node B │  │ Queue node C │
//! │ ring owner   │  │ ring owner   │  │ ring owner   │
//! │  + WAL       │  │  + WAL       │  │  + WAL       │
//! └──────────────┘  └──────────────┘  └──────────────┘
//!
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ Cache node A │◄─┤ Cache node B ├─►│ Cache node C │
//! │  M/E/S/I     │  │  invalidate  │  │  read bcast  │
//! └──────────────┘  └──────────────┘  └──────────────┘
//! ```
//!
//! Each node process hosts exactly one role and talks to same-role peers over
//! an internal gRPC channel; clients use the per-role HTTP surface.
//!
//! ## Usage
//!
//! ```bash
//! # Start a lock node
//! minicoord-node serve --id lock-1 --role lock \
//!   --bind 0.0.0.0:7000 --grpc 0.0.0.0:7001 \
//!   --data ./lock-1-data \
//!   --peers lock-2:localhost:7011,lock-3:localhost:7021
//!
//! # Acquire a lock
//! minicoord lock acquire database:users --client service-a --mode exclusive
//! ```

pub mod cache;
pub mod common;
pub mod lock;
pub mod queue;
pub mod raft;

// Re-export commonly used types
pub use common::{Config, Error, Result};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("minicoord");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
