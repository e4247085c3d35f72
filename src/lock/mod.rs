//! Lock manager: Raft-replicated shared/exclusive leasing
//!
//! - The state machine (`state`) applies committed commands deterministically
//! - Deadlock detection (`deadlock`) runs on the leader after transitions
//! - The server (`server`) validates, proposes and wakes waiters
//! - `grpc` / `http` are the peer and client surfaces

pub mod deadlock;
pub mod grpc;
pub mod http;
pub mod server;
pub mod state;

pub use server::{AcquireOutcome, LockServer, LockStatusView};
pub use state::{LockCommand, LockEntry, LockMode, LockTable};
