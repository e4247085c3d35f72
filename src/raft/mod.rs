//! Raft consensus: leader election, replicated log, commit stream
//!
//! The module knows nothing about lock semantics; committed commands are
//! opaque bytes handed to whatever state machine consumes the stream.

pub mod node;
pub mod rpc;
pub mod storage;
pub mod transport;

pub use node::{CommittedEntry, RaftNode, RaftRole, RaftStatus, RaftTimings, RaftTransport};
pub use storage::{RaftMeta, RaftStorage};
pub use transport::GrpcRaftTransport;
