//! Message queue: hash-routed queues with write-ahead durability
//!
//! No consensus here. Each queue lives on its ring owner; the WAL makes the
//! owner's state crash-recoverable and delivery is at-least-once.

pub mod engine;
pub mod grpc;
pub mod http;
pub mod server;
pub mod wal;

pub use engine::{Delivered, InFlight, QueueEngine, QueueStatusView};
pub use server::{EnqueueResult, QueueServer};
pub use wal::{QueueMessage, Wal, WalRecord};
