//! Cache: MESI-coherent lines with LRU eviction and write-back
//!
//! Every node has an equal voice; there is no leader. Coherence is a
//! read broadcast on miss and an invalidate broadcast on write.

pub mod engine;
pub mod grpc;
pub mod http;
pub mod server;

pub use engine::{CacheLine, CacheMetricsView, LineState, MesiCache};
pub use server::{BackingStore, CachePeers, CacheServer, GetResult, MemoryBackingStore};
