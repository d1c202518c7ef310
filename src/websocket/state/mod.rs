//! Local state built from streams.
//!
//! - `depth_cache`: order books from snapshot + diff stream

pub mod depth_cache;

pub use depth_cache::{
    CacheEvent, CacheState, ContiguityPolicy, DepthCacheConfig, DiffOutcome, OrderBook,
    OrderBookCache, OrderBookReader, SnapshotOutcome,
};
