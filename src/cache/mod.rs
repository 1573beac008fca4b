//! Tiered content caching for the object read path.
//!
//! Provides a [`FileCacheService`] that owns an in-memory precache tier and
//! an on-disk tier in front of the backing file store, a per-object
//! [`tracker::FileTracker`] driving score-based promotion and eviction, and
//! the stream tee used to buffer objects without delaying their original
//! consumer.

pub mod manager;
pub mod score;
pub mod tee;
pub mod tracker;

pub use manager::{CacheStatus, FileCacheService, StoreOutcome};
pub use tee::ByteStream;
