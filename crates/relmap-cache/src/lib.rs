//! Second-level (cross-unit-of-work) cache for relmap.
//!
//! - `CacheProvider`: pluggable region-scoped storage, `MemoryCacheProvider` by default
//! - `SecondLevelCache`: the four concurrency strategies on top of a provider
//! - `CacheTransaction`: what one unit of work did to cached types until commit/rollback
//!
//! Cached values are always serialized copies; nothing handed out by the
//! cache aliases an instance managed by a unit of work.

pub mod config;
pub mod manager;
pub mod provider;
pub mod statistics;
pub mod transaction;

pub use config::{CacheConfig, RegionConfig};
pub use manager::SecondLevelCache;
pub use provider::{CacheItem, CacheProvider, CachedValue, MemoryCacheProvider, SlotUpdate, SoftLock};
pub use statistics::{CacheStatistics, CacheStats};
pub use transaction::{CacheTransaction, Staged, WriteKind};
