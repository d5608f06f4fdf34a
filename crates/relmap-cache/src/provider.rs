//! Backing stores for the second-level cache.
//!
//! A [`CacheProvider`] only knows regions, identities and opaque items. The
//! concurrency strategies live in [`SecondLevelCache`](crate::SecondLevelCache),
//! which drives providers exclusively through atomic read-modify-write calls.

use crate::config::CacheConfig;
use relmap_core::{Error, Identity, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A serialized copy of an entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    bytes: Vec<u8>,
    version: Option<Value>,
}

impl CachedValue {
    /// Serialize row values into a cache copy.
    pub fn encode(values: &[Value], version: Option<Value>) -> Result<Self> {
        let bytes = serde_json::to_vec(values).map_err(|e| Error::Serde(e.to_string()))?;
        Ok(Self { bytes, version })
    }

    /// Deserialize a fresh copy of the row values.
    pub fn decode(&self) -> Result<Vec<Value>> {
        serde_json::from_slice(&self.bytes).map_err(|e| Error::Serde(e.to_string()))
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// A soft lock placed by a read-write writer between flush and commit.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftLock {
    pub lock_id: u64,
    /// Number of units of work currently holding the lock.
    pub holders: usize,
    /// Another writer locked the item while it was already locked.
    pub concurrent: bool,
    /// Item in place when the first holder locked it.
    pub previous: Option<CachedValue>,
}

/// What a region stores for one identity.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheItem {
    Value(CachedValue),
    Locked(SoftLock),
}

impl CacheItem {
    pub fn is_locked(&self) -> bool {
        matches!(self, CacheItem::Locked(_))
    }
}

/// Closure applied atomically to one slot: receives the current item and returns the new one.
pub type SlotUpdate<'a> = dyn FnMut(Option<CacheItem>) -> Option<CacheItem> + 'a;

/// Pluggable region-scoped storage.
///
/// Implementations must make [`update`](Self::update) atomic with respect to
/// every other call on the same slot.
pub trait CacheProvider: Send + Sync + fmt::Debug {
    fn get(&self, region: &str, identity: &Identity) -> Option<CacheItem>;

    /// Atomically replace the item for `identity` with `f(current)`.
    fn update(&self, region: &str, identity: &Identity, f: &mut SlotUpdate<'_>);

    fn remove(&self, region: &str, identity: &Identity) -> Option<CacheItem>;

    /// Drop every item of `region`; returns how many were dropped.
    fn clear_region(&self, region: &str) -> usize;

    /// Drop every item of every region; returns how many were dropped.
    fn clear(&self) -> usize;

    fn len(&self, region: &str) -> usize;

    /// Items dropped because a region hit its capacity.
    fn capacity_evictions(&self) -> u64 {
        0
    }
}

#[derive(Debug)]
struct Slot {
    item: CacheItem,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Region {
    slots: HashMap<Identity, Slot>,
}

/// The default provider: in-process maps with per-region LRU capacity.
///
/// Soft-locked items are never evicted for capacity and are admitted even
/// into a full region. Values that find no room are not cached.
#[derive(Debug)]
pub struct MemoryCacheProvider {
    config: CacheConfig,
    regions: RwLock<HashMap<String, Region>>,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCacheProvider {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            regions: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Evict least-recently-used unlocked items until `region` has room for one more.
    ///
    /// Returns `false` when no room could be made: the capacity is zero or
    /// every remaining item is soft-locked.
    fn make_room(&self, region_name: &str, region: &mut Region) -> bool {
        let Some(capacity) = self.config.region_config(region_name).capacity else {
            return true;
        };
        while region.slots.len() >= capacity {
            let victim = region
                .slots
                .iter()
                .filter(|(_, slot)| !slot.item.is_locked())
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                return false;
            };
            region.slots.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(region = region_name, identity = %victim, "LRU eviction");
        }
        true
    }
}

impl Default for MemoryCacheProvider {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheProvider for MemoryCacheProvider {
    fn get(&self, region: &str, identity: &Identity) -> Option<CacheItem> {
        // Write lock: reads refresh the LRU clock.
        let mut regions = self
            .regions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = regions.get_mut(region)?.slots.get_mut(identity)?;
        slot.last_used = self.tick();
        Some(slot.item.clone())
    }

    fn update(&self, region: &str, identity: &Identity, f: &mut SlotUpdate<'_>) {
        let mut regions = self
            .regions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = regions.entry(region.to_string()).or_default();
        let current = entry.slots.remove(identity).map(|slot| slot.item);
        if let Some(item) = f(current) {
            // Soft locks are always admitted and may exceed the capacity;
            // values are dropped when the region is full of locks.
            if !self.make_room(region, entry) && !item.is_locked() {
                tracing::debug!(region, identity = %identity, "Region full; value not cached");
                return;
            }
            entry.slots.insert(
                identity.clone(),
                Slot {
                    item,
                    last_used: self.tick(),
                },
            );
        }
    }

    fn remove(&self, region: &str, identity: &Identity) -> Option<CacheItem> {
        let mut regions = self
            .regions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        regions
            .get_mut(region)?
            .slots
            .remove(identity)
            .map(|slot| slot.item)
    }

    fn clear_region(&self, region: &str) -> usize {
        let mut regions = self
            .regions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        regions.remove(region).map_or(0, |r| r.slots.len())
    }

    fn clear(&self) -> usize {
        let mut regions = self
            .regions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let dropped = regions.values().map(|r| r.slots.len()).sum();
        regions.clear();
        dropped
    }

    fn len(&self, region: &str) -> usize {
        let regions = self
            .regions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        regions.get(region).map_or(0, |r| r.slots.len())
    }

    fn capacity_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
