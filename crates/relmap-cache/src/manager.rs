//! The second-level cache manager.
//!
//! [`SecondLevelCache`] is shared (`Arc`) by every unit of work opened from
//! the same engine. It is the only relmap component used from several threads
//! at once; all mutation goes through atomic provider updates.
//!
//! Strategy summary:
//!
//! | strategy | update through a unit of work | delete | insert |
//! |---|---|---|---|
//! | read-only | rejected before any write | evict after commit | put after commit |
//! | nonstrict-read-write | evict after commit | evict after commit | put after commit |
//! | read-write | soft lock at flush, replace on commit | soft lock, drop on commit | put after commit |
//! | transactional | staged, applied on commit | staged | staged |

use crate::config::CacheConfig;
use crate::provider::{CacheItem, CacheProvider, CachedValue, MemoryCacheProvider, SoftLock};
use crate::statistics::{CacheStatistics, CacheStats};
use crate::transaction::{CacheTransaction, PendingAction, Staged, WriteKind};
use relmap_core::{CacheStrategy, CacheViolationError, EntityCacheConfig, Error, Identity, Result};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct SecondLevelCache {
    provider: Box<dyn CacheProvider>,
    stats: CacheStatistics,
    next_lock: AtomicU64,
}

impl SecondLevelCache {
    pub fn new(provider: impl CacheProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            stats: CacheStatistics::default(),
            next_lock: AtomicU64::new(1),
        }
    }

    /// A cache backed by [`MemoryCacheProvider`].
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(MemoryCacheProvider::new(config))
    }

    pub fn provider(&self) -> &dyn CacheProvider {
        self.provider.as_ref()
    }

    pub fn statistics(&self) -> CacheStats {
        self.stats.snapshot(self.provider.capacity_evictions())
    }

    /// Look up a copy of the cached state.
    ///
    /// With the transactional strategy, `tx`'s own staged writes win.
    /// Soft-locked items read as misses.
    pub fn get(
        &self,
        config: &EntityCacheConfig,
        identity: &Identity,
        tx: Option<&CacheTransaction>,
    ) -> Option<CachedValue> {
        if config.strategy == CacheStrategy::Transactional {
            if let Some(staged) = tx.and_then(|tx| tx.staged(&config.region, identity)) {
                return match staged {
                    Staged::Put(value) => {
                        self.stats.hit();
                        Some(value.clone())
                    }
                    Staged::Evict => {
                        self.stats.miss();
                        None
                    }
                };
            }
        }

        match self.provider.get(&config.region, identity) {
            Some(CacheItem::Value(value)) => {
                self.stats.hit();
                tracing::trace!(region = %config.region, identity = %identity, "L2 hit");
                Some(value)
            }
            Some(CacheItem::Locked(_)) => {
                self.stats.miss();
                self.stats.lock_bypass();
                tracing::trace!(region = %config.region, identity = %identity, "L2 soft-locked");
                None
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    /// Whether a (non-locked) value is cached for `identity`.
    pub fn contains(&self, region: &str, identity: &Identity) -> bool {
        matches!(
            self.provider.get(region, identity),
            Some(CacheItem::Value(_))
        )
    }

    /// Cache state just read from the executor.
    ///
    /// Never overwrites: an existing value (any strategy) or a soft lock
    /// leaves the slot untouched. Returns whether the value was stored.
    pub fn put_from_load(
        &self,
        config: &EntityCacheConfig,
        identity: &Identity,
        value: CachedValue,
    ) -> bool {
        let mut stored = false;
        let mut locked = false;
        let mut value = Some(value);
        self.provider
            .update(&config.region, identity, &mut |current| match current {
                None => {
                    stored = true;
                    value.take().map(CacheItem::Value)
                }
                Some(item) => {
                    locked = item.is_locked();
                    Some(item)
                }
            });
        if stored {
            self.stats.put();
        }
        if locked {
            self.stats.lock_bypass();
        }
        stored
    }

    /// Explicitly cache `value`, replacing any existing value.
    ///
    /// Read-only regions refuse to replace a present item. Soft-locked items
    /// are left alone (`Ok(false)`).
    pub fn put(
        &self,
        config: &EntityCacheConfig,
        identity: &Identity,
        value: CachedValue,
    ) -> Result<bool> {
        let read_only = config.strategy == CacheStrategy::ReadOnly;
        let mut outcome: Result<bool> = Ok(false);
        let mut value = Some(value);
        self.provider
            .update(&config.region, identity, &mut |current| match current {
                Some(item @ CacheItem::Locked(_)) => Some(item),
                Some(item @ CacheItem::Value(_)) if read_only => {
                    outcome = Err(violation(config, identity));
                    Some(item)
                }
                _ => {
                    outcome = Ok(true);
                    value.take().map(CacheItem::Value)
                }
            });
        if matches!(outcome, Ok(true)) {
            self.stats.put();
        }
        outcome
    }

    /// Drop whatever is cached for `identity` (value or soft lock).
    pub fn invalidate(&self, region: &str, identity: &Identity) -> bool {
        let removed = self.provider.remove(region, identity).is_some();
        if removed {
            self.stats.evicted(1);
            tracing::debug!(region, identity = %identity, "L2 invalidate");
        }
        removed
    }

    pub fn evict_region(&self, region: &str) -> usize {
        let dropped = self.provider.clear_region(region);
        self.stats.evicted(dropped as u64);
        tracing::debug!(region, dropped, "L2 region evicted");
        dropped
    }

    pub fn evict_all(&self) -> usize {
        let dropped = self.provider.clear();
        self.stats.evicted(dropped as u64);
        tracing::debug!(dropped, "L2 evicted");
        dropped
    }

    /// Reject writes the strategy forbids. Called for every pending write
    /// before the executor sees any of them.
    pub fn check_write(
        &self,
        config: &EntityCacheConfig,
        identity: &Identity,
        kind: WriteKind,
    ) -> Result<()> {
        if config.strategy == CacheStrategy::ReadOnly && kind == WriteKind::Update {
            return Err(violation(config, identity));
        }
        Ok(())
    }

    /// Cache side of a write, taken just before the executor runs it.
    pub fn before_write(
        &self,
        config: &EntityCacheConfig,
        identity: &Identity,
        kind: WriteKind,
        tx: &mut CacheTransaction,
    ) -> Result<()> {
        self.check_write(config, identity, kind)?;
        match (config.strategy, kind) {
            (CacheStrategy::ReadWrite, WriteKind::Update | WriteKind::Delete) => {
                if !tx.holds_lock(&config.region, identity) {
                    self.soft_lock(&config.region, identity);
                    tx.push(PendingAction::SoftLocked {
                        region: config.region.clone(),
                        identity: identity.clone(),
                        value: None,
                    });
                }
            }
            (
                CacheStrategy::ReadOnly | CacheStrategy::NonstrictReadWrite,
                WriteKind::Update | WriteKind::Delete,
            ) => {
                tx.push(PendingAction::EvictAfterCommit {
                    region: config.region.clone(),
                    identity: identity.clone(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// Cache side of a write the executor applied. `value` is the new state
    /// (`None` for deletes).
    pub fn after_write(
        &self,
        config: &EntityCacheConfig,
        identity: &Identity,
        kind: WriteKind,
        value: Option<CachedValue>,
        tx: &mut CacheTransaction,
    ) {
        match (config.strategy, kind) {
            (CacheStrategy::Transactional, _) => {
                let staged = match value {
                    Some(v) if kind != WriteKind::Delete => Staged::Put(v),
                    _ => Staged::Evict,
                };
                tx.stage(&config.region, identity, staged);
            }
            (_, WriteKind::Insert) => {
                if let Some(value) = value {
                    tx.push(PendingAction::PutAfterCommit {
                        region: config.region.clone(),
                        identity: identity.clone(),
                        value,
                    });
                }
            }
            (CacheStrategy::ReadWrite, WriteKind::Update) => {
                tx.set_locked_value(&config.region, identity, value);
            }
            (CacheStrategy::ReadWrite, WriteKind::Delete) => {
                tx.set_locked_value(&config.region, identity, None);
            }
            _ => {}
        }
    }

    fn soft_lock(&self, region: &str, identity: &Identity) {
        let lock_id = self.next_lock.fetch_add(1, Ordering::Relaxed);
        self.provider.update(region, identity, &mut |current| {
            let lock = match current {
                Some(CacheItem::Locked(mut held)) => {
                    held.holders += 1;
                    held.concurrent = true;
                    held
                }
                Some(CacheItem::Value(previous)) => SoftLock {
                    lock_id,
                    holders: 1,
                    concurrent: false,
                    previous: Some(previous),
                },
                None => SoftLock {
                    lock_id,
                    holders: 1,
                    concurrent: false,
                    previous: None,
                },
            };
            Some(CacheItem::Locked(lock))
        });
        tracing::trace!(region, identity = %identity, lock_id, "L2 soft lock");
    }

    /// Release a soft lock. The last holder installs `replacement`, unless
    /// another writer overlapped, in which case the item is dropped.
    fn release(&self, region: &str, identity: &Identity, replacement: Option<CachedValue>) {
        let mut replacement = replacement;
        let mut installed = false;
        self.provider.update(region, identity, &mut |current| match current {
            Some(CacheItem::Locked(mut lock)) if lock.holders > 1 => {
                lock.holders -= 1;
                lock.concurrent = true;
                Some(CacheItem::Locked(lock))
            }
            Some(CacheItem::Locked(lock)) if lock.concurrent => None,
            Some(CacheItem::Locked(_)) => {
                let next = replacement.take();
                installed = next.is_some();
                next.map(CacheItem::Value)
            }
            // Lock was invalidated underneath us; whatever is there may predate the write.
            Some(CacheItem::Value(_)) | None => None,
        });
        if installed {
            self.stats.put();
        }
    }

    /// Apply the unit of work's deferred cache actions after the executor committed.
    pub fn commit(&self, tx: CacheTransaction) {
        let CacheTransaction { actions, staged } = tx;
        let mut evicted = 0u64;
        for action in actions {
            match action {
                PendingAction::EvictAfterCommit { region, identity } => {
                    if self.provider.remove(&region, &identity).is_some() {
                        evicted += 1;
                    }
                }
                PendingAction::PutAfterCommit {
                    region,
                    identity,
                    value,
                } => {
                    let mut value = Some(value);
                    let mut stored = false;
                    self.provider
                        .update(&region, &identity, &mut |current| match current {
                            None => {
                                stored = true;
                                value.take().map(CacheItem::Value)
                            }
                            other => other,
                        });
                    if stored {
                        self.stats.put();
                    }
                }
                PendingAction::SoftLocked {
                    region,
                    identity,
                    value,
                } => self.release(&region, &identity, value),
            }
        }
        for ((region, identity), staged) in staged {
            match staged {
                Staged::Put(value) => {
                    let mut value = Some(value);
                    self.provider
                        .update(&region, &identity, &mut |_| value.take().map(CacheItem::Value));
                    self.stats.put();
                }
                Staged::Evict => {
                    if self.provider.remove(&region, &identity).is_some() {
                        evicted += 1;
                    }
                }
            }
        }
        self.stats.evicted(evicted);
    }

    /// Undo the unit of work's cache effects: soft locks restore the previous
    /// item, staged and deferred writes are discarded.
    pub fn rollback(&self, tx: CacheTransaction) {
        for action in tx.actions {
            if let PendingAction::SoftLocked {
                region, identity, ..
            } = action
            {
                self.provider
                    .update(&region, &identity, &mut |current| match current {
                        Some(CacheItem::Locked(mut lock)) if lock.holders > 1 => {
                            lock.holders -= 1;
                            lock.concurrent = true;
                            Some(CacheItem::Locked(lock))
                        }
                        Some(CacheItem::Locked(lock)) if lock.concurrent => None,
                        Some(CacheItem::Locked(lock)) => lock.previous.map(CacheItem::Value),
                        other => other,
                    });
            }
        }
    }
}

fn violation(config: &EntityCacheConfig, identity: &Identity) -> Error {
    Error::CacheImmutabilityViolation(CacheViolationError {
        region: config.region.clone(),
        identity: identity.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::Value;

    fn config(strategy: CacheStrategy) -> EntityCacheConfig {
        EntityCacheConfig {
            region: "orders".to_string(),
            strategy,
        }
    }

    fn state(total: i64, version: i64) -> CachedValue {
        CachedValue::encode(
            &[Value::BigInt(1), Value::BigInt(total)],
            Some(Value::BigInt(version)),
        )
        .unwrap()
    }

    fn order() -> Identity {
        Identity::new("Order", 1_i64)
    }

    #[test]
    fn test_read_only_rejects_replacement_and_updates() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::ReadOnly);
        assert!(cache.put(&cfg, &order(), state(100, 0)).unwrap());
        let err = cache.put(&cfg, &order(), state(150, 1)).unwrap_err();
        assert!(matches!(err, Error::CacheImmutabilityViolation(_)));
        assert!(matches!(
            cache.check_write(&cfg, &order(), WriteKind::Update),
            Err(Error::CacheImmutabilityViolation(_))
        ));
        assert!(cache.check_write(&cfg, &order(), WriteKind::Delete).is_ok());
        // The original value is untouched.
        let cached = cache.get(&cfg, &order(), None).unwrap();
        assert_eq!(cached.version(), Some(&Value::BigInt(0)));
    }

    #[test]
    fn test_read_only_removal_evicts_after_commit() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::ReadOnly);
        cache.put_from_load(&cfg, &order(), state(100, 0));

        let mut tx = CacheTransaction::new();
        cache
            .before_write(&cfg, &order(), WriteKind::Delete, &mut tx)
            .unwrap();
        cache.after_write(&cfg, &order(), WriteKind::Delete, None, &mut tx);
        assert!(cache.contains("orders", &order()));
        cache.commit(tx);
        assert!(!cache.contains("orders", &order()));
    }

    #[test]
    fn test_put_from_load_never_overwrites() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::NonstrictReadWrite);
        assert!(cache.put_from_load(&cfg, &order(), state(100, 0)));
        assert!(!cache.put_from_load(&cfg, &order(), state(150, 1)));
        let cached = cache.get(&cfg, &order(), None).unwrap();
        assert_eq!(cached.version(), Some(&Value::BigInt(0)));
    }

    #[test]
    fn test_nonstrict_evicts_only_after_commit() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::NonstrictReadWrite);
        cache.put_from_load(&cfg, &order(), state(100, 0));

        let mut tx = CacheTransaction::new();
        cache
            .before_write(&cfg, &order(), WriteKind::Update, &mut tx)
            .unwrap();
        cache.after_write(&cfg, &order(), WriteKind::Update, Some(state(150, 1)), &mut tx);
        // Stale window: others still see the old value.
        assert!(cache.get(&cfg, &order(), None).is_some());
        cache.commit(tx);
        assert!(cache.get(&cfg, &order(), None).is_none());
    }

    #[test]
    fn test_read_write_soft_lock_commit() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::ReadWrite);
        cache.put_from_load(&cfg, &order(), state(100, 0));

        let mut tx = CacheTransaction::new();
        cache
            .before_write(&cfg, &order(), WriteKind::Update, &mut tx)
            .unwrap();
        // Readers miss while locked; loads are ignored.
        assert!(cache.get(&cfg, &order(), None).is_none());
        assert!(!cache.put_from_load(&cfg, &order(), state(999, 9)));
        cache.after_write(&cfg, &order(), WriteKind::Update, Some(state(150, 1)), &mut tx);
        cache.commit(tx);

        let cached = cache.get(&cfg, &order(), None).unwrap();
        assert_eq!(cached.version(), Some(&Value::BigInt(1)));
        assert_eq!(cached.decode().unwrap()[1], Value::BigInt(150));
        assert!(cache.statistics().lock_bypasses >= 2);
    }

    #[test]
    fn test_read_write_rollback_restores_previous() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::ReadWrite);
        cache.put_from_load(&cfg, &order(), state(100, 0));

        let mut tx = CacheTransaction::new();
        cache
            .before_write(&cfg, &order(), WriteKind::Update, &mut tx)
            .unwrap();
        cache.after_write(&cfg, &order(), WriteKind::Update, Some(state(150, 1)), &mut tx);
        cache.rollback(tx);

        let cached = cache.get(&cfg, &order(), None).unwrap();
        assert_eq!(cached.version(), Some(&Value::BigInt(0)));
    }

    #[test]
    fn test_read_write_overlapping_writers_drop_item() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::ReadWrite);
        cache.put_from_load(&cfg, &order(), state(100, 0));

        let mut first = CacheTransaction::new();
        let mut second = CacheTransaction::new();
        cache
            .before_write(&cfg, &order(), WriteKind::Update, &mut first)
            .unwrap();
        cache
            .before_write(&cfg, &order(), WriteKind::Update, &mut second)
            .unwrap();
        cache.after_write(&cfg, &order(), WriteKind::Update, Some(state(150, 1)), &mut first);
        cache.commit(first);
        // Still locked by the second writer.
        assert!(cache.get(&cfg, &order(), None).is_none());
        cache.rollback(second);
        assert!(cache.get(&cfg, &order(), None).is_none());
        assert_eq!(cache.provider().len("orders"), 0);
    }

    #[test]
    fn test_transactional_staging() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::Transactional);
        cache.put_from_load(&cfg, &order(), state(100, 0));

        let mut tx = CacheTransaction::new();
        cache
            .before_write(&cfg, &order(), WriteKind::Update, &mut tx)
            .unwrap();
        cache.after_write(&cfg, &order(), WriteKind::Update, Some(state(150, 1)), &mut tx);

        // Writer sees its staged state, others the committed one.
        let own = cache.get(&cfg, &order(), Some(&tx)).unwrap();
        assert_eq!(own.version(), Some(&Value::BigInt(1)));
        let other = cache.get(&cfg, &order(), None).unwrap();
        assert_eq!(other.version(), Some(&Value::BigInt(0)));

        cache.commit(tx);
        let committed = cache.get(&cfg, &order(), None).unwrap();
        assert_eq!(committed.version(), Some(&Value::BigInt(1)));
    }

    #[test]
    fn test_transactional_rollback_discards_staged() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::Transactional);
        let mut tx = CacheTransaction::new();
        cache.after_write(&cfg, &order(), WriteKind::Insert, Some(state(100, 0)), &mut tx);
        cache.rollback(tx);
        assert!(cache.get(&cfg, &order(), None).is_none());
    }

    #[test]
    fn test_insert_cached_after_commit() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let cfg = config(CacheStrategy::ReadWrite);
        let mut tx = CacheTransaction::new();
        cache
            .before_write(&cfg, &order(), WriteKind::Insert, &mut tx)
            .unwrap();
        cache.after_write(&cfg, &order(), WriteKind::Insert, Some(state(100, 0)), &mut tx);
        assert!(!cache.contains("orders", &order()));
        cache.commit(tx);
        assert!(cache.contains("orders", &order()));
    }

    #[test]
    fn test_evict_region_and_all() {
        let cache = SecondLevelCache::in_memory(CacheConfig::default());
        let orders = config(CacheStrategy::ReadWrite);
        let customers = EntityCacheConfig {
            region: "customers".into(),
            strategy: CacheStrategy::ReadWrite,
        };
        cache.put_from_load(&orders, &order(), state(1, 0));
        cache.put_from_load(&customers, &Identity::new("Customer", 1_i64), state(1, 0));
        assert_eq!(cache.evict_region("orders"), 1);
        assert_eq!(cache.evict_all(), 1);
        assert_eq!(cache.statistics().evictions, 2);
        assert!(!cache.invalidate("orders", &order()));
    }
}
