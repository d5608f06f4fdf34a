//! Flush ordering and execution.
//!
//! Writes are applied in three phases:
//! - DELETE in reverse topological order of entity types (dependents first)
//! - INSERT in topological order (foreign-key targets first)
//! - UPDATE in registration order
//!
//! Within a phase, entities of equal type rank keep their registration order
//! in the unit of work. Type ranks come from the registry, which falls back to
//! declaration order when the type graph has a cycle.

use asupersync::{Cx, Outcome};
use relmap_cache::{CacheTransaction, CachedValue, SecondLevelCache, WriteKind};
use relmap_core::{EntityCacheConfig, Error, Executor, StaleStateError, WriteOp};
use std::cmp::Reverse;

/// One write produced by dirty checking, with what is needed to order it.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub op: WriteOp,
    /// Topological rank of the entity type.
    pub rank: usize,
    /// Registration sequence of the entity in the unit of work.
    pub sequence: usize,
    /// Cache settings of the entity type, if it is cached.
    pub cache: Option<EntityCacheConfig>,
    /// State to cache once the write is applied (`None` for deletes).
    pub cached: Option<CachedValue>,
}

impl PendingWrite {
    pub fn new(op: WriteOp, rank: usize, sequence: usize) -> Self {
        Self {
            op,
            rank,
            sequence,
            cache: None,
            cached: None,
        }
    }

    #[must_use]
    pub fn with_cache(
        mut self,
        config: Option<EntityCacheConfig>,
        cached: Option<CachedValue>,
    ) -> Self {
        self.cache = config;
        self.cached = cached;
        self
    }

    pub fn write_kind(&self) -> WriteKind {
        match self.op {
            WriteOp::Insert { .. } => WriteKind::Insert,
            WriteOp::Update { .. } => WriteKind::Update,
            WriteOp::Delete { .. } => WriteKind::Delete,
        }
    }
}

/// Orders pending writes into a [`FlushPlan`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushOrderer;

impl FlushOrderer {
    pub fn new() -> Self {
        Self
    }

    /// Split and sort writes into the three flush phases.
    pub fn order(&self, writes: Vec<PendingWrite>) -> FlushPlan {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for write in writes {
            match write.op {
                WriteOp::Delete { .. } => deletes.push(write),
                WriteOp::Insert { .. } => inserts.push(write),
                WriteOp::Update { .. } => updates.push(write),
            }
        }

        // Dependents first, ties by registration order
        deletes.sort_by_key(|w| (Reverse(w.rank), w.sequence));
        // Foreign-key targets first
        inserts.sort_by_key(|w| (w.rank, w.sequence));
        updates.sort_by_key(|w| w.sequence);

        FlushPlan {
            deletes,
            inserts,
            updates,
        }
    }
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Delete operations (dependents first).
    pub deletes: Vec<PendingWrite>,
    /// Insert operations (foreign-key targets first).
    pub inserts: Vec<PendingWrite>,
    /// Update operations (registration order).
    pub updates: Vec<PendingWrite>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    /// Writes in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingWrite> {
        self.deletes
            .iter()
            .chain(self.inserts.iter())
            .chain(self.updates.iter())
    }

    /// Reject writes a cache strategy forbids, before anything is executed.
    pub fn check_cache(&self, cache: &SecondLevelCache) -> relmap_core::Result<()> {
        for write in self.iter() {
            if let Some(config) = &write.cache {
                cache.check_write(config, write.op.identity(), write.write_kind())?;
            }
        }
        Ok(())
    }

    /// Execute the plan.
    ///
    /// An update or delete that affects no row means the row changed (or
    /// vanished) since it was read: the flush stops with `StaleEntityState`.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn execute<E: Executor>(
        &self,
        cx: &Cx,
        executor: &E,
        mut cache: Option<(&SecondLevelCache, &mut CacheTransaction)>,
    ) -> Outcome<FlushResult, Error> {
        tracing::info!(
            deletes = self.deletes.len(),
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for write in self.iter() {
            let kind = write.write_kind();
            let identity = write.op.identity();

            if let (Some((l2, tx)), Some(config)) = (cache.as_mut(), &write.cache) {
                if let Err(e) = l2.before_write(config, identity, kind, tx) {
                    return Outcome::Err(e);
                }
            }

            tracing::trace!(op = %write.op, "Executing write");
            let affected = match executor.execute(cx, &write.op).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            if affected == 0 && kind != WriteKind::Insert {
                tracing::warn!(op = %write.op, "Write affected no rows");
                return Outcome::Err(Error::StaleEntityState(StaleStateError {
                    identity: identity.clone(),
                    expected_version: write.op.expected_version().cloned(),
                    operation: write.op.kind(),
                }));
            }

            if let (Some((l2, tx)), Some(config)) = (cache.as_mut(), &write.cache) {
                l2.after_write(config, identity, kind, write.cached.clone(), tx);
            }

            match kind {
                WriteKind::Insert => result.inserted += 1,
                WriteKind::Update => result.updated += 1,
                WriteKind::Delete => result.deleted += 1,
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );

        Outcome::Ok(result)
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of writes performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}
