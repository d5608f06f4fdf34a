//! Unit of work for relmap.
//!
//! `relmap-session` is the **persistence-context layer**. A [`Session`] owns
//! one executor transaction and coordinates everything that happens to
//! entities inside it:
//!
//! - **Identity map**: at most one managed instance per `(type, key)`.
//! - **Dirty checking**: load-time snapshots compared at flush.
//! - **Cascades**: persist, merge, remove, refresh and detach follow the
//!   relationship metadata, with orphan removal at flush.
//! - **Deferred relationships**: links hold identities and load on first
//!   access through [`DeferredHandle`]s bound to the session.
//! - **Second-level cache**: reads consult it, writes follow the strategy of
//!   each entity type, and nothing becomes visible before commit.
//! - **Locking**: optimistic version predicates on every versioned write and
//!   pessimistic locks requested through the executor.
//!
//! # Lifecycle
//!
//! An entry is *new-unflushed* after `persist`, *managed* after a load or a
//! successful flush, *removed* after `remove` and *detached* once the session
//! lets go of it. A failed flush leaves the session **failed**: only
//! `rollback` and `close` are accepted afterwards. `commit` flushes, commits
//! the executor transaction, publishes second-level cache effects and closes
//! the session.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(executor, registry, Some(cache), SessionConfig::default());
//!
//! let order = session.find(&cx, "Order", 1_i64).await?;
//! write(&order).set("total", 150_i64)?;
//!
//! let line = Arc::new(RwLock::new(Instance::new(line_desc).with("id", 10_i64)?));
//! write(&order).add_to("lines", Identity::new("OrderLine", 10_i64))?;
//! session.persist_with(&order, [line])?;
//!
//! session.commit(&cx).await?;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod events;
pub mod flush;
pub mod identity_map;
pub mod lazy;
pub mod lock;

pub use cascade::{CascadeEngine, CascadeStep, GraphView, Orphan};
pub use change_tracker::{
    AttributeChange, ChangeKind, ChangeSet, CollectionChange, DirtyChecker, ReferenceChange,
};
pub use events::{LifecycleCallbacks, LifecycleEvent, LifecycleView, PendingCounts};
pub use flush::{FlushOrderer, FlushPlan, FlushResult, PendingWrite};
pub use identity_map::{EntryHandle, EntryStatus, IdentityMap, ManagedEntry};
pub use lazy::{DeferredHandle, Resolved};
pub use lock::LockCoordinator;

use asupersync::{Cx, Outcome};
use relmap_cache::{CacheTransaction, CachedValue, SecondLevelCache};
use relmap_core::{
    CascadeError, CascadeOp, ColumnInfo, DetachedAccessError, DetachedReason, EntityDescriptor,
    EntityRef, Error, Executor, Fetch, FetchPolicy, Identity, Instance, Lazy, Link, LockMode,
    LockOptions, QuerySpec, Registry, Result, Row, StaleStateError, Value, WriteOp, instance,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Begin the executor transaction on the first operation that needs it.
    pub auto_begin: bool,
    /// Deepest relationship path a cascade may follow.
    pub max_cascade_depth: usize,
    /// Most entities a single cascade may visit.
    pub max_cascade_steps: usize,
    /// Consult and maintain the second-level cache.
    pub use_second_level_cache: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            max_cascade_depth: 64,
            max_cascade_steps: 10_000,
            use_second_level_cache: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    #[must_use]
    pub fn cascade_limits(mut self, max_depth: usize, max_steps: usize) -> Self {
        self.max_cascade_depth = max_depth;
        self.max_cascade_steps = max_steps;
        self
    }

    #[must_use]
    pub fn second_level_cache(mut self, value: bool) -> Self {
        self.use_second_level_cache = value;
        self
    }
}

/// Where a unit of work is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    /// A flush aborted; only rollback and close are accepted.
    Failed,
    Closed,
}

/// Counters kept by a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatistics {
    /// Rows turned into managed instances (executor and cache).
    pub entities_loaded: u64,
    /// Loads answered by the second-level cache.
    pub cache_hits: u64,
    /// Executor round trips.
    pub fetches: u64,
    /// Executor round trips caused by deferred relationships.
    pub lazy_loads: u64,
    pub flushes: u64,
    pub writes: u64,
    /// Lock requests sent to the executor.
    pub locks_acquired: u64,
}

/// Summary of a unit of work for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    pub state: SessionState,
    pub pending: PendingCounts,
    pub in_transaction: bool,
    pub locks_held: usize,
    pub cache_actions: usize,
    pub statistics: SessionStatistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Executor,
    Cache,
}

/// Writes computed for one flush plus the bookkeeping applied after it succeeds.
#[derive(Debug, Default)]
struct PreparedFlush {
    plan: FlushPlan,
    forced: Vec<Identity>,
    versions: Vec<(Identity, Value)>,
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work.
///
/// Managed instances are shared as [`EntityRef`]s; the session never hands
/// out two instances for the same identity.
pub struct Session<E: Executor> {
    executor: E,
    registry: Arc<Registry>,
    cache: Option<Arc<SecondLevelCache>>,
    config: SessionConfig,
    identity_map: IdentityMap,
    locks: LockCoordinator,
    cascade: CascadeEngine,
    cache_tx: CacheTransaction,
    callbacks: LifecycleCallbacks,
    /// Binding token; instances and handles hold a `Weak` to it.
    token: Arc<()>,
    state: SessionState,
    failure: Option<String>,
    in_transaction: bool,
    /// Immediate relationships still to load: (owner, relationship index).
    pending_immediate: Vec<(Identity, usize)>,
    /// Rows this unit of work deleted; the cache may still hold them.
    deleted: HashSet<Identity>,
    stats: SessionStatistics,
}

impl<E: Executor> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("tracked", &self.identity_map.len())
            .field("in_transaction", &self.in_transaction)
            .field("locks", &self.locks.len())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl<E: Executor> Session<E> {
    /// Create a unit of work over `executor`.
    pub fn new(
        executor: E,
        registry: Arc<Registry>,
        cache: Option<Arc<SecondLevelCache>>,
        config: SessionConfig,
    ) -> Self {
        let cascade = CascadeEngine::new(config.max_cascade_depth, config.max_cascade_steps);
        Self {
            executor,
            registry,
            cache,
            config,
            identity_map: IdentityMap::new(),
            locks: LockCoordinator::new(),
            cascade,
            cache_tx: CacheTransaction::new(),
            callbacks: LifecycleCallbacks::default(),
            token: Arc::new(()),
            state: SessionState::Active,
            failure: None,
            in_transaction: false,
            pending_immediate: Vec::new(),
            deleted: HashSet::new(),
            stats: SessionStatistics::default(),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.stats
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Register a lifecycle callback.
    ///
    /// `Pre*` callbacks can veto the operation by returning `Err`.
    pub fn on(
        &mut self,
        event: LifecycleEvent,
        f: impl FnMut(&LifecycleView<'_>) -> std::result::Result<(), Error> + Send + 'static,
    ) {
        self.callbacks.register(event, f);
    }

    // ========================================================================
    // Guards
    // ========================================================================

    fn binding(&self) -> Weak<()> {
        Arc::downgrade(&self.token)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Failed => Err(Error::UnitOfWorkFailed(
                self.failure.clone().unwrap_or_default(),
            )),
            SessionState::Closed => Err(Error::Closed),
        }
    }

    fn fail(&mut self, error: &Error) {
        if self.state == SessionState::Active {
            tracing::warn!(error = %error, "Unit of work failed; rollback required");
            self.state = SessionState::Failed;
            self.failure = Some(error.to_string());
        }
    }

    fn l2(&self) -> Option<&SecondLevelCache> {
        if self.config.use_second_level_cache {
            self.cache.as_deref()
        } else {
            None
        }
    }

    fn descriptor(&self, entity: &str) -> Result<Arc<EntityDescriptor>> {
        self.registry.require(entity).map(Arc::clone)
    }

    /// Identity of `entity`, provided it is the instance this session manages.
    fn managed_identity(&self, entity: &EntityRef) -> Result<Identity> {
        let identity = {
            let inst = instance::read(entity);
            inst.check_binding(&self.binding())?;
            inst.require_identity()?
        };
        match self.identity_map.get(&identity) {
            Some(entry) if Arc::ptr_eq(entry.instance(), entity) => Ok(identity),
            _ => Err(not_managed(identity, None)),
        }
    }

    async fn ensure_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction || !self.config.auto_begin {
            return Outcome::Ok(());
        }
        self.begin(cx).await
    }

    /// Begin the executor transaction explicitly.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        if self.in_transaction {
            return Outcome::Ok(());
        }
        match self.executor.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.in_transaction = true;
        tracing::debug!("Transaction started");
        Outcome::Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Managed instance for `identity` without any I/O.
    pub fn lookup(&self, entity: &str, key: impl Into<Value>) -> Option<EntityRef> {
        self.identity_map.find(&Identity::new(entity, key))
    }

    /// Whether `(entity, key)` is managed (new-unflushed or managed).
    pub fn contains(&self, entity: &str, key: impl Into<Value>) -> bool {
        self.lookup(entity, key).is_some()
    }

    /// Find an entity by primary key.
    ///
    /// The identity map answers first, then the second-level cache, then the
    /// executor. Entities removed in this unit of work are not found.
    #[tracing::instrument(level = "debug", skip(self, cx, key))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &str,
        key: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let descriptor = match self.descriptor(entity) {
            Ok(d) => d,
            Err(e) => return Outcome::Err(e),
        };
        let identity = Identity::new(Arc::clone(descriptor.name_arc()), key);
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let found = match self.find_identity(cx, &identity).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.drain_immediate(cx).await {
            Outcome::Ok(()) => Outcome::Ok(found),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn find_identity(
        &mut self,
        cx: &Cx,
        identity: &Identity,
    ) -> Outcome<Option<EntityRef>, Error> {
        if let Some(entry) = self.identity_map.get(identity) {
            return Outcome::Ok(match entry.status() {
                EntryStatus::Removed | EntryStatus::Detached => None,
                EntryStatus::Managed | EntryStatus::NewUnflushed => {
                    Some(Arc::clone(entry.instance()))
                }
            });
        }
        let descriptor = match self.descriptor(identity.entity()) {
            Ok(d) => d,
            Err(e) => return Outcome::Err(e),
        };

        if !self.deleted.contains(identity) {
            if let Some(hit) = self.cache_lookup(&descriptor, identity) {
                return match hit {
                    Ok((_, entity)) => Outcome::Ok(Some(entity)),
                    Err(e) => Outcome::Err(e),
                };
            }
        }

        let rows = match self.executor.fetch(cx, &Fetch::ById(identity.clone())).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.stats.fetches += 1;
        match rows.first() {
            None => Outcome::Ok(None),
            Some(row) => match self.register_row(&descriptor, row, Source::Executor) {
                Ok((_, entity)) => Outcome::Ok(Some(entity)),
                Err(e) => Outcome::Err(e),
            },
        }
    }

    fn cache_lookup(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        identity: &Identity,
    ) -> Option<Result<(Identity, EntityRef)>> {
        let config = descriptor.cache()?;
        let cached = self.l2()?.get(config, identity, Some(&self.cache_tx))?;
        self.stats.cache_hits += 1;
        tracing::trace!(identity = %identity, "Loaded from second-level cache");
        Some(cached.decode().and_then(|values| {
            let row = Row::with_columns(
                Arc::clone(descriptor.name_arc()),
                Arc::new(ColumnInfo::for_entity(descriptor)),
                values,
            );
            self.register_row(descriptor, &row, Source::Cache)
        }))
    }

    /// Turn a row into the managed instance for its identity.
    ///
    /// An instance already managed for that identity wins; the row is dropped.
    fn register_row(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        row: &Row,
        source: Source,
    ) -> Result<(Identity, EntityRef)> {
        let mut loaded = Instance::from_row(Arc::clone(descriptor), row)?;
        let identity = loaded.require_identity()?;
        if let Some(entry) = self.identity_map.get(&identity) {
            return Ok((identity, Arc::clone(entry.instance())));
        }

        let version = loaded.version().cloned();
        let snapshot = loaded.snapshot();
        if source == Source::Executor {
            if let (Some(l2), Some(config)) = (self.l2(), descriptor.cache()) {
                let value = CachedValue::encode(loaded.to_row().values(), version.clone())?;
                l2.put_from_load(config, &identity, value);
            }
        }
        loaded.bind(self.binding());

        let entity = Arc::new(RwLock::new(loaded));
        self.identity_map.register(
            identity.clone(),
            Arc::clone(&entity),
            Some(snapshot),
            version,
        )?;
        self.stats.entities_loaded += 1;
        for (idx, rel) in descriptor.relationships().iter().enumerate() {
            if rel.fetch == FetchPolicy::Immediate {
                self.pending_immediate.push((identity.clone(), idx));
            }
        }
        Ok((identity, entity))
    }

    /// Load every queued immediate relationship, including those of rows it loads.
    async fn drain_immediate(&mut self, cx: &Cx) -> Outcome<(), Error> {
        while let Some((owner, idx)) = self.pending_immediate.pop() {
            if self.identity_map.find(&owner).is_none() {
                continue;
            }
            match self.load_link(cx, &owner, idx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Execute a translated query and return managed instances.
    ///
    /// Rows whose identity is already managed resolve to the managed
    /// instance; rows of entities removed in this unit of work are skipped.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %spec.entity))]
    pub async fn query(&mut self, cx: &Cx, spec: &QuerySpec) -> Outcome<Vec<EntityRef>, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let descriptor = match self.descriptor(&spec.entity) {
            Ok(d) => d,
            Err(e) => return Outcome::Err(e),
        };
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let rows = match self.executor.fetch(cx, &Fetch::Query(spec.clone())).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.stats.fetches += 1;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let (identity, entity) = match self.register_row(&descriptor, row, Source::Executor) {
                Ok(registered) => registered,
                Err(e) => return Outcome::Err(e),
            };
            if self.identity_map.find(&identity).is_some() {
                results.push(entity);
            }
        }
        tracing::debug!(rows = rows.len(), returned = results.len(), "Query complete");

        match self.drain_immediate(cx).await {
            Outcome::Ok(()) => Outcome::Ok(results),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Deferred Relationships
    // ========================================================================

    /// A handle to `relationship` of a managed entity, bound to this session.
    pub fn deferred(&self, entity: &EntityRef, relationship: &str) -> Result<DeferredHandle> {
        let identity = self.managed_identity(entity)?;
        self.ensure_active()?;
        self.descriptor(identity.entity())?
            .require_relationship(relationship)?;
        Ok(DeferredHandle::new(identity, relationship, self.binding()))
    }

    /// Resolve a deferred handle. Only the first access of a relationship hits the executor.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(owner = %handle.owner(), relationship = handle.relationship())
    )]
    pub async fn resolve(&mut self, cx: &Cx, handle: &DeferredHandle) -> Outcome<Resolved, Error> {
        // A stale handle reports why it is stale before the session state.
        if let Err(e) = handle.check(&self.binding()) {
            return Outcome::Err(e);
        }
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        if self.identity_map.find(handle.owner()).is_none() {
            return Outcome::Err(not_managed(
                handle.owner().clone(),
                Some(handle.relationship().to_string()),
            ));
        }
        let idx = match self
            .descriptor(handle.owner().entity())
            .and_then(|d| d.require_relationship(handle.relationship()))
        {
            Ok(idx) => idx,
            Err(e) => return Outcome::Err(e),
        };
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let resolved = match self.load_link(cx, handle.owner(), idx).await {
            Outcome::Ok(resolved) => resolved,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.drain_immediate(cx).await {
            Outcome::Ok(()) => Outcome::Ok(resolved),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Target of a single-valued relationship.
    pub async fn related(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        relationship: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        let handle = match self.deferred(entity, relationship) {
            Ok(handle) => handle,
            Err(e) => return Outcome::Err(e),
        };
        match self.resolve(cx, &handle).await {
            Outcome::Ok(resolved) => Outcome::Ok(resolved.into_single()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Members of a collection relationship.
    pub async fn related_many(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        relationship: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let handle = match self.deferred(entity, relationship) {
            Ok(handle) => handle,
            Err(e) => return Outcome::Err(e),
        };
        match self.resolve(cx, &handle).await {
            Outcome::Ok(resolved) => Outcome::Ok(resolved.into_many()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Load relationship `idx` of managed `owner` if needed and return its targets.
    async fn load_link(
        &mut self,
        cx: &Cx,
        owner: &Identity,
        idx: usize,
    ) -> Outcome<Resolved, Error> {
        let Some(entity) = self.identity_map.find(owner) else {
            return Outcome::Err(not_managed(owner.clone(), None));
        };
        let (descriptor, link) = {
            let inst = instance::read(&entity);
            (Arc::clone(inst.descriptor()), inst.links()[idx].clone())
        };
        let rel = &descriptor.relationships()[idx];

        match link {
            Link::Single(Lazy::Loaded(None)) => Outcome::Ok(Resolved::Single(None)),
            Link::Single(Lazy::Loaded(Some(target))) => {
                if !self.identity_map.contains(&target) {
                    self.stats.lazy_loads += 1;
                }
                match self.find_identity(cx, &target).await {
                    Outcome::Ok(found) => Outcome::Ok(Resolved::Single(found)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            Link::Many(Lazy::Loaded(members)) => {
                match self.load_members(cx, &rel.target, &members).await {
                    Outcome::Ok(found) => Outcome::Ok(Resolved::Many(found)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            Link::Single(Lazy::Unloaded) | Link::Many(Lazy::Unloaded) => {
                let fetch = Fetch::Collection {
                    owner: owner.clone(),
                    relationship: rel.name.clone(),
                };
                let rows = match self.executor.fetch(cx, &fetch).await {
                    Outcome::Ok(rows) => rows,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                self.stats.fetches += 1;
                self.stats.lazy_loads += 1;

                let target = match self.descriptor(&rel.target) {
                    Ok(d) => d,
                    Err(e) => return Outcome::Err(e),
                };
                let mut ids = Vec::with_capacity(rows.len());
                let mut members = Vec::with_capacity(rows.len());
                for row in &rows {
                    match self.register_row(&target, row, Source::Executor) {
                        Ok((id, member)) => {
                            if self.identity_map.find(&id).is_some() {
                                members.push(member);
                            }
                            ids.push(id);
                        }
                        Err(e) => return Outcome::Err(e),
                    }
                }
                tracing::debug!(
                    owner = %owner,
                    relationship = %rel.name,
                    rows = rows.len(),
                    "Deferred relationship loaded"
                );

                let loaded = if rel.is_collection() {
                    Link::Many(Lazy::Loaded(ids))
                } else {
                    Link::Single(Lazy::Loaded(ids.into_iter().next()))
                };
                instance::write(&entity).set_link(idx, loaded.clone());
                if let Some(snapshot) = self
                    .identity_map
                    .get_mut(owner)
                    .and_then(ManagedEntry::snapshot_mut)
                {
                    if let Some(slot) = snapshot.links.get_mut(idx) {
                        *slot = loaded;
                    }
                }

                if rel.is_collection() {
                    Outcome::Ok(Resolved::Many(members))
                } else {
                    Outcome::Ok(Resolved::Single(members.into_iter().next()))
                }
            }
        }
    }

    /// Managed instances for `members`, fetching the missing ones in one round trip.
    async fn load_members(
        &mut self,
        cx: &Cx,
        entity: &str,
        members: &[Identity],
    ) -> Outcome<Vec<EntityRef>, Error> {
        let missing: Vec<Value> = members
            .iter()
            .filter(|id| !self.identity_map.contains(id))
            .map(|id| id.key().clone())
            .collect();

        if !missing.is_empty() {
            let descriptor = match self.descriptor(entity) {
                Ok(d) => d,
                Err(e) => return Outcome::Err(e),
            };
            let fetch = Fetch::ByIds {
                entity: entity.to_string(),
                keys: missing,
            };
            let rows = match self.executor.fetch(cx, &fetch).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            self.stats.fetches += 1;
            self.stats.lazy_loads += 1;
            for row in &rows {
                if let Err(e) = self.register_row(&descriptor, row, Source::Executor) {
                    return Outcome::Err(e);
                }
            }
        }

        Outcome::Ok(
            members
                .iter()
                .filter_map(|id| self.identity_map.find(id))
                .collect(),
        )
    }

    // ========================================================================
    // Persist / Merge
    // ========================================================================

    /// Make a new entity managed; it is inserted at the next flush.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.persist_with(entity, Vec::new())
    }

    /// Persist `entity` and, through persist cascades, any of `related` it reaches.
    ///
    /// Links hold identities only, so the instances behind new identities are
    /// supplied in `related`. Already managed targets are taken from the
    /// identity map.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn persist_with(
        &mut self,
        entity: &EntityRef,
        related: impl IntoIterator<Item = EntityRef>,
    ) -> Result<()> {
        self.ensure_active()?;
        let pool = pool(related)?;
        let steps = {
            let map = &self.identity_map;
            let view = |id: &Identity| map.find(id).or_else(|| pool.get(id).cloned());
            self.cascade.expand(CascadeOp::Persist, entity, &view)?
        };

        let token = self.binding();
        let mut fresh = Vec::new();
        for step in &steps {
            {
                let inst = instance::read(&step.instance);
                self.registry.require(inst.entity_name())?;
                match inst.check_binding(&token) {
                    Ok(()) => {}
                    Err(Error::DetachedAccess(DetachedAccessError {
                        reason: DetachedReason::SessionClosed,
                        ..
                    })) => {}
                    Err(e) => return Err(e),
                }
            }
            match self.identity_map.get(&step.identity) {
                Some(entry) if Arc::ptr_eq(entry.instance(), &step.instance) => {
                    if entry.status() == EntryStatus::Removed {
                        return Err(Error::lifecycle(
                            Some(&step.identity),
                            "removed entities cannot be persisted again in the same unit of work",
                        ));
                    }
                }
                Some(_) => return Err(Error::DuplicateIdentity(step.identity.clone())),
                None => fresh.push(step),
            }
        }

        let pending = self.pending_counts();
        for step in &fresh {
            let inst = instance::read(&step.instance);
            self.callbacks.fire(&LifecycleView::entity(
                LifecycleEvent::PrePersist,
                &step.identity,
                &inst,
                pending,
            ))?;
        }
        for step in &fresh {
            self.identity_map
                .mark_new(step.identity.clone(), Arc::clone(&step.instance))?;
            instance::write(&step.instance).bind(token.clone());
        }
        tracing::debug!(persisted = fresh.len(), visited = steps.len(), "Persist scheduled");
        Ok(())
    }

    /// Copy a detached entity's state onto its managed instance and return that instance.
    pub async fn merge(&mut self, cx: &Cx, detached: &EntityRef) -> Outcome<EntityRef, Error> {
        self.merge_with(cx, detached, Vec::new()).await
    }

    /// Merge `detached` and, through merge cascades, any of `related` it reaches.
    ///
    /// Targets are merged before the entities that reference them. A managed
    /// copy is loaded when needed; its version must match the detached one.
    /// Identities unknown to the store become new entities.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn merge_with(
        &mut self,
        cx: &Cx,
        detached: &EntityRef,
        related: Vec<EntityRef>,
    ) -> Outcome<EntityRef, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let root = match instance::read(detached).require_identity() {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let mut pool = match pool(related) {
            Ok(pool) => pool,
            Err(e) => return Outcome::Err(e),
        };
        pool.insert(root.clone(), Arc::clone(detached));

        let steps = {
            let map = &self.identity_map;
            let view = |id: &Identity| pool.get(id).cloned().or_else(|| map.find(id));
            match self.cascade.expand(CascadeOp::Merge, detached, &view) {
                Ok(steps) => steps,
                Err(e) => return Outcome::Err(e),
            }
        };
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let mut merged_root = None;
        for step in &steps {
            let managed = match self.merge_one(cx, step).await {
                Outcome::Ok(managed) => managed,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if step.identity == root {
                merged_root = Some(managed);
            }
        }
        tracing::debug!(merged = steps.len(), "Merge complete");

        match merged_root {
            Some(managed) => match self.drain_immediate(cx).await {
                Outcome::Ok(()) => Outcome::Ok(managed),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            None => Outcome::Err(Error::lifecycle(Some(&root), "merge did not reach its root")),
        }
    }

    async fn merge_one(&mut self, cx: &Cx, step: &CascadeStep) -> Outcome<EntityRef, Error> {
        if let Some(entry) = self.identity_map.get(&step.identity) {
            if Arc::ptr_eq(entry.instance(), &step.instance) {
                return Outcome::Ok(Arc::clone(&step.instance));
            }
            if entry.status() == EntryStatus::Removed {
                return Outcome::Err(Error::lifecycle(
                    Some(&step.identity),
                    "cannot merge into an entity removed in this unit of work",
                ));
            }
        }

        let source = instance::read(&step.instance).clone();
        if let Err(e) = self.registry.require(source.entity_name()) {
            return Outcome::Err(e);
        }
        let existing = match self.find_identity(cx, &step.identity).await {
            Outcome::Ok(existing) => existing,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match existing {
            Some(target) => {
                let mut managed = instance::write(&target);
                let held = managed.version().cloned();
                let detached_version = source.version().filter(|v| !v.is_null());
                if let Err(e) = LockCoordinator::verify(
                    &step.identity,
                    "merge",
                    detached_version,
                    held.as_ref(),
                ) {
                    return Outcome::Err(e);
                }
                if let Err(e) = managed.copy_state_from(&source) {
                    return Outcome::Err(e);
                }
                if let Some(version) = held {
                    managed.set_version(version);
                }
                drop(managed);
                Outcome::Ok(target)
            }
            None => {
                let mut copy = source;
                copy.bind(self.binding());
                let entity = Arc::new(RwLock::new(copy));
                let pending = self.pending_counts();
                {
                    let inst = instance::read(&entity);
                    if let Err(e) = self.callbacks.fire(&LifecycleView::entity(
                        LifecycleEvent::PrePersist,
                        &step.identity,
                        &inst,
                        pending,
                    )) {
                        return Outcome::Err(e);
                    }
                }
                if let Err(e) = self
                    .identity_map
                    .mark_new(step.identity.clone(), Arc::clone(&entity))
                {
                    return Outcome::Err(e);
                }
                Outcome::Ok(entity)
            }
        }
    }

    // ========================================================================
    // Remove / Refresh / Detach
    // ========================================================================

    /// Schedule a managed entity (and its remove cascades) for deletion.
    ///
    /// Deferred relationships on remove-cascade paths are loaded first.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn remove(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let identity = match self.managed_identity(entity) {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        if self.identity_map.get(&identity).map(ManagedEntry::status) == Some(EntryStatus::Removed)
        {
            return Outcome::Ok(());
        }
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.initialize_cascade(cx, entity, CascadeOp::Remove).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let steps = {
            let map = &self.identity_map;
            let view = |id: &Identity| map.find(id);
            match self.cascade.expand(CascadeOp::Remove, entity, &view) {
                Ok(steps) => steps,
                Err(e) => return Outcome::Err(e),
            }
        };
        match self.schedule_removal(&steps) {
            Ok(removed) => {
                tracing::debug!(identity = %identity, removed, "Removal scheduled");
                Outcome::Ok(())
            }
            Err(e) => Outcome::Err(e),
        }
    }

    /// Load every relationship `op` cascades through, starting at `root`.
    async fn initialize_cascade(
        &mut self,
        cx: &Cx,
        root: &EntityRef,
        op: CascadeOp,
    ) -> Outcome<(), Error> {
        let root_id = match instance::read(root).require_identity() {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let mut queue = vec![(Arc::clone(root), 0_usize)];
        let mut seen = HashSet::new();

        while let Some((entity, depth)) = queue.pop() {
            let (identity, descriptor) = {
                let inst = instance::read(&entity);
                (inst.identity(), Arc::clone(inst.descriptor()))
            };
            let Some(identity) = identity else { continue };
            if !seen.insert(identity.clone()) {
                continue;
            }
            if depth > self.config.max_cascade_depth || seen.len() > self.config.max_cascade_steps
            {
                return Outcome::Err(Error::OrphanCascadeCycle(CascadeError {
                    root: root_id,
                    operation: op.as_str(),
                    depth,
                    steps: seen.len(),
                }));
            }
            if self.identity_map.find(&identity).is_none() {
                continue;
            }
            for (idx, rel) in descriptor.relationships().iter().enumerate() {
                if !rel.cascade.contains(op) {
                    continue;
                }
                let resolved = match self.load_link(cx, &identity, idx).await {
                    Outcome::Ok(resolved) => resolved,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                queue.extend(resolved.into_many().into_iter().map(|t| (t, depth + 1)));
            }
        }
        Outcome::Ok(())
    }

    fn schedule_removal(&mut self, steps: &[CascadeStep]) -> Result<usize> {
        let targets: Vec<&CascadeStep> = steps
            .iter()
            .filter(|s| {
                matches!(
                    self.identity_map.get(&s.identity).map(ManagedEntry::status),
                    Some(EntryStatus::Managed | EntryStatus::NewUnflushed)
                )
            })
            .collect();

        let pending = self.pending_counts();
        for step in &targets {
            let inst = instance::read(&step.instance);
            self.callbacks.fire(&LifecycleView::entity(
                LifecycleEvent::PreRemove,
                &step.identity,
                &inst,
                pending,
            ))?;
        }
        for step in &targets {
            self.identity_map.mark_removed(&step.identity)?;
            tracing::trace!(identity = %step.identity, implicit = step.implicit, "Marked removed");
        }
        Ok(targets.len())
    }

    /// Re-read a managed entity (and its refresh cascades) from the executor.
    ///
    /// Bypasses the second-level cache and discards in-memory changes.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn refresh(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let identity = match self.managed_identity(entity) {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let stored = self
            .identity_map
            .get(&identity)
            .is_some_and(|e| e.status() == EntryStatus::Managed && e.in_store());
        if !stored {
            return Outcome::Err(Error::lifecycle(
                Some(&identity),
                "only managed entities that exist in the store can be refreshed",
            ));
        }
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let steps = {
            let map = &self.identity_map;
            let view = |id: &Identity| map.find(id);
            match self.cascade.expand(CascadeOp::Refresh, entity, &view) {
                Ok(steps) => steps,
                Err(e) => return Outcome::Err(e),
            }
        };

        for step in &steps {
            let stored = self
                .identity_map
                .get(&step.identity)
                .is_some_and(|e| e.status() == EntryStatus::Managed && e.in_store());
            if !stored {
                continue;
            }
            let rows = match self
                .executor
                .fetch(cx, &Fetch::ById(step.identity.clone()))
                .await
            {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            self.stats.fetches += 1;
            if let Err(e) = self.apply_refresh(&step.identity, &step.instance, rows.first()) {
                return Outcome::Err(e);
            }
        }
        tracing::debug!(refreshed = steps.len(), "Refresh complete");

        match self.drain_immediate(cx).await {
            Outcome::Ok(()) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn apply_refresh(
        &mut self,
        identity: &Identity,
        entity: &EntityRef,
        row: Option<&Row>,
    ) -> Result<()> {
        let Some(row) = row else {
            return Err(Error::StaleEntityState(StaleStateError {
                identity: identity.clone(),
                expected_version: self
                    .identity_map
                    .get(identity)
                    .and_then(|e| e.version().cloned()),
                operation: "refresh",
            }));
        };
        let descriptor = self.descriptor(identity.entity())?;
        let fresh = Instance::from_row(Arc::clone(&descriptor), row)?;
        let (snapshot, version) = {
            let mut inst = instance::write(entity);
            inst.overwrite_from(fresh);
            (inst.snapshot(), inst.version().cloned())
        };
        if let Some(entry) = self.identity_map.get_mut(identity) {
            entry.set_snapshot(snapshot, version);
        }
        for (idx, rel) in descriptor.relationships().iter().enumerate() {
            if rel.fetch == FetchPolicy::Immediate {
                self.pending_immediate.push((identity.clone(), idx));
            }
        }
        Ok(())
    }

    /// Stop managing an entity and whatever its detach cascades reach.
    ///
    /// Pending changes of detached entities are never written.
    pub fn detach(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_active()?;
        self.managed_identity(entity)?;
        let steps = {
            let map = &self.identity_map;
            let view = |id: &Identity| map.find(id);
            self.cascade.expand(CascadeOp::Detach, entity, &view)?
        };
        let mut detached = 0;
        for step in &steps {
            let live = matches!(
                self.identity_map.get(&step.identity).map(ManagedEntry::status),
                Some(EntryStatus::Managed | EntryStatus::NewUnflushed)
            );
            if live {
                self.identity_map.detach(&step.identity)?;
                self.locks.forget(&step.identity);
                detached += 1;
            }
        }
        tracing::debug!(detached, "Detach complete");
        Ok(())
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Find an entity and lock it.
    ///
    /// Pessimistic modes go through the executor (once per identity and
    /// strength); `OptimisticForceIncrement` only schedules a version bump.
    #[tracing::instrument(level = "debug", skip(self, cx, key))]
    pub async fn find_with_lock(
        &mut self,
        cx: &Cx,
        entity: &str,
        key: impl Into<Value>,
        options: LockOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let descriptor = match self.descriptor(entity) {
            Ok(d) => d,
            Err(e) => return Outcome::Err(e),
        };
        let identity = Identity::new(Arc::clone(descriptor.name_arc()), key);
        let found = match self.lock_identity(cx, &identity, options).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.drain_immediate(cx).await {
            Outcome::Ok(()) => Outcome::Ok(found),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Lock an entity this session already manages.
    pub async fn acquire_lock(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        options: LockOptions,
    ) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let identity = match self.managed_identity(entity) {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let stored = self
            .identity_map
            .get(&identity)
            .is_some_and(|e| e.status() == EntryStatus::Managed && e.in_store());
        if !stored {
            return Outcome::Err(Error::lifecycle(
                Some(&identity),
                "only managed entities that exist in the store can be locked",
            ));
        }
        match self.lock_identity(cx, &identity, options).await {
            Outcome::Ok(Some(_)) => Outcome::Ok(()),
            Outcome::Ok(None) => Outcome::Err(Error::StaleEntityState(StaleStateError {
                identity: identity.clone(),
                expected_version: self
                    .identity_map
                    .get(&identity)
                    .and_then(|e| e.version().cloned()),
                operation: "lock",
            })),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn lock_identity(
        &mut self,
        cx: &Cx,
        identity: &Identity,
        options: LockOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let mode = options.mode;
        if mode.is_pessimistic() && !self.in_transaction {
            return Outcome::Err(Error::lifecycle(
                Some(identity),
                "pessimistic locks require an active transaction",
            ));
        }

        if self.locks.needs_acquire(identity, mode) {
            let row = match self.executor.lock(cx, identity, options).await {
                Outcome::Ok(row) => row,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            self.stats.locks_acquired += 1;
            let Some(row) = row else {
                tracing::debug!(identity = %identity, "Lock target absent or skipped");
                return Outcome::Ok(None);
            };
            if let Err(e) = self.absorb_locked_row(identity, &row) {
                return Outcome::Err(e);
            }
        } else if self.identity_map.find(identity).is_none() {
            match self.find_identity(cx, identity).await {
                Outcome::Ok(Some(_)) => {}
                Outcome::Ok(None) => return Outcome::Ok(None),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let Some(entity) = self.identity_map.find(identity) else {
            return Outcome::Ok(None);
        };
        self.locks.record(identity.clone(), mode);
        Outcome::Ok(Some(entity))
    }

    /// Register a freshly locked row, or check it against the managed copy.
    fn absorb_locked_row(&mut self, identity: &Identity, row: &Row) -> Result<()> {
        let descriptor = self.descriptor(identity.entity())?;
        match self.identity_map.get(identity) {
            Some(entry) if entry.status() == EntryStatus::Removed => Ok(()),
            Some(entry) => {
                let current = descriptor
                    .version_attribute()
                    .and_then(|name| row.get_by_name(name));
                LockCoordinator::verify(identity, "lock", entry.version(), current)
            }
            None => self
                .register_row(&descriptor, row, Source::Executor)
                .map(|_| ()),
        }
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change, in dependency order.
    ///
    /// Any failure leaves the unit of work failed: nothing more is accepted
    /// until `rollback` or `close`.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        match self.ensure_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if !self.in_transaction {
            return Outcome::Err(Error::lifecycle(None, "flush requires an active transaction"));
        }

        let outcome = self.flush_inner(cx).await;
        match &outcome {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => self.fail(e),
            Outcome::Cancelled(_) => self.fail(&Error::Cancelled),
            Outcome::Panicked(_) => self.fail(&Error::Custom("flush panicked".to_string())),
        }
        outcome
    }

    async fn flush_inner(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let start = std::time::Instant::now();
        let pending = self.pending_counts();
        if let Err(e) = self
            .callbacks
            .fire(&LifecycleView::session(LifecycleEvent::PreFlush, pending))
        {
            return Outcome::Err(e);
        }

        let orphans = match self.remove_orphans(cx).await {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let prepared = match self.prepare_flush() {
            Ok(prepared) => prepared,
            Err(e) => return Outcome::Err(e),
        };

        let result = if prepared.plan.is_empty() {
            FlushResult::default()
        } else {
            if let Some(l2) = self.l2() {
                if let Err(e) = prepared.plan.check_cache(l2) {
                    return Outcome::Err(e);
                }
            }
            let cache = if self.config.use_second_level_cache {
                self.cache.as_deref().map(|l2| (l2, &mut self.cache_tx))
            } else {
                None
            };
            match prepared.plan.execute(cx, &self.executor, cache).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        if let Err(e) = self.after_flush(&prepared) {
            return Outcome::Err(e);
        }
        self.stats.flushes += 1;
        self.stats.writes += result.total() as u64;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            writes = result.total(),
            orphans,
            "Unit of work flushed"
        );

        let pending = self.pending_counts();
        if let Err(e) = self
            .callbacks
            .fire(&LifecycleView::session(LifecycleEvent::PostFlush, pending))
        {
            return Outcome::Err(e);
        }
        Outcome::Ok(result)
    }

    /// Schedule removal of elements dropped from orphan-removing collections.
    async fn remove_orphans(&mut self, cx: &Cx) -> Outcome<usize, Error> {
        let orphans = CascadeEngine::orphans(self.identity_map.entries());
        let mut removed = 0;
        for orphan in orphans {
            let entity = match self.find_identity(cx, &orphan.identity).await {
                Outcome::Ok(Some(entity)) => entity,
                Outcome::Ok(None) => continue,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            tracing::debug!(
                orphan = %orphan.identity,
                parent = %orphan.parent,
                relationship = %orphan.relationship,
                "Removing orphan"
            );
            match self.initialize_cascade(cx, &entity, CascadeOp::Remove).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            let steps = {
                let map = &self.identity_map;
                let view = |id: &Identity| map.find(id);
                match self.cascade.expand_orphan(&entity, &view) {
                    Ok(steps) => steps,
                    Err(e) => return Outcome::Err(e),
                }
            };
            match self.schedule_removal(&steps) {
                Ok(n) => removed += n,
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(removed)
    }

    /// Compute every pending write.
    fn prepare_flush(&self) -> Result<PreparedFlush> {
        let l2_enabled = self.l2().is_some();
        let mut prepared = PreparedFlush::default();
        let mut writes = Vec::new();

        for entry in self.identity_map.entries() {
            let identity = entry.identity();
            let descriptor = Arc::clone(instance::read(entry.instance()).descriptor());
            let cache = if l2_enabled {
                descriptor.cache().cloned()
            } else {
                None
            };
            let version_index = descriptor.version_index();

            let (op, cached) = match entry.status() {
                EntryStatus::Detached => continue,
                EntryStatus::Removed => {
                    if !entry.in_store() {
                        continue;
                    }
                    let expected = version_index
                        .map(|_| entry.version().cloned().unwrap_or(Value::Null));
                    let op = WriteOp::Delete {
                        identity: identity.clone(),
                        expected_version: expected,
                    };
                    (op, None)
                }
                EntryStatus::NewUnflushed => {
                    let changes = DirtyChecker::compute_changes(entry)?;
                    let mut values = instance::read(entry.instance()).to_row().values().to_vec();
                    let mut version = None;
                    if let Some(vi) = version_index {
                        if values[vi].is_null() {
                            values[vi] = Value::Null.next_version().unwrap_or(Value::BigInt(0));
                        }
                        version = Some(values[vi].clone());
                        prepared.versions.push((identity.clone(), values[vi].clone()));
                    }
                    let cached = if cache.is_some() {
                        Some(CachedValue::encode(&values, version)?)
                    } else {
                        None
                    };
                    let row = Row::with_columns(
                        Arc::clone(descriptor.name_arc()),
                        Arc::new(ColumnInfo::for_entity(&descriptor)),
                        values,
                    );
                    let op = WriteOp::Insert {
                        identity: identity.clone(),
                        row,
                        collections: changes.collection_deltas(),
                    };
                    (op, cached)
                }
                EntryStatus::Managed => {
                    let changes = DirtyChecker::compute_changes(entry)?;
                    let forced = self.locks.increment_pending(identity);
                    if !changes.requires_write() && !(forced && version_index.is_some()) {
                        continue;
                    }
                    let mut values = instance::read(entry.instance()).to_row().values().to_vec();
                    let (expected_version, new_version) = match version_index {
                        Some(vi) => {
                            let loaded = entry.version().cloned().unwrap_or(Value::Null);
                            let (expected, next) =
                                LockCoordinator::version_transition(identity, &loaded)?;
                            values[vi] = next.clone();
                            prepared.versions.push((identity.clone(), next.clone()));
                            (Some(expected), Some(next))
                        }
                        None => (None, None),
                    };
                    if forced {
                        prepared.forced.push(identity.clone());
                    }
                    let cached = if cache.is_some() {
                        Some(CachedValue::encode(&values, new_version.clone())?)
                    } else {
                        None
                    };
                    let op = WriteOp::Update {
                        identity: identity.clone(),
                        columns: changes.columns(),
                        collections: changes.collection_deltas(),
                        expected_version,
                        new_version,
                    };
                    (op, cached)
                }
            };
            writes.push(
                PendingWrite::new(op, descriptor.rank(), entry.sequence())
                    .with_cache(cache, cached),
            );
        }

        prepared.plan = FlushOrderer::new().order(writes);
        Ok(prepared)
    }

    /// Bookkeeping once every write succeeded: versions, snapshots, deleted entries.
    fn after_flush(&mut self, prepared: &PreparedFlush) -> Result<()> {
        for (identity, version) in &prepared.versions {
            if let Some(entity) = self.identity_map.find(identity) {
                instance::write(&entity).set_version(version.clone());
            }
        }

        let mut deleted = Vec::new();
        for handle in self.identity_map.handles() {
            let entry = self.identity_map.entry(handle);
            match entry.status() {
                EntryStatus::NewUnflushed | EntryStatus::Managed => {
                    let identity = entry.identity().clone();
                    if entry.status() == EntryStatus::NewUnflushed {
                        self.deleted.remove(&identity);
                    }
                    let (snapshot, version) = {
                        let inst = instance::read(entry.instance());
                        (inst.snapshot(), inst.version().cloned())
                    };
                    self.identity_map.mark_written(&identity, snapshot, version)?;
                }
                EntryStatus::Removed => deleted.push(entry.identity().clone()),
                EntryStatus::Detached => {}
            }
        }
        for identity in deleted {
            self.locks.forget(&identity);
            self.deleted.insert(identity);
        }
        self.identity_map.purge_deleted();
        self.locks.increments_applied(&prepared.forced);
        Ok(())
    }

    // ========================================================================
    // Transaction End
    // ========================================================================

    /// Flush, commit the executor transaction and publish cache effects.
    ///
    /// Closes the unit of work: every entry is detached.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let pending = self.pending_counts();
        if let Err(e) = self
            .callbacks
            .fire(&LifecycleView::session(LifecycleEvent::PreCommit, pending))
        {
            self.fail(&e);
            return Outcome::Err(e);
        }

        if self.in_transaction {
            match self.executor.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.fail(&e);
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.fail(&Error::Cancelled);
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.fail(&Error::Custom("commit panicked".to_string()));
                    return Outcome::Panicked(p);
                }
            }
        }
        self.in_transaction = false;

        let tx = std::mem::take(&mut self.cache_tx);
        if let Some(l2) = self.cache.as_deref() {
            l2.commit(tx);
        }
        self.locks.release_all();
        let detached = self.identity_map.detach_all();
        self.pending_immediate.clear();
        self.deleted.clear();
        self.token = Arc::new(());
        self.state = SessionState::Closed;
        tracing::info!(detached, writes = self.stats.writes, "Unit of work committed");

        let pending = self.pending_counts();
        match self
            .callbacks
            .fire(&LifecycleView::session(LifecycleEvent::PostCommit, pending))
        {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Roll back the executor transaction and discard every change.
    ///
    /// Entries are detached, locks released and staged cache effects
    /// dropped. A failed unit of work becomes active again with an empty
    /// identity map.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == SessionState::Closed {
            return Outcome::Err(Error::Closed);
        }
        let result = if self.in_transaction {
            self.executor.rollback(cx).await
        } else {
            Outcome::Ok(())
        };
        self.in_transaction = false;
        let discarded = self.discard();
        self.state = SessionState::Active;
        self.failure = None;
        tracing::info!(discarded, "Unit of work rolled back");

        match result {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let pending = self.pending_counts();
        match self
            .callbacks
            .fire(&LifecycleView::session(LifecycleEvent::PostRollback, pending))
        {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Close the unit of work, rolling back an open transaction.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == SessionState::Closed {
            return Outcome::Ok(());
        }
        let result = if self.in_transaction {
            self.executor.rollback(cx).await
        } else {
            Outcome::Ok(())
        };
        self.in_transaction = false;
        let discarded = self.discard();
        self.state = SessionState::Closed;
        tracing::debug!(discarded, "Unit of work closed");
        result
    }

    /// Drop all in-memory state and invalidate every outstanding handle.
    fn discard(&mut self) -> usize {
        let tx = std::mem::take(&mut self.cache_tx);
        if let Some(l2) = self.cache.as_deref() {
            l2.rollback(tx);
        }
        self.locks.release_all();
        let detached = self.identity_map.detach_all();
        self.identity_map = IdentityMap::new();
        self.pending_immediate.clear();
        self.deleted.clear();
        self.token = Arc::new(());
        detached
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Status of `entity` in this unit of work, if tracked.
    pub fn status_of(&self, entity: &EntityRef) -> Option<EntryStatus> {
        self.identity_map
            .entry_for_instance(entity)
            .map(ManagedEntry::status)
    }

    /// Strongest lock this unit of work holds on `entity`.
    pub fn lock_mode_of(&self, entity: &EntityRef) -> Option<LockMode> {
        let identity = self.managed_identity(entity).ok()?;
        self.locks.held(&identity)
    }

    /// Whether flush would write anything for `entity`.
    pub fn is_dirty(&self, entity: &EntityRef) -> Result<bool> {
        let identity = self.managed_identity(entity)?;
        match self.identity_map.get(&identity) {
            Some(entry) if entry.status() == EntryStatus::Managed => DirtyChecker::is_dirty(entry),
            Some(_) => Ok(true),
            None => Err(not_managed(identity, None)),
        }
    }

    /// Pending changes of one managed entity.
    pub fn changes_for(&self, entity: &EntityRef) -> Result<ChangeSet> {
        let identity = self.managed_identity(entity)?;
        let entry = self
            .identity_map
            .get(&identity)
            .ok_or_else(|| not_managed(identity.clone(), None))?;
        DirtyChecker::compute_changes(entry)
    }

    /// Every non-empty change set, in registration order.
    pub fn pending_changes(&self) -> Result<Vec<ChangeSet>> {
        let mut changes = Vec::new();
        for entry in self.identity_map.entries() {
            if entry.status() == EntryStatus::Detached {
                continue;
            }
            if entry.status() == EntryStatus::Removed && !entry.in_store() {
                continue;
            }
            let set = DirtyChecker::compute_changes(entry)?;
            if !set.is_empty() || set.kind != ChangeKind::Update {
                changes.push(set);
            }
        }
        Ok(changes)
    }

    /// Pending changes as pretty-printed JSON.
    pub fn pending_changes_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.pending_changes()?)?)
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for entry in self.identity_map.entries() {
            counts.tracked += 1;
            match entry.status() {
                EntryStatus::NewUnflushed => counts.pending_new += 1,
                EntryStatus::Removed => counts.pending_delete += 1,
                EntryStatus::Managed => {
                    if DirtyChecker::is_dirty(entry).unwrap_or(true) {
                        counts.pending_dirty += 1;
                    }
                }
                EntryStatus::Detached => {}
            }
        }
        counts
    }

    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            state: self.state,
            pending: self.pending_counts(),
            in_transaction: self.in_transaction,
            locks_held: self.locks.len(),
            cache_actions: self.cache_tx.len(),
            statistics: self.stats,
        }
    }
}

impl<E: Executor> Drop for Session<E> {
    fn drop(&mut self) {
        if self.cache_tx.is_empty() {
            return;
        }
        tracing::warn!(
            actions = self.cache_tx.len(),
            "Session dropped with uncommitted cache effects; discarding"
        );
        let tx = std::mem::take(&mut self.cache_tx);
        if let Some(l2) = self.cache.as_deref() {
            l2.rollback(tx);
        }
    }
}

fn not_managed(identity: Identity, relationship: Option<String>) -> Error {
    Error::DetachedAccess(DetachedAccessError {
        identity: Some(identity),
        relationship,
        reason: DetachedReason::NotManaged,
    })
}

fn pool(related: impl IntoIterator<Item = EntityRef>) -> Result<HashMap<Identity, EntityRef>> {
    related
        .into_iter()
        .map(|entity| {
            let identity = instance::read(&entity).require_identity()?;
            Ok((identity, entity))
        })
        .collect()
}
