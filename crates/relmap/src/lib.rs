//! relmap - an identity-mapped persistence runtime.
//!
//! relmap sits between application code and whatever executes statements.
//! It provides:
//!
//! - A unit of work with an identity map: one instance per `(type, key)`
//! - Snapshot-based dirty checking and dependency-ordered flushes
//! - Cascading persist/merge/remove/refresh/detach with orphan removal
//! - Deferred relationships that load once, on first access
//! - A shared second-level cache with read-only, nonstrict-read-write,
//!   read-write and transactional strategies
//! - Optimistic versioning and pessimistic locks through the executor
//!
//! relmap never builds SQL: the [`Executor`] trait is the seam.
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! let engine = Engine::builder()
//!     .metadata(|| {
//!         Registry::builder()
//!             .entity(
//!                 EntityDescriptor::new("Order", "id")
//!                     .required_attribute("id", AttributeType::BigInt)
//!                     .attribute("total", AttributeType::BigInt)
//!                     .attribute("version", AttributeType::BigInt)
//!                     .version("version"),
//!             )
//!             .build()
//!     })
//!     .build()?;
//!
//! async fn bump(cx: &Cx, engine: &Engine, executor: impl Executor) {
//!     let mut session = engine.open_session(executor);
//!     let order = session.find(cx, "Order", 1_i64).await.unwrap().unwrap();
//!     write(&order).set("total", 150_i64).unwrap();
//!     session.commit(cx).await.unwrap(); // update Order#1 where version = 0
//! }
//! ```

pub mod engine;

pub use engine::{Engine, EngineBuilder, EngineSummary};

pub use relmap_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Values and identities
    Identity,
    Value,
    // Metadata
    AttributeDescriptor,
    AttributeType,
    CacheStrategy,
    CascadeOp,
    CascadeSet,
    EntityCacheConfig,
    EntityDescriptor,
    FetchPolicy,
    MetadataSource,
    Registry,
    RegistryBuilder,
    RelationshipDescriptor,
    RelationshipKind,
    // Instances
    EntityRef,
    Instance,
    Lazy,
    Link,
    Snapshot,
    // Executor seam
    CollectionDelta,
    ColumnInfo,
    Executor,
    Fetch,
    LockMode,
    LockOptions,
    LockWait,
    QuerySpec,
    Row,
    WriteOp,
    // Errors
    CacheViolationError,
    CascadeError,
    DetachedAccessError,
    DetachedReason,
    Error,
    ExecutorError,
    ExecutorErrorKind,
    LifecycleError,
    MetadataError,
    Result,
    StaleStateError,
};
pub use relmap_core::instance::{read, write};

pub use relmap_cache::{
    CacheConfig, CacheItem, CacheProvider, CacheStats, CachedValue, MemoryCacheProvider,
    RegionConfig, SecondLevelCache,
};

pub use relmap_session::{
    ChangeKind, ChangeSet, DeferredHandle, EntryStatus, FlushResult, LifecycleEvent,
    LifecycleView, PendingCounts, Resolved, Session, SessionConfig, SessionDebugInfo,
    SessionState, SessionStatistics,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        AttributeType, CacheConfig, CacheStrategy, CascadeOp, CascadeSet, ChangeSet, Cx, Engine,
        EntityDescriptor, EntityRef, EntryStatus, Error, Executor, FetchPolicy, Identity,
        Instance, LifecycleEvent, LockMode, LockOptions, Outcome, QuerySpec, Registry,
        RelationshipDescriptor, RelationshipKind, Result, Session, SessionConfig, Value, read,
        write,
    };
}
