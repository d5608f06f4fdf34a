//! Core types and traits for relmap.
//!
//! This crate provides the foundations every other relmap crate builds on:
//!
//! - `Value` and `Identity` for dynamic attribute values and `(type, key)` identities
//! - Entity/relationship descriptors and the immutable `Registry`
//! - `Instance`, the dynamic entity record with identity-only links
//! - `Executor`, the seam to whatever actually runs statements
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod descriptor;
pub mod error;
pub mod executor;
pub mod identity;
pub mod instance;
pub mod registry;
pub mod row;
pub mod value;

pub use descriptor::{
    AttributeDescriptor, AttributeType, CacheStrategy, CascadeOp, CascadeSet, EntityCacheConfig,
    EntityDescriptor, FetchPolicy, RelationshipDescriptor, RelationshipKind,
};
pub use error::{
    CacheViolationError, CascadeError, DetachedAccessError, DetachedReason, Error, ExecutorError,
    ExecutorErrorKind, LifecycleError, MetadataError, Result, StaleStateError,
};
pub use executor::{
    CollectionDelta, Executor, Fetch, LockMode, LockOptions, LockWait, QuerySpec, WriteOp,
};
pub use identity::Identity;
pub use instance::{EntityRef, Instance, Lazy, Link, Snapshot};
pub use registry::{MetadataSource, Registry, RegistryBuilder};
pub use row::{ColumnInfo, Row};
pub use value::Value;
