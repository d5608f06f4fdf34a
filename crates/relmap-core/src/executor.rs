//! The statement executor seam.
//!
//! relmap never builds SQL. Everything that touches storage goes through an
//! [`Executor`]: fetching rows, applying write operations, taking pessimistic
//! locks and demarcating the transaction. All calls take a `Cx` for
//! cancellation and return an asupersync `Outcome`.

use crate::error::Error;
use crate::identity::Identity;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// A translated query: rows of `entity` whose columns equal the given values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub entity: String,
    pub filters: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filters: Vec::new(),
            limit: None,
        }
    }

    /// Add an equality filter.
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `row` satisfies every filter.
    pub fn matches(&self, row: &Row) -> bool {
        row.entity() == self.entity
            && self
                .filters
                .iter()
                .all(|(column, value)| row.get_by_name(column) == Some(value))
    }
}

/// What to read.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    /// One row by identity.
    ById(Identity),
    /// Several rows of one entity type in a single round trip.
    ByIds { entity: String, keys: Vec<Value> },
    /// All members of `owner.relationship`, as rows of the target type.
    Collection { owner: Identity, relationship: String },
    /// Rows produced by the query translator.
    Query(QuerySpec),
}

/// Membership delta of one collection relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDelta {
    pub relationship: String,
    pub added: Vec<Identity>,
    pub removed: Vec<Identity>,
}

/// What to write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a full row plus the initial membership of owning collections.
    Insert {
        identity: Identity,
        row: Row,
        collections: Vec<CollectionDelta>,
    },
    /// Update changed columns (attributes and foreign keys) and collection membership.
    ///
    /// When `expected_version` is set the write must only apply if the stored
    /// version equals it; `new_version` is the value to store.
    Update {
        identity: Identity,
        columns: Vec<(String, Value)>,
        collections: Vec<CollectionDelta>,
        expected_version: Option<Value>,
        new_version: Option<Value>,
    },
    /// Delete a row, optionally guarded by its version.
    Delete {
        identity: Identity,
        expected_version: Option<Value>,
    },
}

impl WriteOp {
    pub fn identity(&self) -> &Identity {
        match self {
            WriteOp::Insert { identity, .. }
            | WriteOp::Update { identity, .. }
            | WriteOp::Delete { identity, .. } => identity,
        }
    }

    pub fn expected_version(&self) -> Option<&Value> {
        match self {
            WriteOp::Insert { .. } => None,
            WriteOp::Update {
                expected_version, ..
            }
            | WriteOp::Delete {
                expected_version, ..
            } => expected_version.as_ref(),
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            WriteOp::Insert { .. } => "insert",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.identity())
    }
}

/// Lock modes a unit of work can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared row lock (`FOR SHARE`).
    PessimisticRead,
    /// Exclusive row lock (`FOR UPDATE`).
    PessimisticWrite,
    /// Exclusive row lock plus a version increment at flush.
    PessimisticForceIncrement,
    /// No row lock; the version is incremented at flush even without changes.
    OptimisticForceIncrement,
}

impl LockMode {
    /// Whether the executor has to take a row lock.
    pub const fn is_pessimistic(self) -> bool {
        !matches!(self, LockMode::OptimisticForceIncrement)
    }

    pub const fn forces_increment(self) -> bool {
        matches!(
            self,
            LockMode::PessimisticForceIncrement | LockMode::OptimisticForceIncrement
        )
    }

    /// Strength used to decide whether a new request upgrades a held lock.
    pub const fn strength(self) -> u8 {
        match self {
            LockMode::OptimisticForceIncrement => 0,
            LockMode::PessimisticRead => 1,
            LockMode::PessimisticWrite => 2,
            LockMode::PessimisticForceIncrement => 3,
        }
    }
}

/// What to do when the row is locked by someone else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockWait {
    /// Wait (executor-defined timeout).
    #[default]
    Block,
    /// Fail immediately.
    NoWait,
    /// Behave as if the row did not exist.
    SkipLocked,
}

/// Options for a pessimistic lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub mode: LockMode,
    pub wait: LockWait,
}

impl LockOptions {
    pub fn new(mode: LockMode) -> Self {
        Self {
            mode,
            wait: LockWait::Block,
        }
    }

    /// Fail instead of waiting for a lock held elsewhere.
    pub fn nowait(mut self) -> Self {
        self.wait = LockWait::NoWait;
        self
    }

    /// Skip the row instead of waiting for a lock held elsewhere.
    pub fn skip_locked(mut self) -> Self {
        self.wait = LockWait::SkipLocked;
        self
    }
}

/// Executes reads, writes and locks on behalf of a unit of work.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
/// Errors are returned unmodified to the caller of the session operation.
///
/// # Example
///
/// ```rust,ignore
/// let rows = executor.fetch(&cx, &Fetch::ById(Identity::new("Order", 1_i64))).await?;
/// let affected = executor.execute(&cx, &op).await?;
/// ```
pub trait Executor: Send + Sync {
    /// Read rows.
    fn fetch(
        &self,
        cx: &Cx,
        fetch: &Fetch,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Apply one write; returns the number of affected rows.
    ///
    /// A versioned update or delete whose version predicate does not match
    /// must report zero affected rows.
    fn execute(&self, cx: &Cx, op: &WriteOp) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Lock a row and return its current state (`None` if absent or skipped).
    fn lock(
        &self,
        cx: &Cx,
        identity: &Identity,
        options: LockOptions,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Begin the transaction backing the unit of work.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the transaction; releases every lock taken through [`lock`](Self::lock).
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the transaction; releases every lock.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
