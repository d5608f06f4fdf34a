//! Error types for relmap operations.

use crate::identity::Identity;
use crate::value::Value;
use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// An identity is already managed by a different instance in this unit of work
    DuplicateIdentity(Identity),
    /// An optimistic version check failed (the row changed or disappeared underneath us)
    StaleEntityState(StaleStateError),
    /// A deferred reference or managed instance was used outside its unit of work
    DetachedAccess(DetachedAccessError),
    /// A write targeted an entity cached with the read-only strategy
    CacheImmutabilityViolation(CacheViolationError),
    /// Cascade traversal exceeded its configured bounds
    OrphanCascadeCycle(CascadeError),
    /// Descriptor registry build or lookup errors
    Metadata(MetadataError),
    /// Forbidden lifecycle transition or malformed entity state
    Lifecycle(LifecycleError),
    /// The unit of work aborted a flush and only accepts rollback/close
    UnitOfWorkFailed(String),
    /// The unit of work is closed
    Closed,
    /// Failure reported by the executor (propagated unmodified)
    Executor(ExecutorError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct StaleStateError {
    pub identity: Identity,
    pub expected_version: Option<Value>,
    pub operation: &'static str,
}

#[derive(Debug, Clone)]
pub struct DetachedAccessError {
    pub identity: Option<Identity>,
    pub relationship: Option<String>,
    pub reason: DetachedReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachedReason {
    /// The unit of work that produced the handle has closed
    SessionClosed,
    /// The handle belongs to a different unit of work
    ForeignSession,
    /// The instance is no longer managed
    NotManaged,
}

#[derive(Debug, Clone)]
pub struct CacheViolationError {
    pub region: String,
    pub identity: Identity,
}

#[derive(Debug, Clone)]
pub struct CascadeError {
    pub root: Identity,
    pub operation: &'static str,
    pub depth: usize,
    pub steps: usize,
}

#[derive(Debug, Clone)]
pub struct MetadataError {
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LifecycleError {
    pub identity: Option<Identity>,
    pub message: String,
}

#[derive(Debug)]
pub struct ExecutorError {
    pub kind: ExecutorErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorErrorKind {
    /// Statement or fetch failed
    Statement,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Lock could not be acquired (NOWAIT, timeout)
    LockUnavailable,
    /// Deadlock detected
    Deadlock,
    /// Transaction begin/commit/rollback failed
    Transaction,
    /// Connection lost or unavailable
    Connection,
}

impl Error {
    /// Shorthand for a metadata error about `entity`.
    pub fn metadata(entity: Option<&str>, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    /// Shorthand for a lifecycle error.
    pub fn lifecycle(identity: Option<&Identity>, message: impl Into<String>) -> Self {
        Error::Lifecycle(LifecycleError {
            identity: identity.cloned(),
            message: message.into(),
        })
    }

    /// Shorthand for an executor error.
    pub fn executor(kind: ExecutorErrorKind, message: impl Into<String>) -> Self {
        Error::Executor(ExecutorError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (stale state, deadlock, lock unavailable)?
    ///
    /// Retrying means starting a fresh unit of work; the failed one is unusable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StaleEntityState(_) => true,
            Error::Executor(e) => matches!(
                e.kind,
                ExecutorErrorKind::Deadlock | ExecutorErrorKind::LockUnavailable
            ),
            _ => false,
        }
    }

    /// The identity this error is about, if any.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Error::DuplicateIdentity(id) => Some(id),
            Error::StaleEntityState(e) => Some(&e.identity),
            Error::DetachedAccess(e) => e.identity.as_ref(),
            Error::CacheImmutabilityViolation(e) => Some(&e.identity),
            Error::OrphanCascadeCycle(e) => Some(&e.root),
            Error::Lifecycle(e) => e.identity.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIdentity(id) => {
                write!(f, "Duplicate identity: {} is already managed", id)
            }
            Error::StaleEntityState(e) => write!(f, "Stale entity state: {}", e),
            Error::DetachedAccess(e) => write!(f, "Detached access: {}", e),
            Error::CacheImmutabilityViolation(e) => {
                write!(f, "Cache immutability violation: {}", e)
            }
            Error::OrphanCascadeCycle(e) => write!(f, "Cascade bound exceeded: {}", e),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::Lifecycle(e) => write!(f, "Lifecycle error: {}", e),
            Error::UnitOfWorkFailed(msg) => {
                write!(f, "Unit of work failed (rollback required): {}", msg)
            }
            Error::Closed => write!(f, "Unit of work is closed"),
            Error::Executor(e) => write!(f, "Executor error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Executor(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for StaleStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected_version {
            Some(v) => write!(
                f,
                "{} of {} affected no rows at version {}",
                self.operation, self.identity, v
            ),
            None => write!(f, "{} of {} affected no rows", self.operation, self.identity),
        }
    }
}

impl fmt::Display for DetachedAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            DetachedReason::SessionClosed => "owning unit of work is closed",
            DetachedReason::ForeignSession => "handle belongs to another unit of work",
            DetachedReason::NotManaged => "instance is not managed",
        };
        match (&self.identity, &self.relationship) {
            (Some(id), Some(rel)) => write!(f, "{}.{}: {}", id, rel, reason),
            (Some(id), None) => write!(f, "{}: {}", id, reason),
            _ => write!(f, "{}", reason),
        }
    }
}

impl fmt::Display for CacheViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is cached read-only in region '{}'",
            self.identity, self.region
        )
    }
}

impl fmt::Display for CascadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} reached depth {} after {} steps",
            self.operation, self.root, self.depth, self.steps
        )
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(entity) = &self.entity {
            write!(f, "{}: {}", entity, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.identity {
            write!(f, "{}: {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ExecutorError> for Error {
    fn from(err: ExecutorError) -> Self {
        Error::Executor(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<LifecycleError> for Error {
    fn from(err: LifecycleError) -> Self {
        Error::Lifecycle(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
