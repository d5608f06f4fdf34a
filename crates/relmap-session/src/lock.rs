//! Lock coordination for a unit of work.
//!
//! Optimistic locking is expressed through version predicates on writes: the
//! coordinator computes the expected and next version of each versioned
//! write. Pessimistic locks are taken by the executor; the coordinator only
//! remembers what is held so repeated requests are not sent twice and
//! force-increment modes bump the version at the next flush. Every lock ends
//! with the transaction.

use relmap_core::{Error, Identity, LockMode, Result, StaleStateError, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldLock {
    mode: LockMode,
    increment_pending: bool,
}

#[derive(Debug, Default)]
pub struct LockCoordinator {
    held: HashMap<Identity, HeldLock>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode held on `identity` in this transaction, if any.
    pub fn held(&self, identity: &Identity) -> Option<LockMode> {
        self.held.get(identity).map(|h| h.mode)
    }

    /// Whether `mode` requires a call to the executor given what is already held.
    pub fn needs_acquire(&self, identity: &Identity, mode: LockMode) -> bool {
        if !mode.is_pessimistic() {
            return false;
        }
        match self.held.get(identity) {
            Some(held) => !held.mode.is_pessimistic() || held.mode.strength() < mode.strength(),
            None => true,
        }
    }

    /// Record a granted lock. The stronger mode wins; a pending increment is kept.
    pub fn record(&mut self, identity: Identity, mode: LockMode) -> LockMode {
        let entry = self.held.entry(identity).or_insert(HeldLock {
            mode,
            increment_pending: false,
        });
        if mode.strength() > entry.mode.strength() {
            entry.mode = mode;
        }
        entry.increment_pending |= mode.forces_increment();
        tracing::debug!(mode = ?entry.mode, increment = entry.increment_pending, "Lock recorded");
        entry.mode
    }

    /// Whether the next flush must bump the version of `identity` even without changes.
    pub fn increment_pending(&self, identity: &Identity) -> bool {
        self.held.get(identity).is_some_and(|h| h.increment_pending)
    }

    /// Clear pending increments once a flush has applied them.
    pub fn increments_applied(&mut self, identities: &[Identity]) {
        for identity in identities {
            if let Some(held) = self.held.get_mut(identity) {
                held.increment_pending = false;
            }
        }
    }

    /// Forget one identity (detached or deleted).
    pub fn forget(&mut self, identity: &Identity) {
        self.held.remove(identity);
    }

    /// Transaction end: every lock is released by the executor.
    pub fn release_all(&mut self) -> usize {
        let released = self.held.len();
        self.held.clear();
        if released > 0 {
            tracing::debug!(released, "Locks released");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Expected and next version of a versioned write.
    ///
    /// `loaded` is the version read from the store (`Null` if the row never
    /// had one). Non-integer or overflowing versions are lifecycle errors.
    pub fn version_transition(identity: &Identity, loaded: &Value) -> Result<(Value, Value)> {
        let next = loaded.next_version().ok_or_else(|| {
            Error::lifecycle(
                Some(identity),
                format!("version value {loaded} cannot be incremented"),
            )
        })?;
        Ok((loaded.clone(), next))
    }

    /// Check a freshly read version against the one this unit of work holds.
    pub fn verify(
        identity: &Identity,
        operation: &'static str,
        expected: Option<&Value>,
        actual: Option<&Value>,
    ) -> Result<()> {
        match (expected, actual) {
            (Some(expected), Some(actual)) if !expected.key_eq(actual) => {
                Err(Error::StaleEntityState(StaleStateError {
                    identity: identity.clone(),
                    expected_version: Some(expected.clone()),
                    operation,
                }))
            }
            _ => Ok(()),
        }
    }
}
