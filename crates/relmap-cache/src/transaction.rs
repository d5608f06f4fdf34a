//! Per-unit-of-work cache bookkeeping.
//!
//! A [`CacheTransaction`] collects what a unit of work did to cached entity
//! types between flush and transaction end. It is handed back to
//! [`SecondLevelCache::commit`](crate::SecondLevelCache::commit) or
//! [`SecondLevelCache::rollback`](crate::SecondLevelCache::rollback), which
//! consume it.

use crate::provider::CachedValue;
use relmap_core::Identity;
use std::collections::HashMap;

/// Kind of write a unit of work is about to perform on a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// Deferred effect applied when the transaction ends.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingAction {
    /// Drop the item once the transaction committed.
    EvictAfterCommit { region: String, identity: Identity },
    /// Cache a newly inserted row once the transaction committed (if absent).
    PutAfterCommit {
        region: String,
        identity: Identity,
        value: CachedValue,
    },
    /// A soft lock held by this unit of work; `value` replaces the item on commit.
    SoftLocked {
        region: String,
        identity: Identity,
        value: Option<CachedValue>,
    },
}

/// Transactional-strategy write visible only to its own unit of work until commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Staged {
    Put(CachedValue),
    Evict,
}

#[derive(Debug, Default)]
pub struct CacheTransaction {
    pub(crate) actions: Vec<PendingAction>,
    pub(crate) staged: HashMap<(String, Identity), Staged>,
}

impl CacheTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.staged.is_empty()
    }

    /// Number of deferred actions plus staged writes.
    pub fn len(&self) -> usize {
        self.actions.len() + self.staged.len()
    }

    /// The staged transactional state of `identity`, if any.
    pub fn staged(&self, region: &str, identity: &Identity) -> Option<&Staged> {
        self.staged.get(&(region.to_string(), identity.clone()))
    }

    /// Number of soft locks this unit of work holds.
    pub fn soft_locks(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, PendingAction::SoftLocked { .. }))
            .count()
    }

    pub(crate) fn holds_lock(&self, region: &str, identity: &Identity) -> bool {
        self.lock_mut_index(region, identity).is_some()
    }

    pub(crate) fn set_locked_value(
        &mut self,
        region: &str,
        identity: &Identity,
        new_value: Option<CachedValue>,
    ) -> bool {
        let Some(idx) = self.lock_mut_index(region, identity) else {
            return false;
        };
        if let PendingAction::SoftLocked { value, .. } = &mut self.actions[idx] {
            *value = new_value;
        }
        true
    }

    fn lock_mut_index(&self, region: &str, identity: &Identity) -> Option<usize> {
        self.actions.iter().position(|a| {
            matches!(
                a,
                PendingAction::SoftLocked { region: r, identity: i, .. } if r == region && i == identity
            )
        })
    }

    pub(crate) fn push(&mut self, action: PendingAction) {
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
    }

    pub(crate) fn stage(&mut self, region: &str, identity: &Identity, staged: Staged) {
        self.staged
            .insert((region.to_string(), identity.clone()), staged);
    }
}
