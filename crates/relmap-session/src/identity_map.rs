//! Identity Map: one managed instance per `(type, primary key)` per unit of work.
//!
//! The map is an arena of [`ManagedEntry`] values plus an index from
//! [`Identity`] to arena slot. Registration order is the arena order, which
//! is what flush uses to break ties between entities of the same type.
//! Detached and purged entries leave the arena, so slots (and
//! [`EntryHandle`]s) are only stable until the next `detach` or flush.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let handle = map.register(identity.clone(), Arc::clone(&order), Some(snapshot), version)?;
//!
//! // Same identity, same instance: same entry.
//! assert_eq!(map.register(identity.clone(), Arc::clone(&order), None, None)?, handle);
//!
//! // Same identity, different instance: rejected.
//! assert!(map.register(identity, other_order, None, None).is_err());
//! ```

use relmap_core::{EntityRef, Error, Identity, Result, Snapshot, Value, instance};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle state of a managed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Persisted in this unit of work, not yet written.
    NewUnflushed,
    /// Loaded from (or written to) the store and tracked.
    Managed,
    /// Scheduled for (or already) deleted. Terminal.
    Removed,
    /// No longer tracked.
    Detached,
}

impl EntryStatus {
    /// Allowed transitions. Removal is terminal; detachment ends tracking.
    pub fn can_become(self, next: EntryStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (EntryStatus::NewUnflushed, _) => true,
            (EntryStatus::Managed, EntryStatus::Removed | EntryStatus::Detached) => true,
            _ => false,
        }
    }
}

/// Arena slot of the identity map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryHandle(usize);

#[derive(Debug)]
pub struct ManagedEntry {
    identity: Identity,
    instance: EntityRef,
    snapshot: Option<Snapshot>,
    version: Option<Value>,
    status: EntryStatus,
    sequence: usize,
    in_store: bool,
}

impl ManagedEntry {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn instance(&self) -> &EntityRef {
        &self.instance
    }

    /// Load-time state; `None` for entries never written to the store.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Version value as last read from or written to the store.
    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    /// Registration sequence number within the unit of work.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Whether a row for this entry exists in the store (as far as this unit of work knows).
    pub fn in_store(&self) -> bool {
        self.in_store
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Snapshot, version: Option<Value>) {
        self.snapshot = Some(snapshot);
        self.version = version;
    }

    /// Snapshot slot for one link (used when a deferred link resolves).
    pub(crate) fn snapshot_mut(&mut self) -> Option<&mut Snapshot> {
        self.snapshot.as_mut()
    }

    fn transition(&mut self, next: EntryStatus) -> Result<()> {
        if self.status.can_become(next) {
            tracing::trace!(
                identity = %self.identity,
                from = ?self.status,
                to = ?next,
                "Entry status transition"
            );
            self.status = next;
            Ok(())
        } else {
            Err(Error::lifecycle(
                Some(&self.identity),
                format!("cannot move from {:?} to {:?}", self.status, next),
            ))
        }
    }
}

/// Identity map for one unit of work. Pure bookkeeping; never performs I/O.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: Vec<ManagedEntry>,
    index: HashMap<Identity, usize>,
    next_sequence: usize,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loaded instance as managed.
    ///
    /// If `identity` is already tracked by the same instance reference, the
    /// existing handle is returned. A different instance yields `DuplicateIdentity`.
    pub fn register(
        &mut self,
        identity: Identity,
        instance: EntityRef,
        snapshot: Option<Snapshot>,
        version: Option<Value>,
    ) -> Result<EntryHandle> {
        self.insert(identity, instance, snapshot, version, EntryStatus::Managed)
    }

    /// Register a new, unwritten instance.
    ///
    /// Persisting an instance whose identity was removed in this unit of work is a lifecycle error.
    pub fn mark_new(&mut self, identity: Identity, instance: EntityRef) -> Result<EntryHandle> {
        if let Some(entry) = self.get(&identity) {
            if entry.status == EntryStatus::Removed {
                return Err(Error::lifecycle(
                    Some(&identity),
                    "removed entities cannot be persisted again in the same unit of work",
                ));
            }
        }
        self.insert(identity, instance, None, None, EntryStatus::NewUnflushed)
    }

    fn insert(
        &mut self,
        identity: Identity,
        instance: EntityRef,
        snapshot: Option<Snapshot>,
        version: Option<Value>,
        status: EntryStatus,
    ) -> Result<EntryHandle> {
        if let Some(&slot) = self.index.get(&identity) {
            let existing = &self.entries[slot];
            if Arc::ptr_eq(&existing.instance, &instance) {
                return Ok(EntryHandle(slot));
            }
            return Err(Error::DuplicateIdentity(identity));
        }

        let slot = self.entries.len();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        tracing::trace!(identity = %identity, slot, sequence, ?status, "Registering entry");
        self.entries.push(ManagedEntry {
            identity: identity.clone(),
            instance,
            snapshot,
            version,
            status,
            sequence,
            in_store: status == EntryStatus::Managed,
        });
        self.index.insert(identity, slot);
        Ok(EntryHandle(slot))
    }

    /// The managed instance for `identity`, without I/O. Removed entries are not returned.
    pub fn find(&self, identity: &Identity) -> Option<EntityRef> {
        self.get(identity)
            .filter(|e| matches!(e.status, EntryStatus::Managed | EntryStatus::NewUnflushed))
            .map(|e| Arc::clone(&e.instance))
    }

    /// The tracked entry for `identity`, whatever its status.
    pub fn get(&self, identity: &Identity) -> Option<&ManagedEntry> {
        self.index.get(identity).map(|&slot| &self.entries[slot])
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut ManagedEntry> {
        self.index
            .get(identity)
            .copied()
            .map(move |slot| &mut self.entries[slot])
    }

    pub fn entry(&self, handle: EntryHandle) -> &ManagedEntry {
        &self.entries[handle.0]
    }

    /// The tracked entry holding exactly this instance reference.
    pub fn entry_for_instance(&self, instance: &EntityRef) -> Option<&ManagedEntry> {
        self.entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.instance, instance))
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.index.contains_key(identity)
    }

    /// Schedule `identity` for deletion.
    pub fn mark_removed(&mut self, identity: &Identity) -> Result<()> {
        let entry = self
            .get_mut(identity)
            .ok_or_else(|| Error::lifecycle(Some(identity), "not managed in this unit of work"))?;
        entry.transition(EntryStatus::Removed)
    }

    /// Mark a new entry as written (`NewUnflushed` to `Managed`).
    pub(crate) fn mark_written(
        &mut self,
        identity: &Identity,
        snapshot: Snapshot,
        version: Option<Value>,
    ) -> Result<()> {
        let entry = self
            .get_mut(identity)
            .ok_or_else(|| Error::lifecycle(Some(identity), "not managed in this unit of work"))?;
        if entry.status == EntryStatus::NewUnflushed {
            entry.transition(EntryStatus::Managed)?;
        }
        entry.in_store = true;
        entry.set_snapshot(snapshot, version);
        Ok(())
    }

    /// Stop tracking `identity`. The instance stays usable as plain data.
    pub fn detach(&mut self, identity: &Identity) -> Result<EntityRef> {
        let slot = *self
            .index
            .get(identity)
            .ok_or_else(|| Error::lifecycle(Some(identity), "not managed in this unit of work"))?;
        self.entries[slot].transition(EntryStatus::Detached)?;
        let entry = self.entries.remove(slot);
        instance::write(&entry.instance).unbind();
        self.reindex();
        Ok(entry.instance)
    }

    /// Drop entries whose rows were deleted by a successful flush, so the
    /// identity can be reused.
    pub(crate) fn purge_deleted(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.status != EntryStatus::Removed);
        let purged = before - self.entries.len();
        if purged > 0 {
            self.reindex();
        }
        purged
    }

    /// Detach every entry and empty the map.
    pub fn detach_all(&mut self) -> usize {
        let detached = self.entries.len();
        for entry in self.entries.drain(..) {
            instance::write(&entry.instance).unbind();
        }
        self.index.clear();
        tracing::debug!(detached, "Identity map cleared");
        detached
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(slot, e)| (e.identity.clone(), slot))
            .collect();
    }

    /// Tracked entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &ManagedEntry> + Clone {
        self.entries.iter()
    }

    /// Tracked handles in registration order.
    pub fn handles(&self) -> Vec<EntryHandle> {
        (0..self.entries.len()).map(EntryHandle).collect()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
