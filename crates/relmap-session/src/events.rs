//! Lifecycle callbacks.
//!
//! Callbacks run synchronously, in registration order, and receive an
//! immutable [`LifecycleView`]. Returning `Err` from a `Pre*` callback aborts
//! the operation before anything is written.

use relmap_core::{Error, Identity, Instance};
use serde::Serialize;

/// Points in the unit-of-work lifecycle that fire callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleEvent {
    /// An entity is about to become new-unflushed (fired once per cascade step).
    PrePersist,
    /// An entity is about to be scheduled for deletion (fired once per cascade step).
    PreRemove,
    /// Before flush computes and executes pending writes.
    PreFlush,
    /// After flush wrote everything successfully.
    PostFlush,
    /// Before commit (after its flush).
    PreCommit,
    /// After the executor committed.
    PostCommit,
    /// After rollback completed.
    PostRollback,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 7] = [
        LifecycleEvent::PrePersist,
        LifecycleEvent::PreRemove,
        LifecycleEvent::PreFlush,
        LifecycleEvent::PostFlush,
        LifecycleEvent::PreCommit,
        LifecycleEvent::PostCommit,
        LifecycleEvent::PostRollback,
    ];

    const fn slot(self) -> usize {
        match self {
            LifecycleEvent::PrePersist => 0,
            LifecycleEvent::PreRemove => 1,
            LifecycleEvent::PreFlush => 2,
            LifecycleEvent::PostFlush => 3,
            LifecycleEvent::PreCommit => 4,
            LifecycleEvent::PostCommit => 5,
            LifecycleEvent::PostRollback => 6,
        }
    }
}

/// Counts of tracked entries by what flush would do with them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Entries tracked by the identity map.
    pub tracked: usize,
    pub pending_new: usize,
    pub pending_delete: usize,
    pub pending_dirty: usize,
}

/// What a callback gets to see.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleView<'a> {
    pub event: LifecycleEvent,
    /// The entity concerned, for per-entity events.
    pub identity: Option<&'a Identity>,
    pub instance: Option<&'a Instance>,
    pub pending: PendingCounts,
}

impl<'a> LifecycleView<'a> {
    pub fn session(event: LifecycleEvent, pending: PendingCounts) -> Self {
        Self {
            event,
            identity: None,
            instance: None,
            pending,
        }
    }

    pub fn entity(
        event: LifecycleEvent,
        identity: &'a Identity,
        instance: &'a Instance,
        pending: PendingCounts,
    ) -> Self {
        Self {
            event,
            identity: Some(identity),
            instance: Some(instance),
            pending,
        }
    }
}

type LifecycleFn = Box<dyn FnMut(&LifecycleView<'_>) -> Result<(), Error> + Send>;

/// Registered callbacks, one ordered list per event.
#[derive(Default)]
pub struct LifecycleCallbacks {
    slots: [Vec<LifecycleFn>; 7],
}

impl std::fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("LifecycleCallbacks");
        for event in LifecycleEvent::ALL {
            s.field(
                &format!("{event:?}"),
                &self.slots[event.slot()].len(),
            );
        }
        s.finish()
    }
}

impl LifecycleCallbacks {
    pub fn register(
        &mut self,
        event: LifecycleEvent,
        f: impl FnMut(&LifecycleView<'_>) -> Result<(), Error> + Send + 'static,
    ) {
        self.slots[event.slot()].push(Box::new(f));
    }

    pub fn count(&self, event: LifecycleEvent) -> usize {
        self.slots[event.slot()].len()
    }

    /// Run every callback of `view.event` in order; the first error stops the rest.
    pub fn fire(&mut self, view: &LifecycleView<'_>) -> Result<(), Error> {
        let callbacks = &mut self.slots[view.event.slot()];
        if callbacks.is_empty() {
            return Ok(());
        }
        tracing::trace!(event = ?view.event, count = callbacks.len(), "Firing lifecycle callbacks");
        for cb in callbacks.iter_mut() {
            cb(view)?;
        }
        Ok(())
    }
}
