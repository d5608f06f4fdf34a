//! Deferred relationship handles.
//!
//! A [`DeferredHandle`] names one relationship of one managed entity and is
//! tied to the unit of work that created it through a weak token. Resolving
//! it goes back through that unit of work:
//!
//! ```ignore
//! let lines = session.deferred(&order, "lines")?;
//! let members = unwrap(lines.resolve(&cx, &mut session).await).into_many();
//! ```
//!
//! Once the unit of work closes (or rolls back) the token is gone and every
//! handle fails with `DetachedAccess`.

use crate::Session;
use asupersync::{Cx, Outcome};
use relmap_core::{
    DetachedAccessError, DetachedReason, EntityRef, Error, Executor, Identity, Result,
};
use std::sync::Weak;

#[derive(Debug, Clone)]
pub struct DeferredHandle {
    owner: Identity,
    relationship: String,
    binding: Weak<()>,
}

/// What a deferred relationship resolved to.
#[derive(Debug, Clone)]
pub enum Resolved {
    Single(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl Resolved {
    pub fn into_single(self) -> Option<EntityRef> {
        match self {
            Resolved::Single(target) => target,
            Resolved::Many(mut members) => {
                if members.is_empty() {
                    None
                } else {
                    Some(members.swap_remove(0))
                }
            }
        }
    }

    pub fn into_many(self) -> Vec<EntityRef> {
        match self {
            Resolved::Single(target) => target.into_iter().collect(),
            Resolved::Many(members) => members,
        }
    }
}

impl DeferredHandle {
    pub(crate) fn new(owner: Identity, relationship: impl Into<String>, binding: Weak<()>) -> Self {
        Self {
            owner,
            relationship: relationship.into(),
            binding,
        }
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn relationship(&self) -> &str {
        &self.relationship
    }

    /// Whether the creating unit of work is still open.
    pub fn is_attached(&self) -> bool {
        self.binding.strong_count() > 0
    }

    /// Check this handle may be resolved by the unit of work holding `token`.
    pub(crate) fn check(&self, token: &Weak<()>) -> Result<()> {
        let reason = if self.binding.strong_count() == 0 {
            DetachedReason::SessionClosed
        } else if !self.binding.ptr_eq(token) {
            DetachedReason::ForeignSession
        } else {
            return Ok(());
        };
        Err(Error::DetachedAccess(DetachedAccessError {
            identity: Some(self.owner.clone()),
            relationship: Some(self.relationship.clone()),
            reason,
        }))
    }

    /// Load the relationship on first access; later calls are served from memory.
    pub async fn resolve<E: Executor>(
        &self,
        cx: &Cx,
        session: &mut Session<E>,
    ) -> Outcome<Resolved, Error> {
        session.resolve(cx, self).await
    }
}
