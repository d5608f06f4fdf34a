//! Dynamic entity instances.
//!
//! An [`Instance`] is one record of an entity type: a `Value` per scalar
//! attribute (descriptor order) and a [`Link`] per relationship. Links hold
//! identities, never other instances; the unit of work resolves identities
//! to instances through its identity map.

use crate::descriptor::EntityDescriptor;
use crate::error::{DetachedAccessError, DetachedReason, Error, Result};
use crate::identity::Identity;
use crate::row::{ColumnInfo, Row};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Shared handle to an instance managed by a unit of work.
pub type EntityRef = Arc<RwLock<Instance>>;

/// Read-lock an instance, recovering from poisoning.
pub fn read(entity: &EntityRef) -> RwLockReadGuard<'_, Instance> {
    entity.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write-lock an instance, recovering from poisoning.
pub fn write(entity: &EntityRef) -> RwLockWriteGuard<'_, Instance> {
    entity.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A value that may not have been fetched yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Lazy<T> {
    Unloaded,
    Loaded(T),
}

impl<T> Lazy<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Lazy::Loaded(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Lazy::Loaded(v) => Some(v),
            Lazy::Unloaded => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Lazy::Loaded(v) => Some(v),
            Lazy::Unloaded => None,
        }
    }
}

/// The state of one relationship on an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Link {
    Single(Lazy<Option<Identity>>),
    Many(Lazy<Vec<Identity>>),
}

impl Link {
    pub fn is_loaded(&self) -> bool {
        match self {
            Link::Single(lazy) => lazy.is_loaded(),
            Link::Many(lazy) => lazy.is_loaded(),
        }
    }

    /// All identities this link currently points at (empty when unloaded).
    pub fn targets(&self) -> Vec<Identity> {
        match self {
            Link::Single(Lazy::Loaded(Some(id))) => vec![id.clone()],
            Link::Many(Lazy::Loaded(ids)) => ids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Load-time copy of an instance's state, used for dirty checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub values: Vec<Value>,
    pub links: Vec<Link>,
}

/// One record of an entity type.
#[derive(Debug, Clone)]
pub struct Instance {
    descriptor: Arc<EntityDescriptor>,
    values: Vec<Value>,
    links: Vec<Link>,
    binding: Option<Weak<()>>,
}

impl Instance {
    /// A fresh, unsaved instance: all attributes `Null`, all links loaded and empty.
    pub fn new(descriptor: Arc<EntityDescriptor>) -> Self {
        let values = vec![Value::Null; descriptor.attributes().len()];
        let links = descriptor
            .relationships()
            .iter()
            .map(|r| {
                if r.is_collection() {
                    Link::Many(Lazy::Loaded(Vec::new()))
                } else {
                    Link::Single(Lazy::Loaded(None))
                }
            })
            .collect();
        Self {
            descriptor,
            values,
            links,
            binding: None,
        }
    }

    /// Build an instance from an executor row.
    ///
    /// Owning references are known from their foreign-key column; inverse
    /// references and collections start unloaded.
    pub fn from_row(descriptor: Arc<EntityDescriptor>, row: &Row) -> Result<Self> {
        let mut values = Vec::with_capacity(descriptor.attributes().len());
        for attr in descriptor.attributes() {
            let value = row.get_by_name(&attr.name).cloned().unwrap_or(Value::Null);
            if !attr.ty.accepts(&value) {
                return Err(Error::lifecycle(
                    None,
                    format!(
                        "column '{}' of {} holds {}, expected {:?}",
                        attr.name,
                        descriptor.name(),
                        value.type_name(),
                        attr.ty
                    ),
                ));
            }
            values.push(value);
        }

        let links = descriptor
            .relationships()
            .iter()
            .map(|r| {
                if r.is_collection() {
                    Link::Many(Lazy::Unloaded)
                } else if r.depends_on_target() {
                    let target = match row.get_by_name(&r.name) {
                        None | Some(Value::Null) => None,
                        Some(key) => Some(Identity::new(r.target.as_str(), key.clone())),
                    };
                    Link::Single(Lazy::Loaded(target))
                } else {
                    Link::Single(Lazy::Unloaded)
                }
            })
            .collect();

        Ok(Self {
            descriptor,
            values,
            links,
            binding: None,
        })
    }

    /// Row representation: attributes then owning foreign keys.
    pub fn to_row(&self) -> Row {
        let columns = Arc::new(ColumnInfo::for_entity(&self.descriptor));
        let mut values = self.values.clone();
        for (rel, link) in self.descriptor.relationships().iter().zip(&self.links) {
            if rel.depends_on_target() {
                let fk = match link {
                    Link::Single(Lazy::Loaded(Some(id))) => id.key().clone(),
                    _ => Value::Null,
                };
                values.push(fk);
            }
        }
        Row::with_columns(Arc::clone(self.descriptor.name_arc()), columns, values)
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn entity_name(&self) -> &str {
        self.descriptor.name()
    }

    /// The identity, or `None` while the primary key is `Null`.
    pub fn identity(&self) -> Option<Identity> {
        let key = &self.values[self.descriptor.primary_key_index()];
        if key.is_null() {
            None
        } else {
            Some(Identity::new(
                Arc::clone(self.descriptor.name_arc()),
                key.clone(),
            ))
        }
    }

    /// The identity, failing when the primary key has not been assigned.
    pub fn require_identity(&self) -> Result<Identity> {
        self.identity().ok_or_else(|| {
            Error::lifecycle(
                None,
                format!(
                    "{} has no value for primary key '{}'",
                    self.entity_name(),
                    self.descriptor.primary_key()
                ),
            )
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn get(&self, attribute: &str) -> Result<&Value> {
        let idx = self.descriptor.require_attribute(attribute)?;
        Ok(&self.values[idx])
    }

    /// Assign an attribute after checking its type and nullability.
    pub fn set(&mut self, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let idx = self.descriptor.require_attribute(attribute)?;
        let value = value.into();
        let attr = &self.descriptor.attributes()[idx];
        if value.is_null() && !attr.nullable {
            return Err(Error::lifecycle(
                self.identity().as_ref(),
                format!("attribute '{attribute}' is not nullable"),
            ));
        }
        if !attr.ty.accepts(&value) {
            return Err(Error::lifecycle(
                self.identity().as_ref(),
                format!(
                    "attribute '{attribute}' expects {:?}, got {}",
                    attr.ty,
                    value.type_name()
                ),
            ));
        }
        self.values[idx] = value;
        Ok(())
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, attribute: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(attribute, value)?;
        Ok(self)
    }

    pub fn version(&self) -> Option<&Value> {
        self.descriptor.version_index().map(|i| &self.values[i])
    }

    /// Overwrite the version counter. No-op for unversioned entities.
    pub fn set_version(&mut self, version: Value) {
        if let Some(i) = self.descriptor.version_index() {
            self.values[i] = version;
        }
    }

    pub fn link(&self, relationship: &str) -> Result<&Link> {
        let idx = self.descriptor.require_relationship(relationship)?;
        Ok(&self.links[idx])
    }

    /// Replace a link wholesale (used when a deferred link is resolved or refreshed).
    pub fn set_link(&mut self, index: usize, link: Link) {
        if let Some(slot) = self.links.get_mut(index) {
            *slot = link;
        }
    }

    /// The current target of a single-valued relationship.
    pub fn reference(&self, relationship: &str) -> Result<&Lazy<Option<Identity>>> {
        match self.link(relationship)? {
            Link::Single(lazy) => Ok(lazy),
            Link::Many(_) => Err(self.kind_mismatch(relationship, "single-valued")),
        }
    }

    /// Point a single-valued relationship at `target` (or clear it).
    pub fn set_reference(&mut self, relationship: &str, target: Option<Identity>) -> Result<()> {
        let idx = self.descriptor.require_relationship(relationship)?;
        let rel = &self.descriptor.relationships()[idx];
        if rel.is_collection() {
            return Err(self.kind_mismatch(relationship, "single-valued"));
        }
        if let Some(t) = &target {
            self.check_target(idx, t)?;
        }
        self.links[idx] = Link::Single(Lazy::Loaded(target));
        Ok(())
    }

    pub fn collection(&self, relationship: &str) -> Result<&Lazy<Vec<Identity>>> {
        match self.link(relationship)? {
            Link::Many(lazy) => Ok(lazy),
            Link::Single(_) => Err(self.kind_mismatch(relationship, "collection")),
        }
    }

    /// Add `member` to a loaded collection. Returns `false` if already present.
    pub fn add_to(&mut self, relationship: &str, member: Identity) -> Result<bool> {
        let idx = self.descriptor.require_relationship(relationship)?;
        self.check_target(idx, &member)?;
        let members = self.loaded_members_mut(idx, relationship)?;
        if members.contains(&member) {
            return Ok(false);
        }
        members.push(member);
        Ok(true)
    }

    /// Remove `member` from a loaded collection. Returns `false` if absent.
    pub fn remove_from(&mut self, relationship: &str, member: &Identity) -> Result<bool> {
        let idx = self.descriptor.require_relationship(relationship)?;
        let members = self.loaded_members_mut(idx, relationship)?;
        let before = members.len();
        members.retain(|m| m != member);
        Ok(members.len() != before)
    }

    fn loaded_members_mut(&mut self, idx: usize, relationship: &str) -> Result<&mut Vec<Identity>> {
        let identity = self.identity();
        match &mut self.links[idx] {
            Link::Many(Lazy::Loaded(members)) => Ok(members),
            Link::Many(Lazy::Unloaded) => Err(Error::lifecycle(
                identity.as_ref(),
                format!("collection '{relationship}' must be loaded before it is modified"),
            )),
            Link::Single(_) => Err(Error::lifecycle(
                identity.as_ref(),
                format!("'{relationship}' is not a collection"),
            )),
        }
    }

    fn check_target(&self, idx: usize, target: &Identity) -> Result<()> {
        let rel = &self.descriptor.relationships()[idx];
        if target.is_a(&rel.target) {
            Ok(())
        } else {
            Err(Error::lifecycle(
                self.identity().as_ref(),
                format!(
                    "'{}' targets {}, got {}",
                    rel.name, rel.target, target
                ),
            ))
        }
    }

    fn kind_mismatch(&self, relationship: &str, expected: &str) -> Error {
        Error::lifecycle(
            self.identity().as_ref(),
            format!("'{relationship}' is not {expected}"),
        )
    }

    /// Copy scalar values and loaded links from `other` (same entity type).
    ///
    /// Unloaded links on `other` leave the corresponding link untouched.
    pub fn copy_state_from(&mut self, other: &Instance) -> Result<()> {
        if other.entity_name() != self.entity_name() {
            return Err(Error::lifecycle(
                self.identity().as_ref(),
                format!("cannot copy state from {}", other.entity_name()),
            ));
        }
        self.values.clone_from(&other.values);
        for (mine, theirs) in self.links.iter_mut().zip(&other.links) {
            if theirs.is_loaded() {
                mine.clone_from(theirs);
            }
        }
        Ok(())
    }

    /// Replace every value and link (refresh from the store).
    pub fn overwrite_from(&mut self, fresh: Instance) {
        self.values = fresh.values;
        self.links = fresh.links;
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            values: self.values.clone(),
            links: self.links.clone(),
        }
    }

    /// Attach this instance to a unit of work's binding token.
    pub fn bind(&mut self, token: Weak<()>) {
        self.binding = Some(token);
    }

    pub fn unbind(&mut self) {
        self.binding = None;
    }

    /// Whether this instance is bound to `token` and that unit of work is still open.
    pub fn is_bound_to(&self, token: &Weak<()>) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|b| b.ptr_eq(token) && b.strong_count() > 0)
    }

    /// Check the instance may be used by the unit of work owning `token`.
    ///
    /// Unbound instances pass; instances bound elsewhere fail with `DetachedAccess`.
    pub fn check_binding(&self, token: &Weak<()>) -> Result<()> {
        match &self.binding {
            None => Ok(()),
            Some(b) if b.ptr_eq(token) => Ok(()),
            Some(b) => Err(Error::DetachedAccess(DetachedAccessError {
                identity: self.identity(),
                relationship: None,
                reason: if b.strong_count() == 0 {
                    DetachedReason::SessionClosed
                } else {
                    DetachedReason::ForeignSession
                },
            })),
        }
    }
}
