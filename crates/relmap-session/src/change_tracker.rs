//! Dirty checking against load-time snapshots.
//!
//! Comparison is attribute-wise: scalar values by value equality, single
//! links by target identity, collections by identity-set difference. A value
//! that was changed and changed back produces no change.

use crate::identity_map::{EntryStatus, ManagedEntry};
use relmap_core::{
    CollectionDelta, EntityDescriptor, Error, Identity, Instance, Lazy, Link, Result, Snapshot,
    Value, instance,
};
use serde::Serialize;
use std::fmt;

/// What a flush has to do for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    pub name: String,
    pub old: Value,
    pub new: Value,
}

/// A single-valued link now points somewhere else.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceChange {
    pub relationship: String,
    pub old: Option<Identity>,
    pub new: Option<Identity>,
    /// This side holds the foreign key, so the change is written through this entity.
    pub owning: bool,
}

/// Membership difference of a loaded collection. Order is ignored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionChange {
    pub relationship: String,
    pub added: Vec<Identity>,
    pub removed: Vec<Identity>,
    /// This side owns the link rows, so the change is written through this entity.
    pub owning: bool,
}

/// The minimal description of how one managed entity differs from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    pub kind: ChangeKind,
    pub identity: Identity,
    /// Name of the primary-key attribute (for display).
    pub primary_key: String,
    pub attributes: Vec<AttributeChange>,
    pub references: Vec<ReferenceChange>,
    pub collections: Vec<CollectionChange>,
}

impl ChangeSet {
    fn empty(kind: ChangeKind, identity: Identity, descriptor: &EntityDescriptor) -> Self {
        Self {
            kind,
            identity,
            primary_key: descriptor.primary_key().to_string(),
            attributes: Vec::new(),
            references: Vec::new(),
            collections: Vec::new(),
        }
    }

    /// No attribute, reference or collection differs. Inserts and deletes are never empty.
    pub fn is_empty(&self) -> bool {
        self.kind == ChangeKind::Update
            && self.attributes.is_empty()
            && self.references.is_empty()
            && self.collections.is_empty()
    }

    /// Whether the store needs a write for this entity (beyond a forced version bump).
    pub fn requires_write(&self) -> bool {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Delete => true,
            ChangeKind::Update => {
                !self.attributes.is_empty()
                    || self.references.iter().any(|r| r.owning)
                    || self.collections.iter().any(|c| c.owning)
            }
        }
    }

    pub fn changed_attribute(&self, name: &str) -> Option<&AttributeChange> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Columns an update must write: changed attributes then changed owning foreign keys.
    pub fn columns(&self) -> Vec<(String, Value)> {
        let mut columns: Vec<(String, Value)> = self
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.new.clone()))
            .collect();
        for reference in self.references.iter().filter(|r| r.owning) {
            let fk = reference
                .new
                .as_ref()
                .map_or(Value::Null, |id| id.key().clone());
            columns.push((reference.relationship.clone(), fk));
        }
        columns
    }

    /// Membership deltas of the collections this entity owns.
    pub fn collection_deltas(&self) -> Vec<CollectionDelta> {
        self.collections
            .iter()
            .filter(|c| c.owning)
            .map(|c| CollectionDelta {
                relationship: c.relationship.clone(),
                added: c.added.clone(),
                removed: c.removed.clone(),
            })
            .collect()
    }
}

fn fmt_target(target: Option<&Identity>) -> String {
    target.map_or_else(|| "null".to_string(), ToString::to_string)
}

fn fmt_ids(ids: &[Identity]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}={}",
            self.kind.as_str(),
            self.identity.entity(),
            self.primary_key,
            self.identity.key()
        )?;
        if self.kind != ChangeKind::Update {
            return Ok(());
        }
        if self.is_empty() {
            return write!(f, ": no changes");
        }

        let mut parts = Vec::new();
        for a in &self.attributes {
            parts.push(format!("{} {}→{}", a.name, a.old, a.new));
        }
        for r in &self.references {
            parts.push(format!(
                "{} {}→{}",
                r.relationship,
                fmt_target(r.old.as_ref()),
                fmt_target(r.new.as_ref())
            ));
        }
        for c in &self.collections {
            let mut delta = c.relationship.clone();
            if !c.added.is_empty() {
                delta.push_str(&format!(" +[{}]", fmt_ids(&c.added)));
            }
            if !c.removed.is_empty() {
                delta.push_str(&format!(" -[{}]", fmt_ids(&c.removed)));
            }
            parts.push(delta);
        }
        write!(f, ": {}", parts.join(", "))
    }
}

/// Computes [`ChangeSet`]s for managed entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirtyChecker;

impl DirtyChecker {
    /// Compute the change set of one entry.
    ///
    /// New entries yield a full insert, removed entries a delete, managed
    /// entries the attribute-wise difference to their snapshot.
    #[tracing::instrument(level = "trace", skip(entry), fields(identity = %entry.identity()))]
    pub fn compute_changes(entry: &ManagedEntry) -> Result<ChangeSet> {
        let current = instance::read(entry.instance());
        let descriptor = current.descriptor();
        let identity = entry.identity().clone();

        match entry.status() {
            EntryStatus::Removed => {
                return Ok(ChangeSet::empty(ChangeKind::Delete, identity, descriptor));
            }
            EntryStatus::Detached => {
                return Err(Error::lifecycle(
                    Some(&identity),
                    "detached entries have no pending changes",
                ));
            }
            EntryStatus::NewUnflushed | EntryStatus::Managed => {}
        }

        if current.identity().as_ref() != Some(&identity) {
            return Err(Error::lifecycle(
                Some(&identity),
                format!(
                    "primary key '{}' of a managed entity cannot change",
                    descriptor.primary_key()
                ),
            ));
        }

        let changes = match (entry.status(), entry.snapshot()) {
            (EntryStatus::NewUnflushed, _) => insert_changes(identity, &current),
            (_, Some(snapshot)) => update_changes(identity, &current, snapshot),
            (_, None) => {
                return Err(Error::lifecycle(
                    Some(&identity),
                    "managed entry has no load-time snapshot",
                ));
            }
        };
        tracing::trace!(
            kind = changes.kind.as_str(),
            attributes = changes.attributes.len(),
            references = changes.references.len(),
            collections = changes.collections.len(),
            "Computed change set"
        );
        Ok(changes)
    }

    /// Whether [`compute_changes`](Self::compute_changes) would report anything.
    pub fn is_dirty(entry: &ManagedEntry) -> Result<bool> {
        Ok(!Self::compute_changes(entry)?.is_empty())
    }
}

fn insert_changes(identity: Identity, current: &Instance) -> ChangeSet {
    let descriptor = current.descriptor();
    let mut changes = ChangeSet::empty(ChangeKind::Insert, identity, descriptor);
    for (attr, value) in descriptor.attributes().iter().zip(current.values()) {
        changes.attributes.push(AttributeChange {
            name: attr.name.clone(),
            old: Value::Null,
            new: value.clone(),
        });
    }
    for (rel, link) in descriptor.relationships().iter().zip(current.links()) {
        match link {
            Link::Single(Lazy::Loaded(Some(target))) => changes.references.push(ReferenceChange {
                relationship: rel.name.clone(),
                old: None,
                new: Some(target.clone()),
                owning: rel.writes_link(),
            }),
            Link::Many(Lazy::Loaded(members)) if !members.is_empty() => {
                changes.collections.push(CollectionChange {
                    relationship: rel.name.clone(),
                    added: members.clone(),
                    removed: Vec::new(),
                    owning: rel.writes_link(),
                });
            }
            _ => {}
        }
    }
    changes
}

fn update_changes(identity: Identity, current: &Instance, snapshot: &Snapshot) -> ChangeSet {
    let descriptor = current.descriptor();
    let mut changes = ChangeSet::empty(ChangeKind::Update, identity, descriptor);
    let version_index = descriptor.version_index();

    for (idx, attr) in descriptor.attributes().iter().enumerate() {
        if Some(idx) == version_index {
            continue;
        }
        let new = &current.values()[idx];
        let old = snapshot.values.get(idx).unwrap_or(&Value::Null);
        if !old.key_eq(new) {
            changes.attributes.push(AttributeChange {
                name: attr.name.clone(),
                old: old.clone(),
                new: new.clone(),
            });
        }
    }

    for (idx, rel) in descriptor.relationships().iter().enumerate() {
        let old = snapshot.links.get(idx);
        match (&current.links()[idx], old) {
            (Link::Single(Lazy::Loaded(new)), old) => {
                let old = match old {
                    Some(Link::Single(Lazy::Loaded(old))) => old.clone(),
                    _ => None,
                };
                if old != *new {
                    changes.references.push(ReferenceChange {
                        relationship: rel.name.clone(),
                        old,
                        new: new.clone(),
                        owning: rel.writes_link(),
                    });
                }
            }
            (Link::Many(Lazy::Loaded(members)), old) => {
                let before: &[Identity] = match old {
                    Some(Link::Many(Lazy::Loaded(before))) => before,
                    _ => &[],
                };
                let added: Vec<Identity> = members
                    .iter()
                    .filter(|m| !before.contains(m))
                    .cloned()
                    .collect();
                let removed: Vec<Identity> = before
                    .iter()
                    .filter(|m| !members.contains(m))
                    .cloned()
                    .collect();
                if !added.is_empty() || !removed.is_empty() {
                    changes.collections.push(CollectionChange {
                        relationship: rel.name.clone(),
                        added,
                        removed,
                        owning: rel.writes_link(),
                    });
                }
            }
            // Unloaded links were never observed, so they cannot have changed.
            (Link::Single(Lazy::Unloaded) | Link::Many(Lazy::Unloaded), _) => {}
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_map::IdentityMap;
    use relmap_core::{
        AttributeType, EntityDescriptor, RelationshipDescriptor, RelationshipKind, Row,
    };
    use std::sync::{Arc, RwLock};

    fn order_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::new("Order", "id")
                .required_attribute("id", AttributeType::BigInt)
                .attribute("total", AttributeType::BigInt)
                .attribute("note", AttributeType::Text)
                .attribute("version", AttributeType::BigInt)
                .version("version")
                .relationship(RelationshipDescriptor::new(
                    "customer",
                    RelationshipKind::SingleReferencing,
                    "Customer",
                ))
                .relationship(
                    RelationshipDescriptor::new("lines", RelationshipKind::CollectionOwned, "Line")
                        .mapped_by("order"),
                )
                .relationship(RelationshipDescriptor::new(
                    "tags",
                    RelationshipKind::CollectionJoin,
                    "Tag",
                )),
        )
    }

    fn loaded(map: &mut IdentityMap) -> (Identity, Arc<RwLock<Instance>>) {
        let row = Row::new(
            "Order",
            vec![
                "id".into(),
                "total".into(),
                "note".into(),
                "version".into(),
                "customer".into(),
            ],
            vec![
                Value::BigInt(1),
                Value::BigInt(100),
                Value::Text("first".into()),
                Value::BigInt(0),
                Value::BigInt(7),
            ],
        );
        let mut inst = Instance::from_row(order_descriptor(), &row).unwrap();
        inst.set_link(2, Link::Many(Lazy::Loaded(vec![Identity::new("Tag", 1_i64)])));
        let snapshot = inst.snapshot();
        let id = inst.identity().unwrap();
        let inst = Arc::new(RwLock::new(inst));
        map.register(id.clone(), Arc::clone(&inst), Some(snapshot), Some(Value::BigInt(0)))
            .unwrap();
        (id, inst)
    }

    #[test]
    fn test_unchanged_entity_has_empty_change_set() {
        let mut map = IdentityMap::new();
        let (id, _) = loaded(&mut map);
        let changes = DirtyChecker::compute_changes(map.get(&id).unwrap()).unwrap();
        assert!(changes.is_empty());
        assert!(!changes.requires_write());
    }

    #[test]
    fn test_attribute_change_display() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        instance::write(&inst).set("total", 150_i64).unwrap();

        let changes = DirtyChecker::compute_changes(map.get(&id).unwrap()).unwrap();
        assert_eq!(changes.to_string(), "update Order.id=1: total 100→150");
        assert_eq!(changes.columns(), vec![("total".to_string(), Value::BigInt(150))]);
    }

    #[test]
    fn test_change_and_revert_is_clean() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        instance::write(&inst).set("total", 150_i64).unwrap();
        instance::write(&inst).set("total", 100_i64).unwrap();
        assert!(!DirtyChecker::is_dirty(map.get(&id).unwrap()).unwrap());
    }

    #[test]
    fn test_equal_value_new_allocation_is_clean() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        let fresh = String::from("fir") + "st";
        instance::write(&inst).set("note", fresh).unwrap();
        assert!(!DirtyChecker::is_dirty(map.get(&id).unwrap()).unwrap());
    }

    #[test]
    fn test_version_attribute_is_not_a_change() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        instance::write(&inst).set_version(Value::BigInt(5));
        assert!(!DirtyChecker::is_dirty(map.get(&id).unwrap()).unwrap());
    }

    #[test]
    fn test_reference_change_becomes_foreign_key_column() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        instance::write(&inst)
            .set_reference("customer", Some(Identity::new("Customer", 8_i64)))
            .unwrap();
        let changes = DirtyChecker::compute_changes(map.get(&id).unwrap()).unwrap();
        assert_eq!(changes.references.len(), 1);
        assert!(changes.references[0].owning);
        assert_eq!(
            changes.columns(),
            vec![("customer".to_string(), Value::BigInt(8))]
        );
        assert_eq!(
            changes.to_string(),
            "update Order.id=1: customer Customer#7→Customer#8"
        );
    }

    #[test]
    fn test_collection_difference_ignores_order() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        {
            let mut order = instance::write(&inst);
            order.add_to("tags", Identity::new("Tag", 2_i64)).unwrap();
            order.remove_from("tags", &Identity::new("Tag", 1_i64)).unwrap();
            order.add_to("tags", Identity::new("Tag", 1_i64)).unwrap();
        }
        let changes = DirtyChecker::compute_changes(map.get(&id).unwrap()).unwrap();
        assert_eq!(changes.collections.len(), 1);
        assert_eq!(changes.collections[0].added, vec![Identity::new("Tag", 2_i64)]);
        assert!(changes.collections[0].removed.is_empty());

        let deltas = changes.collection_deltas();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].relationship, "tags");
    }

    #[test]
    fn test_unloaded_collection_never_changes() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        assert!(!instance::read(&inst).collection("lines").unwrap().is_loaded());
        let changes = DirtyChecker::compute_changes(map.get(&id).unwrap()).unwrap();
        assert!(changes.collections.is_empty());
    }

    #[test]
    fn test_new_and_removed_entries() {
        let mut map = IdentityMap::new();
        let inst = Instance::new(order_descriptor())
            .with("id", 2_i64)
            .unwrap()
            .with("total", 10_i64)
            .unwrap();
        let id = inst.identity().unwrap();
        map.mark_new(id.clone(), Arc::new(RwLock::new(inst))).unwrap();
        let insert = DirtyChecker::compute_changes(map.get(&id).unwrap()).unwrap();
        assert_eq!(insert.kind, ChangeKind::Insert);
        assert_eq!(insert.to_string(), "insert Order.id=2");
        assert_eq!(
            insert.changed_attribute("total").map(|a| &a.new),
            Some(&Value::BigInt(10))
        );

        let (loaded_id, _) = loaded(&mut map);
        map.mark_removed(&loaded_id).unwrap();
        let delete = DirtyChecker::compute_changes(map.get(&loaded_id).unwrap()).unwrap();
        assert_eq!(delete.kind, ChangeKind::Delete);
        assert!(delete.requires_write());
    }

    #[test]
    fn test_primary_key_change_rejected() {
        let mut map = IdentityMap::new();
        let (id, inst) = loaded(&mut map);
        instance::write(&inst).set("id", 99_i64).unwrap();
        let err = DirtyChecker::compute_changes(map.get(&id).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
    }
}
