//! Cascade expansion over the in-memory entity graph.
//!
//! The engine walks relationships whose cascade set contains the operation,
//! depth-first with a visited set, and returns the affected entities in the
//! order the operation must be applied:
//!
//! - persist and merge: foreign-key targets before the entity, dependents after
//! - remove: dependents before the entity, foreign-key targets after
//! - refresh and detach: the entity before anything it reaches
//!
//! Links hold identities, so the engine needs a [`GraphView`] to turn a target
//! identity into an instance. Targets the view does not know are skipped.
//! Expansion never mutates anything; a bound violation aborts the whole walk.

use crate::identity_map::{EntryStatus, ManagedEntry};
use relmap_core::{
    CascadeError, CascadeOp, EntityRef, Error, Identity, Lazy, Link, RelationshipKind, Result,
    instance,
};
use std::collections::HashSet;

/// Resolves identities to instances during expansion.
pub trait GraphView {
    fn instance(&self, identity: &Identity) -> Option<EntityRef>;
}

impl<F> GraphView for F
where
    F: Fn(&Identity) -> Option<EntityRef>,
{
    fn instance(&self, identity: &Identity) -> Option<EntityRef> {
        self(identity)
    }
}

/// One entity an operation applies to.
#[derive(Debug, Clone)]
pub struct CascadeStep {
    pub op: CascadeOp,
    pub identity: Identity,
    pub instance: EntityRef,
    /// Distance from the root (0 for the root itself).
    pub depth: usize,
    /// Produced by orphan removal rather than an explicit call.
    pub implicit: bool,
}

/// An element dropped from an orphan-removing collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub identity: Identity,
    pub parent: Identity,
    pub relationship: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CascadeEngine {
    max_depth: usize,
    max_steps: usize,
}

impl Default for CascadeEngine {
    fn default() -> Self {
        Self::new(64, 10_000)
    }
}

impl CascadeEngine {
    pub fn new(max_depth: usize, max_steps: usize) -> Self {
        Self {
            max_depth,
            max_steps,
        }
    }

    /// Expand `op` from `root`. Each identity appears at most once.
    #[tracing::instrument(level = "debug", skip_all, fields(op = %op))]
    pub fn expand(
        &self,
        op: CascadeOp,
        root: &EntityRef,
        view: &dyn GraphView,
    ) -> Result<Vec<CascadeStep>> {
        let root_id = instance::read(root).require_identity()?;
        let mut walk = Walk {
            engine: self,
            op,
            root: root_id.clone(),
            view,
            visited: HashSet::new(),
            steps: Vec::new(),
        };
        walk.visit(root_id, root.clone(), 0)?;
        tracing::debug!(steps = walk.steps.len(), "Cascade expanded");
        Ok(walk.steps)
    }

    /// Expand an implicit removal (orphan), marking every step as implicit.
    pub fn expand_orphan(
        &self,
        orphan: &EntityRef,
        view: &dyn GraphView,
    ) -> Result<Vec<CascadeStep>> {
        let mut steps = self.expand(CascadeOp::Remove, orphan, view)?;
        for step in &mut steps {
            step.implicit = true;
        }
        Ok(steps)
    }

    /// Elements that left an orphan-removing collection and belong to no other loaded collection.
    ///
    /// Only managed parents with a loaded collection and a snapshot are inspected.
    pub fn orphans<'a>(entries: impl Iterator<Item = &'a ManagedEntry> + Clone) -> Vec<Orphan> {
        let mut dropped = Vec::new();
        for entry in entries.clone() {
            if entry.status() != EntryStatus::Managed {
                continue;
            }
            let Some(snapshot) = entry.snapshot() else {
                continue;
            };
            let current = instance::read(entry.instance());
            for (idx, rel) in current.descriptor().relationships().iter().enumerate() {
                if rel.kind != RelationshipKind::CollectionOwned || !rel.orphan_removal {
                    continue;
                }
                let (Link::Many(Lazy::Loaded(now)), Some(Link::Many(Lazy::Loaded(before)))) =
                    (&current.links()[idx], snapshot.links.get(idx))
                else {
                    continue;
                };
                for member in before.iter().filter(|m| !now.contains(m)) {
                    dropped.push(Orphan {
                        identity: member.clone(),
                        parent: entry.identity().clone(),
                        relationship: rel.name.clone(),
                    });
                }
            }
        }
        if dropped.is_empty() {
            return dropped;
        }

        // Anything re-parented into another loaded collection survives.
        let mut adopted = HashSet::new();
        for entry in entries {
            if entry.status() == EntryStatus::Removed {
                continue;
            }
            let current = instance::read(entry.instance());
            for link in current.links() {
                if let Link::Many(Lazy::Loaded(members)) = link {
                    adopted.extend(members.iter().cloned());
                }
            }
        }
        dropped.retain(|o| !adopted.contains(&o.identity));
        dropped.dedup_by(|a, b| a.identity == b.identity);
        dropped
    }
}

struct Walk<'a> {
    engine: &'a CascadeEngine,
    op: CascadeOp,
    root: Identity,
    view: &'a dyn GraphView,
    visited: HashSet<Identity>,
    steps: Vec<CascadeStep>,
}

impl Walk<'_> {
    fn bound_error(&self, depth: usize) -> Error {
        Error::OrphanCascadeCycle(CascadeError {
            root: self.root.clone(),
            operation: self.op.as_str(),
            depth,
            steps: self.steps.len(),
        })
    }

    fn push(&mut self, identity: Identity, entity: EntityRef, depth: usize) -> Result<()> {
        if self.steps.len() >= self.engine.max_steps {
            return Err(self.bound_error(depth));
        }
        tracing::trace!(identity = %identity, depth, "Cascade step");
        self.steps.push(CascadeStep {
            op: self.op,
            identity,
            instance: entity,
            depth,
            implicit: false,
        });
        Ok(())
    }

    fn visit(&mut self, identity: Identity, entity: EntityRef, depth: usize) -> Result<()> {
        if !self.visited.insert(identity.clone()) {
            return Ok(());
        }
        if depth > self.engine.max_depth {
            return Err(self.bound_error(depth));
        }

        let mut before = Vec::new();
        let mut after = Vec::new();
        {
            let current = instance::read(&entity);
            for (rel, link) in current.descriptor().relationships().iter().zip(current.links()) {
                if !rel.cascade.contains(self.op) {
                    continue;
                }
                let first = match self.op {
                    CascadeOp::Persist | CascadeOp::Merge => rel.depends_on_target(),
                    CascadeOp::Remove => rel.target_depends_on_self(),
                    CascadeOp::Refresh | CascadeOp::Detach => false,
                };
                if first {
                    before.extend(link.targets());
                } else {
                    after.extend(link.targets());
                }
            }
        }

        for target in before {
            self.visit_target(target, depth + 1)?;
        }
        self.push(identity, entity, depth)?;
        for target in after {
            self.visit_target(target, depth + 1)?;
        }
        Ok(())
    }

    fn visit_target(&mut self, target: Identity, depth: usize) -> Result<()> {
        if self.visited.contains(&target) {
            return Ok(());
        }
        match self.view.instance(&target) {
            Some(entity) => self.visit(target, entity, depth),
            None => {
                tracing::trace!(identity = %target, "Cascade target not in memory, skipped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_map::IdentityMap;
    use relmap_core::{
        AttributeType, CascadeSet, EntityDescriptor, Instance, RelationshipDescriptor,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    fn descriptors() -> (Arc<EntityDescriptor>, Arc<EntityDescriptor>) {
        let order = EntityDescriptor::new("Order", "id")
            .required_attribute("id", AttributeType::BigInt)
            .relationship(
                RelationshipDescriptor::new("customer", RelationshipKind::SingleReferencing, "Customer")
                    .cascade(CascadeSet::of(&[CascadeOp::Persist])),
            )
            .relationship(
                RelationshipDescriptor::new("lines", RelationshipKind::CollectionOwned, "Line")
                    .mapped_by("order")
                    .cascade(CascadeSet::ALL)
                    .orphan_removal(true),
            );
        let line = EntityDescriptor::new("Line", "id")
            .required_attribute("id", AttributeType::BigInt)
            .relationship(
                RelationshipDescriptor::new("order", RelationshipKind::SingleReferencing, "Order")
                    .cascade(CascadeSet::of(&[CascadeOp::Remove])),
            );
        (Arc::new(order), Arc::new(line))
    }

    fn customer_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::new("Customer", "id").required_attribute("id", AttributeType::BigInt),
        )
    }

    struct Graph {
        nodes: HashMap<Identity, EntityRef>,
    }

    impl Graph {
        fn add(&mut self, inst: Instance) -> EntityRef {
            let id = inst.identity().unwrap();
            let entity = Arc::new(RwLock::new(inst));
            self.nodes.insert(id, Arc::clone(&entity));
            entity
        }

        fn view(&self) -> impl Fn(&Identity) -> Option<EntityRef> + '_ {
            |id| self.nodes.get(id).cloned()
        }
    }

    /// Order 1 with customer 9 and lines 10, 11; lines point back at the order.
    fn graph() -> (Graph, EntityRef) {
        let (order_desc, line_desc) = descriptors();
        let mut graph = Graph {
            nodes: HashMap::new(),
        };
        let mut order = Instance::new(order_desc).with("id", 1_i64).unwrap();
        order
            .set_reference("customer", Some(Identity::new("Customer", 9_i64)))
            .unwrap();
        for line_id in [10_i64, 11] {
            let mut line = Instance::new(Arc::clone(&line_desc))
                .with("id", line_id)
                .unwrap();
            line.set_reference("order", Some(Identity::new("Order", 1_i64)))
                .unwrap();
            order.add_to("lines", line.identity().unwrap()).unwrap();
            graph.add(line);
        }
        graph.add(Instance::new(customer_descriptor()).with("id", 9_i64).unwrap());
        let root = graph.add(order);
        (graph, root)
    }

    fn ids(steps: &[CascadeStep]) -> Vec<String> {
        steps.iter().map(|s| s.identity.to_string()).collect()
    }

    #[test]
    fn test_persist_orders_targets_before_dependents() {
        let (graph, root) = graph();
        let view = graph.view();
        let steps = CascadeEngine::default()
            .expand(CascadeOp::Persist, &root, &view)
            .unwrap();
        assert_eq!(ids(&steps), vec!["Customer#9", "Order#1", "Line#10", "Line#11"]);
        assert_eq!(steps[1].depth, 0);
        assert_eq!(steps[2].depth, 1);
    }

    #[test]
    fn test_remove_cycle_terminates_and_emits_once() {
        // Order -> lines (remove) and Line -> order (remove) form a cycle.
        let (graph, root) = graph();
        let view = graph.view();
        let steps = CascadeEngine::default()
            .expand(CascadeOp::Remove, &root, &view)
            .unwrap();
        // Dependents first; customer is not on a remove edge.
        assert_eq!(ids(&steps), vec!["Line#10", "Line#11", "Order#1"]);

        let line = graph.nodes[&Identity::new("Line", 10_i64)].clone();
        let from_line = CascadeEngine::default()
            .expand(CascadeOp::Remove, &line, &view)
            .unwrap();
        let mut seen = ids(&from_line);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), from_line.len());
        assert_eq!(from_line.len(), 3);
    }

    #[test]
    fn test_detach_is_preorder() {
        let (graph, root) = graph();
        let view = graph.view();
        let steps = CascadeEngine::default()
            .expand(CascadeOp::Detach, &root, &view)
            .unwrap();
        assert_eq!(ids(&steps), vec!["Order#1", "Line#10", "Line#11"]);
    }

    #[test]
    fn test_unknown_targets_are_skipped() {
        let (graph, root) = graph();
        let steps = CascadeEngine::default()
            .expand(CascadeOp::Persist, &root, &|_: &Identity| -> Option<EntityRef> { None })
            .unwrap();
        assert_eq!(ids(&steps), vec!["Order#1"]);
        drop(graph);
    }

    #[test]
    fn test_step_bound_aborts() {
        let (graph, root) = graph();
        let view = graph.view();
        let err = CascadeEngine::new(64, 2)
            .expand(CascadeOp::Persist, &root, &view)
            .unwrap_err();
        match err {
            Error::OrphanCascadeCycle(e) => {
                assert_eq!(e.root, Identity::new("Order", 1_i64));
                assert_eq!(e.operation, "persist");
                assert_eq!(e.steps, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_depth_bound_aborts() {
        let (graph, root) = graph();
        let view = graph.view();
        let err = CascadeEngine::new(0, 100)
            .expand(CascadeOp::Persist, &root, &view)
            .unwrap_err();
        assert!(matches!(err, Error::OrphanCascadeCycle(_)));
    }

    #[test]
    fn test_orphans_detected_unless_adopted() {
        let (graph, root) = graph();
        let mut map = IdentityMap::new();
        let snapshot = instance::read(&root).snapshot();
        map.register(Identity::new("Order", 1_i64), Arc::clone(&root), Some(snapshot), None)
            .unwrap();

        instance::write(&root)
            .remove_from("lines", &Identity::new("Line", 10_i64))
            .unwrap();
        let orphans = CascadeEngine::orphans(map.entries());
        assert_eq!(
            orphans,
            vec![Orphan {
                identity: Identity::new("Line", 10_i64),
                parent: Identity::new("Order", 1_i64),
                relationship: "lines".into(),
            }]
        );

        // A second order adopting the line keeps it alive.
        let (order_desc, _) = descriptors();
        let mut other = Instance::new(order_desc).with("id", 2_i64).unwrap();
        other.add_to("lines", Identity::new("Line", 10_i64)).unwrap();
        let other_id = other.identity().unwrap();
        map.mark_new(other_id, Arc::new(RwLock::new(other))).unwrap();
        assert!(CascadeEngine::orphans(map.entries()).is_empty());
        drop(graph);
    }
}
