//! Shared fixtures for relmap integration tests: an in-memory executor and
//! a small order-management schema.

#![allow(dead_code)]

use relmap::{
    AttributeType, CacheConfig, CacheStrategy, CascadeOp, CascadeSet, CollectionDelta, Cx, Engine,
    EntityDescriptor, Error, Executor, ExecutorErrorKind, Fetch, FetchPolicy, Identity, LockMode,
    LockOptions, LockWait, Outcome, Registry, RelationshipDescriptor, RelationshipKind, Row, Value,
    WriteOp,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Customer <- Order -> OrderLine, Order <-> Tag (join), Node <-> Node (cycle).
pub fn order_registry() -> Registry {
    Registry::builder()
        .entity(
            EntityDescriptor::new("Customer", "id")
                .required_attribute("id", AttributeType::BigInt)
                .attribute("name", AttributeType::Text)
                .relationship(
                    RelationshipDescriptor::new("orders", RelationshipKind::CollectionOwned, "Order")
                        .mapped_by("customer"),
                ),
        )
        .entity(
            EntityDescriptor::new("Order", "id")
                .required_attribute("id", AttributeType::BigInt)
                .attribute("total", AttributeType::BigInt)
                .attribute("version", AttributeType::BigInt)
                .version("version")
                .relationship(RelationshipDescriptor::new(
                    "customer",
                    RelationshipKind::SingleReferencing,
                    "Customer",
                ))
                .relationship(
                    RelationshipDescriptor::new("lines", RelationshipKind::CollectionOwned, "OrderLine")
                        .mapped_by("order")
                        .cascade(CascadeSet::ALL)
                        .orphan_removal(true),
                )
                .relationship(RelationshipDescriptor::new(
                    "tags",
                    RelationshipKind::CollectionJoin,
                    "Tag",
                )),
        )
        .entity(
            EntityDescriptor::new("OrderLine", "id")
                .required_attribute("id", AttributeType::BigInt)
                .attribute("sku", AttributeType::Text)
                .attribute("qty", AttributeType::BigInt)
                .relationship(RelationshipDescriptor::new(
                    "order",
                    RelationshipKind::SingleReferencing,
                    "Order",
                )),
        )
        .entity(
            EntityDescriptor::new("Tag", "id")
                .required_attribute("id", AttributeType::BigInt)
                .attribute("label", AttributeType::Text),
        )
        .entity(
            EntityDescriptor::new("Node", "id")
                .required_attribute("id", AttributeType::BigInt)
                .relationship(
                    RelationshipDescriptor::new("next", RelationshipKind::SingleReferencing, "Node")
                        .cascade(CascadeSet::of(&[CascadeOp::Remove, CascadeOp::Persist])),
                ),
        )
        .build()
        .expect("valid order registry")
}

/// A single versioned `Product` entity cached with `strategy`, plus an eager `Supplier` link.
pub fn product_registry(strategy: CacheStrategy) -> Registry {
    Registry::builder()
        .entity(
            EntityDescriptor::new("Supplier", "id")
                .required_attribute("id", AttributeType::BigInt)
                .attribute("name", AttributeType::Text),
        )
        .entity(
            EntityDescriptor::new("Product", "id")
                .required_attribute("id", AttributeType::BigInt)
                .attribute("name", AttributeType::Text)
                .attribute("price", AttributeType::BigInt)
                .attribute("version", AttributeType::BigInt)
                .version("version")
                .cached("products", strategy)
                .relationship(
                    RelationshipDescriptor::new(
                        "supplier",
                        RelationshipKind::SingleReferencing,
                        "Supplier",
                    )
                    .fetch(FetchPolicy::Immediate),
                ),
        )
        .build()
        .expect("valid product registry")
}

/// An engine over [`order_registry`] and an empty store.
pub fn order_engine() -> (Engine, MemoryExecutor) {
    let engine = Engine::new(order_registry());
    let db = MemoryExecutor::new(Arc::clone(engine.registry()));
    (engine, db)
}

/// An engine over [`product_registry`] with an in-memory second-level cache,
/// seeded with `Supplier#1` and `Product#1 {name: "lamp", price: 40, version: 0}`.
pub fn product_engine(strategy: CacheStrategy) -> (Engine, MemoryExecutor) {
    let engine = Engine::builder()
        .registry(product_registry(strategy))
        .cache(CacheConfig::new())
        .build()
        .expect("build product engine");
    let db = MemoryExecutor::new(Arc::clone(engine.registry()));
    db.seed(
        "Supplier",
        &[("id", Value::BigInt(1)), ("name", Value::Text("acme".into()))],
    );
    db.seed(
        "Product",
        &[
            ("id", Value::BigInt(1)),
            ("name", Value::Text("lamp".into())),
            ("price", Value::BigInt(40)),
            ("version", Value::BigInt(0)),
            ("supplier", Value::BigInt(1)),
        ],
    );
    (engine, db)
}

pub fn seed_order(db: &MemoryExecutor, id: i64, total: i64) {
    db.seed(
        "Order",
        &[
            ("id", Value::BigInt(id)),
            ("total", Value::BigInt(total)),
            ("version", Value::BigInt(0)),
            ("customer", Value::Null),
        ],
    );
}

pub fn seed_line(db: &MemoryExecutor, id: i64, order: i64, sku: &str) {
    db.seed(
        "OrderLine",
        &[
            ("id", Value::BigInt(id)),
            ("sku", Value::Text(sku.to_string())),
            ("qty", Value::BigInt(1)),
            ("order", Value::BigInt(order)),
        ],
    );
}

// ============================================================================
// In-memory executor
// ============================================================================

#[derive(Debug, Clone)]
struct StoredRow {
    seq: u64,
    columns: Vec<String>,
    values: Vec<Value>,
}

impl StoredRow {
    fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn set(&mut self, column: &str, value: Value) {
        match self.columns.iter().position(|c| c == column) {
            Some(i) => self.values[i] = value,
            None => {
                self.columns.push(column.to_string());
                self.values.push(value);
            }
        }
    }

    fn to_row(&self, entity: &str) -> Row {
        Row::new(entity, self.columns.clone(), self.values.clone())
    }
}

#[derive(Debug, Clone)]
enum Undo {
    Row(Identity, Option<StoredRow>),
    Links((Identity, String), Option<Vec<Identity>>),
}

#[derive(Debug, Default)]
struct Store {
    rows: HashMap<Identity, StoredRow>,
    links: HashMap<(Identity, String), Vec<Identity>>,
    next_seq: u64,
    /// Identities locked by someone outside the test's sessions.
    foreign_locks: HashSet<Identity>,
    fetches: Vec<Fetch>,
    executed: Vec<String>,
    locks: Vec<(Identity, LockMode)>,
    commits: usize,
    rollbacks: usize,
}

/// A versioned in-memory store shared by every handle created from it.
///
/// Each handle ([`connect`](Self::connect)) has its own transaction: writes
/// apply immediately and are undone on rollback.
#[derive(Debug, Clone)]
pub struct MemoryExecutor {
    registry: Arc<Registry>,
    store: Arc<Mutex<Store>>,
    undo: Arc<Mutex<Vec<Undo>>>,
}

impl MemoryExecutor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            store: Arc::new(Mutex::new(Store::default())),
            undo: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Another connection to the same store, with its own transaction.
    pub fn connect(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            undo: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed a row directly, outside any transaction.
    pub fn seed(&self, entity: &str, columns: &[(&str, Value)]) {
        let descriptor = self.registry.require(entity).expect("known entity");
        let key = columns
            .iter()
            .find(|(c, _)| *c == descriptor.primary_key())
            .map(|(_, v)| v.clone())
            .expect("seed row has a primary key");
        let mut store = self.store();
        store.next_seq += 1;
        let row = StoredRow {
            seq: store.next_seq,
            columns: columns.iter().map(|(c, _)| (*c).to_string()).collect(),
            values: columns.iter().map(|(_, v)| v.clone()).collect(),
        };
        store.rows.insert(Identity::new(entity, key), row);
    }

    /// Seed a join-table membership.
    pub fn seed_link(&self, owner: Identity, relationship: &str, member: Identity) {
        self.store()
            .links
            .entry((owner, relationship.to_string()))
            .or_default()
            .push(member);
    }

    /// Overwrite one column as a concurrent writer would (bumping the version if any).
    pub fn concurrent_update(&self, identity: &Identity, column: &str, value: Value) {
        let descriptor = self
            .registry
            .require(identity.entity())
            .expect("known entity");
        let version = descriptor.version_attribute().map(str::to_string);
        let mut store = self.store();
        let row = store.rows.get_mut(identity).expect("row exists");
        row.set(column, value);
        if let Some(version) = version {
            let next = row
                .get(&version)
                .and_then(Value::next_version)
                .unwrap_or(Value::BigInt(0));
            row.set(&version, next);
        }
    }

    pub fn hold_foreign_lock(&self, identity: Identity) {
        self.store().foreign_locks.insert(identity);
    }

    pub fn value(&self, identity: &Identity, column: &str) -> Option<Value> {
        self.store()
            .rows
            .get(identity)
            .and_then(|r| r.get(column).cloned())
    }

    pub fn exists(&self, identity: &Identity) -> bool {
        self.store().rows.contains_key(identity)
    }

    pub fn members(&self, owner: &Identity, relationship: &str) -> Vec<Identity> {
        self.store()
            .links
            .get(&(owner.clone(), relationship.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fetch_count(&self) -> usize {
        self.store().fetches.len()
    }

    pub fn fetches(&self) -> Vec<Fetch> {
        self.store().fetches.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.store().executed.clone()
    }

    pub fn clear_log(&self) {
        let mut store = self.store();
        store.fetches.clear();
        store.executed.clear();
        store.locks.clear();
    }

    pub fn locks(&self) -> Vec<(Identity, LockMode)> {
        self.store().locks.clone()
    }

    pub fn commits(&self) -> usize {
        self.store().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.store().rollbacks
    }

    fn rows_sorted<'a>(rows: impl Iterator<Item = (&'a Identity, &'a StoredRow)>) -> Vec<Row> {
        let mut found: Vec<_> = rows.collect();
        found.sort_by_key(|(_, r)| r.seq);
        found
            .into_iter()
            .map(|(id, r)| r.to_row(id.entity()))
            .collect()
    }

    fn run_fetch(&self, fetch: &Fetch) -> Result<Vec<Row>, Error> {
        let mut store = self.store();
        store.fetches.push(fetch.clone());
        let rows = match fetch {
            Fetch::ById(identity) => store
                .rows
                .get(identity)
                .map(|r| r.to_row(identity.entity()))
                .into_iter()
                .collect(),
            Fetch::ByIds { entity, keys } => Self::rows_sorted(
                store
                    .rows
                    .iter()
                    .filter(|(id, _)| id.is_a(entity) && keys.iter().any(|k| k.key_eq(id.key()))),
            ),
            Fetch::Collection {
                owner,
                relationship,
            } => {
                let descriptor = self.registry.require(owner.entity())?;
                let idx = descriptor.require_relationship(relationship)?;
                let rel = &descriptor.relationships()[idx];
                if let Some(mapped_by) = &rel.mapped_by {
                    Self::rows_sorted(store.rows.iter().filter(|(id, row)| {
                        id.is_a(&rel.target)
                            && row.get(mapped_by).is_some_and(|v| v.key_eq(owner.key()))
                    }))
                } else {
                    let members = store
                        .links
                        .get(&(owner.clone(), relationship.clone()))
                        .cloned()
                        .unwrap_or_default();
                    members
                        .iter()
                        .filter_map(|m| store.rows.get(m).map(|r| r.to_row(m.entity())))
                        .collect()
                }
            }
            Fetch::Query(spec) => {
                let mut rows = Self::rows_sorted(store.rows.iter().filter(|(id, _)| id.is_a(&spec.entity)));
                rows.retain(|row| spec.matches(row));
                if let Some(limit) = spec.limit {
                    rows.truncate(limit);
                }
                rows
            }
        };
        Ok(rows)
    }

    fn apply_deltas(&self, store: &mut Store, owner: &Identity, deltas: &[CollectionDelta]) {
        let mut undo = self.undo.lock().unwrap_or_else(|p| p.into_inner());
        for delta in deltas {
            let key = (owner.clone(), delta.relationship.clone());
            undo.push(Undo::Links(key.clone(), store.links.get(&key).cloned()));
            let members = store.links.entry(key).or_default();
            members.retain(|m| !delta.removed.contains(m));
            for added in &delta.added {
                if !members.contains(added) {
                    members.push(added.clone());
                }
            }
        }
    }

    fn run_write(&self, op: &WriteOp) -> Result<u64, Error> {
        let mut store = self.store();
        store.executed.push(op.to_string());
        let identity = op.identity().clone();
        let descriptor = self.registry.require(identity.entity())?;
        let version_column = descriptor.version_attribute().map(str::to_string);

        let version_ok = |row: &StoredRow, expected: Option<&Value>| match (&version_column, expected) {
            (Some(column), Some(expected)) => {
                row.get(column).cloned().unwrap_or(Value::Null).key_eq(expected)
            }
            _ => true,
        };

        match op {
            WriteOp::Insert {
                row, collections, ..
            } => {
                if store.rows.contains_key(&identity) {
                    return Err(Error::executor(
                        ExecutorErrorKind::Constraint,
                        format!("duplicate key {identity}"),
                    ));
                }
                store.next_seq += 1;
                let stored = StoredRow {
                    seq: store.next_seq,
                    columns: row.column_info().names().to_vec(),
                    values: row.values().to_vec(),
                };
                self.undo
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(Undo::Row(identity.clone(), None));
                store.rows.insert(identity.clone(), stored);
                self.apply_deltas(&mut store, &identity, collections);
                Ok(1)
            }
            WriteOp::Update {
                columns,
                collections,
                expected_version,
                new_version,
                ..
            } => {
                let Some(current) = store.rows.get(&identity).cloned() else {
                    return Ok(0);
                };
                if !version_ok(&current, expected_version.as_ref()) {
                    return Ok(0);
                }
                let mut updated = current.clone();
                for (column, value) in columns {
                    updated.set(column, value.clone());
                }
                if let (Some(column), Some(version)) = (&version_column, new_version) {
                    updated.set(column, version.clone());
                }
                self.undo
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(Undo::Row(identity.clone(), Some(current)));
                store.rows.insert(identity.clone(), updated);
                self.apply_deltas(&mut store, &identity, collections);
                Ok(1)
            }
            WriteOp::Delete {
                expected_version, ..
            } => {
                let Some(current) = store.rows.get(&identity).cloned() else {
                    return Ok(0);
                };
                if !version_ok(&current, expected_version.as_ref()) {
                    return Ok(0);
                }
                self.undo
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(Undo::Row(identity.clone(), Some(current)));
                store.rows.remove(&identity);
                Ok(1)
            }
        }
    }

    fn run_lock(&self, identity: &Identity, options: LockOptions) -> Result<Option<Row>, Error> {
        let mut store = self.store();
        if store.foreign_locks.contains(identity) {
            return match options.wait {
                LockWait::SkipLocked => Ok(None),
                LockWait::NoWait | LockWait::Block => Err(Error::executor(
                    ExecutorErrorKind::LockUnavailable,
                    format!("{identity} is locked"),
                )),
            };
        }
        store.locks.push((identity.clone(), options.mode));
        Ok(store
            .rows
            .get(identity)
            .map(|r| r.to_row(identity.entity())))
    }

    fn finish(&self, rollback: bool) {
        let undo = std::mem::take(&mut *self.undo.lock().unwrap_or_else(|p| p.into_inner()));
        let mut store = self.store();
        if rollback {
            store.rollbacks += 1;
            for entry in undo.into_iter().rev() {
                match entry {
                    Undo::Row(id, Some(row)) => {
                        store.rows.insert(id, row);
                    }
                    Undo::Row(id, None) => {
                        store.rows.remove(&id);
                    }
                    Undo::Links(key, Some(members)) => {
                        store.links.insert(key, members);
                    }
                    Undo::Links(key, None) => {
                        store.links.remove(&key);
                    }
                }
            }
        } else {
            store.commits += 1;
        }
    }
}

fn outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl Executor for MemoryExecutor {
    fn fetch(&self, _cx: &Cx, fetch: &Fetch) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.run_fetch(fetch);
        async move { outcome(result) }
    }

    fn execute(&self, _cx: &Cx, op: &WriteOp) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.run_write(op);
        async move { outcome(result) }
    }

    fn lock(
        &self,
        _cx: &Cx,
        identity: &Identity,
        options: LockOptions,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self.run_lock(identity, options);
        async move { outcome(result) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.undo.lock().unwrap_or_else(|p| p.into_inner()).clear();
        async { Outcome::Ok(()) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.finish(false);
        async { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.finish(true);
        async { Outcome::Ok(()) }
    }
}
