//! Entity and relationship metadata.
//!
//! Descriptors are built once (usually by a [`MetadataSource`](crate::MetadataSource)),
//! validated by [`RegistryBuilder`](crate::RegistryBuilder) and then shared read-only
//! behind `Arc` by every unit of work. Nothing here changes after the registry is built.

use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Storage type of a scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    Bool,
    Int,
    BigInt,
    Double,
    Decimal,
    Text,
    Bytes,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl AttributeType {
    /// Whether `value` can be stored in an attribute of this type.
    ///
    /// `Null` is accepted here; nullability is checked separately.
    /// Integer attributes accept both integer widths.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (AttributeType::Bool, Value::Bool(_)) => true,
            (AttributeType::Int | AttributeType::BigInt, Value::Int(_) | Value::BigInt(_)) => true,
            (AttributeType::Double, Value::Double(_) | Value::Int(_) | Value::BigInt(_)) => true,
            (AttributeType::Decimal, Value::Decimal(_)) => true,
            (AttributeType::Text, Value::Text(_)) => true,
            (AttributeType::Bytes, Value::Bytes(_)) => true,
            (AttributeType::Date, Value::Date(_)) => true,
            (AttributeType::Timestamp, Value::Timestamp(_)) => true,
            (AttributeType::Uuid, Value::Uuid(_)) => true,
            (AttributeType::Json, Value::Json(_)) => true,
            _ => false,
        }
    }

    /// Integer types are the only ones usable as version counters.
    pub const fn is_integer(self) -> bool {
        matches!(self, AttributeType::Int | AttributeType::BigInt)
    }
}

/// A scalar attribute of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub ty: AttributeType,
    pub nullable: bool,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, ty: AttributeType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    /// Mark the attribute as NOT NULL.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Shape of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// One-to-one where this entity owns the target's lifecycle.
    SingleOwned,
    /// Many-to-one reference to an independent entity.
    SingleReferencing,
    /// One-to-many; members belong to this entity.
    CollectionOwned,
    /// Many-to-many through link rows.
    CollectionJoin,
}

impl RelationshipKind {
    pub const fn is_collection(self) -> bool {
        matches!(
            self,
            RelationshipKind::CollectionOwned | RelationshipKind::CollectionJoin
        )
    }
}

/// An operation that may cascade along a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CascadeOp {
    Persist,
    Merge,
    Remove,
    Refresh,
    Detach,
}

impl CascadeOp {
    const fn bit(self) -> u8 {
        match self {
            CascadeOp::Persist => 1,
            CascadeOp::Merge => 1 << 1,
            CascadeOp::Remove => 1 << 2,
            CascadeOp::Refresh => 1 << 3,
            CascadeOp::Detach => 1 << 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeOp::Persist => "persist",
            CascadeOp::Merge => "merge",
            CascadeOp::Remove => "remove",
            CascadeOp::Refresh => "refresh",
            CascadeOp::Detach => "detach",
        }
    }
}

impl fmt::Display for CascadeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of operations that cascade along a relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CascadeSet(u8);

impl CascadeSet {
    pub const NONE: CascadeSet = CascadeSet(0);
    pub const ALL: CascadeSet = CascadeSet(0b1_1111);

    /// Build a set from individual operations.
    pub fn of(ops: &[CascadeOp]) -> Self {
        ops.iter().fold(Self::NONE, |set, op| set.with(*op))
    }

    /// Parse a cascade option string such as `"persist, merge"` or `"all"`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut set = Self::NONE;
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            set = match part.to_ascii_lowercase().as_str() {
                "all" => Self::ALL,
                "persist" | "save-update" => set.with(CascadeOp::Persist),
                "merge" => set.with(CascadeOp::Merge),
                "remove" | "delete" => set.with(CascadeOp::Remove),
                "refresh" => set.with(CascadeOp::Refresh),
                "detach" | "expunge" => set.with(CascadeOp::Detach),
                other => {
                    return Err(Error::metadata(
                        None,
                        format!("unknown cascade option '{other}'"),
                    ));
                }
            };
        }
        Ok(set)
    }

    pub const fn with(self, op: CascadeOp) -> Self {
        CascadeSet(self.0 | op.bit())
    }

    pub const fn contains(self, op: CascadeOp) -> bool {
        self.0 & op.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// When the target of a relationship is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchPolicy {
    /// Loaded together with the owner.
    Immediate,
    /// Loaded on first access through a deferred handle.
    #[default]
    Deferred,
}

/// A relationship from one entity type to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub kind: RelationshipKind,
    /// This side holds the foreign key (single) or the link rows (collection).
    pub owning: bool,
    pub target: String,
    /// For inverse collections: the single-valued relationship on the target
    /// that holds the foreign key back to this entity.
    pub mapped_by: Option<String>,
    pub cascade: CascadeSet,
    pub fetch: FetchPolicy,
    pub orphan_removal: bool,
}

impl RelationshipDescriptor {
    /// Create a relationship with the default owning side for `kind`.
    ///
    /// References and join collections default to owning; owned singles and
    /// owned collections default to the inverse side.
    pub fn new(name: impl Into<String>, kind: RelationshipKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            owning: matches!(
                kind,
                RelationshipKind::SingleReferencing | RelationshipKind::CollectionJoin
            ),
            target: target.into(),
            mapped_by: None,
            cascade: CascadeSet::NONE,
            fetch: FetchPolicy::Deferred,
            orphan_removal: false,
        }
    }

    pub fn owning(mut self, value: bool) -> Self {
        self.owning = value;
        self
    }

    pub fn mapped_by(mut self, relationship: impl Into<String>) -> Self {
        self.mapped_by = Some(relationship.into());
        self.owning = false;
        self
    }

    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn fetch(mut self, fetch: FetchPolicy) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    pub const fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }

    /// This entity's row cannot exist before the target's row does.
    pub const fn depends_on_target(&self) -> bool {
        !self.kind.is_collection() && self.owning
    }

    /// The target's row cannot exist before this entity's row does.
    pub fn target_depends_on_self(&self) -> bool {
        match self.kind {
            RelationshipKind::SingleOwned | RelationshipKind::SingleReferencing => !self.owning,
            RelationshipKind::CollectionOwned => true,
            RelationshipKind::CollectionJoin => false,
        }
    }

    /// Changes to this link are written through this side.
    pub const fn writes_link(&self) -> bool {
        self.owning
    }
}

/// Second-level cache concurrency strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheStrategy {
    ReadOnly,
    NonstrictReadWrite,
    ReadWrite,
    Transactional,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheStrategy::ReadOnly => "read-only",
            CacheStrategy::NonstrictReadWrite => "nonstrict-read-write",
            CacheStrategy::ReadWrite => "read-write",
            CacheStrategy::Transactional => "transactional",
        })
    }
}

/// Where and how an entity type is cached across units of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCacheConfig {
    pub region: String,
    pub strategy: CacheStrategy,
}

/// Metadata for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    name: Arc<str>,
    attributes: Vec<AttributeDescriptor>,
    primary_key: String,
    version: Option<String>,
    relationships: Vec<RelationshipDescriptor>,
    cache: Option<EntityCacheConfig>,
    /// Position in registry declaration order.
    pub(crate) ordinal: usize,
    /// Topological rank by foreign-key dependency (0 = depends on nothing).
    pub(crate) rank: usize,
}

impl EntityDescriptor {
    /// Start describing entity type `name` with primary key attribute `primary_key`.
    ///
    /// The primary key must also be declared with [`attribute`](Self::attribute).
    pub fn new(name: &str, primary_key: &str) -> Self {
        Self {
            name: Arc::from(name),
            attributes: Vec::new(),
            primary_key: primary_key.to_string(),
            version: None,
            relationships: Vec::new(),
            cache: None,
            ordinal: 0,
            rank: 0,
        }
    }

    pub fn attribute(mut self, name: &str, ty: AttributeType) -> Self {
        self.attributes.push(AttributeDescriptor::new(name, ty));
        self
    }

    pub fn required_attribute(mut self, name: &str, ty: AttributeType) -> Self {
        self.attributes
            .push(AttributeDescriptor::new(name, ty).required());
        self
    }

    /// Use integer attribute `name` as the optimistic version counter.
    pub fn version(mut self, name: &str) -> Self {
        self.version = Some(name.to_string());
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn cached(mut self, region: &str, strategy: CacheStrategy) -> Self {
        self.cache = Some(EntityCacheConfig {
            region: region.to_string(),
            strategy,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn relationships(&self) -> &[RelationshipDescriptor] {
        &self.relationships
    }

    pub(crate) fn relationships_mut(&mut self) -> &mut [RelationshipDescriptor] {
        &mut self.relationships
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn version_attribute(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn cache(&self) -> Option<&EntityCacheConfig> {
        self.cache.as_ref()
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn relationship_index(&self, name: &str) -> Option<usize> {
        self.relationships.iter().position(|r| r.name == name)
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Index of the primary key attribute.
    ///
    /// Registry validation guarantees it exists; unvalidated descriptors
    /// fall back to the first attribute.
    pub fn primary_key_index(&self) -> usize {
        self.attribute_index(&self.primary_key).unwrap_or(0)
    }

    pub fn version_index(&self) -> Option<usize> {
        self.version
            .as_deref()
            .and_then(|v| self.attribute_index(v))
    }

    /// Look up an attribute index, failing with a lifecycle error for unknown names.
    pub fn require_attribute(&self, name: &str) -> Result<usize> {
        self.attribute_index(name).ok_or_else(|| {
            Error::lifecycle(
                None,
                format!("{} has no attribute '{}'", self.name, name),
            )
        })
    }

    /// Look up a relationship index, failing with a lifecycle error for unknown names.
    pub fn require_relationship(&self, name: &str) -> Result<usize> {
        self.relationship_index(name).ok_or_else(|| {
            Error::lifecycle(
                None,
                format!("{} has no relationship '{}'", self.name, name),
            )
        })
    }
}
