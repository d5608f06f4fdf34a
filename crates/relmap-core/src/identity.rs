//! Entity identities.
//!
//! An [`Identity`] is the `(entity type, primary key)` pair that keys every
//! managed entry, every relationship link and every second-level cache item.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// `(entity type name, primary key value)`.
///
/// Cloning is cheap: the entity name is shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    entity: Arc<str>,
    key: Value,
}

impl Identity {
    /// Create an identity for `entity` with primary key `key`.
    pub fn new(entity: impl Into<Arc<str>>, key: impl Into<Value>) -> Self {
        Self {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// The entity type name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The shared entity type name.
    pub fn entity_arc(&self) -> &Arc<str> {
        &self.entity
    }

    /// The primary key value.
    pub fn key(&self) -> &Value {
        &self.key
    }

    /// Whether this identity belongs to entity type `entity`.
    pub fn is_a(&self, entity: &str) -> bool {
        &*self.entity == entity
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.key.key_eq(&other.key)
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.key.hash_into(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_equality_by_type_and_key() {
        let a = Identity::new("Order", 1_i64);
        let b = Identity::new("Order", 1_i64);
        let c = Identity::new("Customer", 1_i64);
        let d = Identity::new("Order", 2_i64);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<Identity> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_identity_key_types_do_not_collide() {
        let numeric = Identity::new("Order", 42_i64);
        let textual = Identity::new("Order", "42");
        assert_ne!(numeric, textual);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::new("Order", 7_i64).to_string(), "Order#7");
    }
}
