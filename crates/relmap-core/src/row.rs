//! Rows exchanged with the executor.
//!
//! A row carries one column per scalar attribute plus one column per owning
//! single-valued relationship (holding the target's primary key, or `Null`).

use crate::descriptor::EntityDescriptor;
use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// The column layout used for rows of `descriptor`.
    pub fn for_entity(descriptor: &EntityDescriptor) -> Self {
        let names = descriptor
            .attributes()
            .iter()
            .map(|a| a.name.clone())
            .chain(
                descriptor
                    .relationships()
                    .iter()
                    .filter(|r| r.depends_on_target())
                    .map(|r| r.name.clone()),
            )
            .collect();
        Self::new(names)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    entity: Arc<str>,
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row for entity type `entity` from column names and values.
    pub fn new(entity: impl Into<Arc<str>>, column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            columns: Arc::new(ColumnInfo::new(column_names)),
            values,
        }
    }

    /// Create a row sharing column metadata with other rows of the same result set.
    pub fn with_columns(
        entity: impl Into<Arc<str>>,
        columns: Arc<ColumnInfo>,
        values: Vec<Value>,
    ) -> Self {
        Self {
            entity: entity.into(),
            columns,
            values,
        }
    }

    /// The entity type this row belongs to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a column, failing with a lifecycle error when it is absent.
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.get_by_name(name).ok_or_else(|| {
            Error::lifecycle(
                None,
                format!("row for {} has no column '{}'", self.entity, name),
            )
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{AttributeType, RelationshipDescriptor, RelationshipKind};

    #[test]
    fn test_row_lookup() {
        let row = Row::new(
            "Order",
            vec!["id".to_string(), "total".to_string()],
            vec![Value::BigInt(1), Value::BigInt(100)],
        );
        assert_eq!(row.entity(), "Order");
        assert_eq!(row.get_by_name("total"), Some(&Value::BigInt(100)));
        assert!(row.require("missing").is_err());
        assert_eq!(row.iter().count(), 2);
    }

    #[test]
    fn test_entity_columns_include_foreign_keys_only() {
        let desc = EntityDescriptor::new("Order", "id")
            .required_attribute("id", AttributeType::BigInt)
            .relationship(RelationshipDescriptor::new(
                "customer",
                RelationshipKind::SingleReferencing,
                "Customer",
            ))
            .relationship(RelationshipDescriptor::new(
                "lines",
                RelationshipKind::CollectionOwned,
                "Line",
            ));
        let columns = ColumnInfo::for_entity(&desc);
        assert_eq!(columns.names(), ["id".to_string(), "customer".to_string()]);
    }
}
