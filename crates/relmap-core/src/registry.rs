//! The entity descriptor registry.

use crate::descriptor::{EntityDescriptor, RelationshipKind};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Produces a validated registry (mapping files, annotations, hand-written code).
pub trait MetadataSource {
    fn load(&self) -> Result<Registry>;
}

impl<F> MetadataSource for F
where
    F: Fn() -> Result<Registry>,
{
    fn load(&self) -> Result<Registry> {
        self()
    }
}

fn identifier_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"))
        .as_ref()
        .map_err(|e| Error::metadata(None, format!("identifier pattern: {e}")))
}

fn check_identifier(entity: Option<&str>, what: &str, name: &str) -> Result<()> {
    if identifier_pattern()?.is_match(name) {
        Ok(())
    } else {
        Err(Error::metadata(
            entity,
            format!("invalid {what} name '{name}'"),
        ))
    }
}

/// Collects descriptors and validates them into an immutable [`Registry`].
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    entities: Vec<EntityDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.push(descriptor);
        self
    }

    /// Validate all descriptors and compute the flush ranking.
    ///
    /// Orphan removal on anything but an owned collection is dropped with a warning.
    pub fn build(self) -> Result<Registry> {
        let mut entities = self.entities;
        let mut by_name = HashMap::with_capacity(entities.len());

        for (ordinal, desc) in entities.iter_mut().enumerate() {
            desc.ordinal = ordinal;
            check_identifier(None, "entity", desc.name())?;
            if by_name.insert(desc.name().to_string(), ordinal).is_some() {
                return Err(Error::metadata(
                    Some(desc.name()),
                    "entity declared twice",
                ));
            }
        }

        for desc in &mut entities {
            validate_entity(desc)?;
        }

        for desc in &entities {
            for rel in desc.relationships() {
                let Some(&target_idx) = by_name.get(&rel.target) else {
                    return Err(Error::metadata(
                        Some(desc.name()),
                        format!(
                            "relationship '{}' targets unknown entity '{}'",
                            rel.name, rel.target
                        ),
                    ));
                };
                if let Some(mapped_by) = &rel.mapped_by {
                    let target = &entities[target_idx];
                    let back = target.find_relationship(mapped_by).ok_or_else(|| {
                        Error::metadata(
                            Some(desc.name()),
                            format!(
                                "relationship '{}' is mapped by unknown '{}.{}'",
                                rel.name, rel.target, mapped_by
                            ),
                        )
                    })?;
                    if back.is_collection() || !back.owning || back.target != desc.name() {
                        return Err(Error::metadata(
                            Some(desc.name()),
                            format!(
                                "'{}.{}' must be an owning single reference to {}",
                                rel.target,
                                mapped_by,
                                desc.name()
                            ),
                        ));
                    }
                }
            }
        }

        let ranks = rank_by_dependency(&entities, &by_name);
        for (desc, rank) in entities.iter_mut().zip(ranks) {
            desc.rank = rank;
        }

        tracing::debug!(entities = entities.len(), "Entity registry built");

        Ok(Registry {
            entities: entities.into_iter().map(Arc::new).collect(),
            by_name,
        })
    }
}

fn validate_entity(desc: &mut EntityDescriptor) -> Result<()> {
    let name = desc.name().to_string();
    let entity = Some(name.as_str());

    let mut seen = std::collections::HashSet::new();
    for attr in desc.attributes() {
        check_identifier(entity, "attribute", &attr.name)?;
        if !seen.insert(attr.name.as_str()) {
            return Err(Error::metadata(
                entity,
                format!("attribute '{}' declared twice", attr.name),
            ));
        }
    }
    for rel in desc.relationships() {
        check_identifier(entity, "relationship", &rel.name)?;
        if !seen.insert(rel.name.as_str()) {
            return Err(Error::metadata(
                entity,
                format!("'{}' declared twice", rel.name),
            ));
        }
    }

    if desc.attribute_index(desc.primary_key()).is_none() {
        return Err(Error::metadata(
            entity,
            format!("primary key '{}' is not an attribute", desc.primary_key()),
        ));
    }

    if let Some(version) = desc.version_attribute() {
        let Some(idx) = desc.attribute_index(version) else {
            return Err(Error::metadata(
                entity,
                format!("version attribute '{version}' is not an attribute"),
            ));
        };
        if !desc.attributes()[idx].ty.is_integer() {
            return Err(Error::metadata(
                entity,
                format!("version attribute '{version}' must be an integer"),
            ));
        }
    }

    if let Some(cache) = desc.cache() {
        check_identifier(entity, "cache region", &cache.region)?;
    }

    for rel in desc.relationships_mut() {
        if rel.orphan_removal && rel.kind != RelationshipKind::CollectionOwned {
            tracing::warn!(
                entity = %name,
                relationship = %rel.name,
                "orphan removal only applies to owned collections; ignoring"
            );
            rel.orphan_removal = false;
        }
    }

    Ok(())
}

/// Kahn's algorithm over entity types; ties and cycles resolve by declaration order.
fn rank_by_dependency(
    entities: &[EntityDescriptor],
    by_name: &HashMap<String, usize>,
) -> Vec<usize> {
    let n = entities.len();
    // depends[a] = set of types that must be written before a
    let mut depends: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (idx, desc) in entities.iter().enumerate() {
        for rel in desc.relationships() {
            let Some(&target) = by_name.get(&rel.target) else {
                continue;
            };
            if target == idx {
                continue;
            }
            if rel.depends_on_target() && !depends[idx].contains(&target) {
                depends[idx].push(target);
            }
            if rel.target_depends_on_self() && !depends[target].contains(&idx) {
                depends[target].push(idx);
            }
        }
    }

    let mut rank = vec![0usize; n];
    let mut placed = vec![false; n];
    for position in 0..n {
        let ready = (0..n).find(|&i| !placed[i] && depends[i].iter().all(|&d| placed[d]));
        let next = match ready {
            Some(i) => i,
            None => {
                // Cycle among the remaining types.
                let Some(i) = (0..n).find(|&i| !placed[i]) else {
                    break;
                };
                tracing::debug!(
                    entity = %entities[i].name(),
                    "foreign-key cycle between entity types; using declaration order"
                );
                i
            }
        };
        placed[next] = true;
        rank[next] = position;
    }
    rank
}

/// Immutable, validated set of entity descriptors.
#[derive(Debug, Clone)]
pub struct Registry {
    entities: Vec<Arc<EntityDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, entity: &str) -> Option<&Arc<EntityDescriptor>> {
        self.by_name.get(entity).map(|&i| &self.entities[i])
    }

    /// Look up a descriptor, failing with a metadata error for unknown types.
    pub fn require(&self, entity: &str) -> Result<&Arc<EntityDescriptor>> {
        self.get(entity)
            .ok_or_else(|| Error::metadata(Some(entity), "entity type is not registered"))
    }

    /// Descriptors in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
