//! Entity catalogue.
//!
//! Describes every data kind the cache knows about: where its rows live, how
//! they are identified and which other entities must be invalidated when one
//! of them changes.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::keys::{Entity, QueryFilter, QueryKey};
use crate::application::datastore::Sort;

/// Static description of one data kind.
#[derive(Debug, Clone)]
pub struct EntityConfig {
    pub name: Entity,
    /// Physical table in the remote store.
    pub source: String,
    pub id_column: String,
    /// Column holding the owning user, for per-user queries.
    pub owner_column: Option<String>,
    pub default_sort: Option<Sort>,
    pub searchable: Vec<String>,
    /// Entities whose cached rows embed or count this entity.
    pub invalidates: Vec<Entity>,
}

impl EntityConfig {
    /// Entity stored in a table of the same name, keyed by `id`.
    pub fn new(name: &str) -> Self {
        Self {
            name: Entity::new(name),
            source: name.to_string(),
            id_column: "id".to_string(),
            owner_column: None,
            default_sort: None,
            searchable: Vec::new(),
            invalidates: Vec::new(),
        }
    }

    pub fn source(mut self, table: &str) -> Self {
        self.source = table.to_string();
        self
    }

    pub fn id_column(mut self, column: &str) -> Self {
        self.id_column = column.to_string();
        self
    }

    pub fn owner_column(mut self, column: &str) -> Self {
        self.owner_column = Some(column.to_string());
        self
    }

    pub fn default_sort(mut self, sort: Sort) -> Self {
        self.default_sort = Some(sort);
        self
    }

    pub fn searchable(mut self, columns: &[&str]) -> Self {
        self.searchable = columns.iter().map(|column| column.to_string()).collect();
        self
    }

    pub fn invalidates(mut self, entities: &[&str]) -> Self {
        self.invalidates = entities.iter().map(|name| Entity::new(name)).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("entity `{0}` is registered twice")]
    Duplicate(String),
    #[error("entity `{from}` invalidates unknown entity `{to}`")]
    UnknownRelationship { from: String, to: String },
    #[error("entity `{0}` is not registered")]
    UnknownEntity(String),
}

/// Immutable set of [`EntityConfig`]s.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: HashMap<Entity, EntityConfig>,
}

impl EntityRegistry {
    /// Build a registry, rejecting duplicates and dangling relationships.
    pub fn build(configs: impl IntoIterator<Item = EntityConfig>) -> Result<Self, CatalogError> {
        let mut entities = HashMap::new();
        for config in configs {
            if entities.contains_key(&config.name) {
                return Err(CatalogError::Duplicate(config.name.to_string()));
            }
            entities.insert(config.name.clone(), config);
        }

        for config in entities.values() {
            if let Some(target) = config
                .invalidates
                .iter()
                .find(|target| !entities.contains_key(*target))
            {
                return Err(CatalogError::UnknownRelationship {
                    from: config.name.to_string(),
                    to: target.to_string(),
                });
            }
        }

        Ok(Self { entities })
    }

    pub fn get(&self, entity: &Entity) -> Result<&EntityConfig, CatalogError> {
        self.entities
            .get(entity)
            .ok_or_else(|| CatalogError::UnknownEntity(entity.to_string()))
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.entities.contains_key(entity)
    }

    pub fn names(&self) -> impl Iterator<Item = &Entity> {
        self.entities.keys()
    }

    /// Families to invalidate after `entity` changes: the entity itself plus
    /// every entity reachable through `invalidates`.
    pub fn invalidation_targets(&self, entity: &Entity) -> Vec<QueryFilter> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([entity.clone()]);
        let mut targets = Vec::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            targets.push(QueryFilter::prefix(QueryKey::all(&current)));
            if let Some(config) = self.entities.get(&current) {
                queue.extend(config.invalidates.iter().cloned());
            }
        }

        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntityRegistry {
        EntityRegistry::build([
            EntityConfig::new("services").invalidates(&["stats"]),
            EntityConfig::new("reviews").invalidates(&["services"]),
            EntityConfig::new("stats"),
        ])
        .expect("valid catalogue")
    }

    #[test]
    fn invalidation_follows_relationships_transitively() {
        let targets = sample().invalidation_targets(&Entity::new("reviews"));
        let keys: Vec<_> = targets.iter().map(|filter| filter.key().entity().to_string()).collect();
        assert_eq!(keys, vec!["reviews", "services", "stats"]);
    }

    #[test]
    fn cycles_terminate() {
        let registry = EntityRegistry::build([
            EntityConfig::new("a").invalidates(&["b"]),
            EntityConfig::new("b").invalidates(&["a"]),
        ])
        .expect("cycle is allowed");
        assert_eq!(registry.invalidation_targets(&Entity::new("a")).len(), 2);
    }

    #[test]
    fn unknown_relationship_is_rejected() {
        let error = EntityRegistry::build([EntityConfig::new("services").invalidates(&["ghost"])])
            .expect_err("dangling relationship");
        assert_eq!(
            error,
            CatalogError::UnknownRelationship {
                from: "services".into(),
                to: "ghost".into()
            }
        );
    }

    #[test]
    fn duplicates_are_rejected() {
        let error = EntityRegistry::build([EntityConfig::new("services"), EntityConfig::new("services")])
            .expect_err("duplicate");
        assert_eq!(error, CatalogError::Duplicate("services".into()));
    }

    #[test]
    fn lookup_of_unknown_entity_fails() {
        assert!(sample().get(&Entity::new("ghost")).is_err());
        assert_eq!(sample().get(&Entity::new("services")).map(|c| c.id_column.as_str()), Ok("id"));
    }
}
