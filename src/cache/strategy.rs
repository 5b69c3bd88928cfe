//! Cache strategy tiers and per-entity resolution.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::keys::{Entity, Operation};

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// Freshness and refetch policy for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStrategy {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub refetch_on_mount: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub retry_count: u32,
}

impl CacheStrategy {
    pub const HIGH: Self = Self {
        stale_time: Duration::from_secs(30 * SECOND),
        gc_time: Duration::from_secs(2 * MINUTE),
        refetch_on_mount: true,
        refetch_on_focus: true,
        refetch_on_reconnect: true,
        retry_count: 3,
    };

    pub const MEDIUM: Self = Self {
        stale_time: Duration::from_secs(2 * MINUTE),
        gc_time: Duration::from_secs(10 * MINUTE),
        refetch_on_mount: true,
        refetch_on_focus: false,
        refetch_on_reconnect: true,
        retry_count: 3,
    };

    pub const LOW: Self = Self {
        stale_time: Duration::from_secs(5 * MINUTE),
        gc_time: Duration::from_secs(30 * MINUTE),
        refetch_on_mount: false,
        refetch_on_focus: false,
        refetch_on_reconnect: true,
        retry_count: 2,
    };

    pub const STATIC: Self = Self {
        stale_time: Duration::from_secs(HOUR),
        gc_time: Duration::from_secs(24 * HOUR),
        refetch_on_mount: false,
        refetch_on_focus: false,
        refetch_on_reconnect: false,
        retry_count: 1,
    };

    /// Always stale; kept around briefly for instant remounts.
    pub const REALTIME: Self = Self {
        stale_time: Duration::ZERO,
        gc_time: Duration::from_secs(5 * MINUTE),
        refetch_on_mount: true,
        refetch_on_focus: true,
        refetch_on_reconnect: true,
        retry_count: 3,
    };

    /// Copy of `self` with different freshness windows.
    pub const fn with_times(self, stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            stale_time,
            gc_time,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.stale_time < self.gc_time {
            Ok(())
        } else {
            Err(StrategyError::StaleNotBeforeGc {
                stale_time: self.stale_time,
                gc_time: self.gc_time,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("stale_time {stale_time:?} must be shorter than gc_time {gc_time:?}")]
    StaleNotBeforeGc {
        stale_time: Duration,
        gc_time: Duration,
    },
    #[error("unknown cache tier `{0}`")]
    UnknownTier(String),
}

/// Named strategy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    High,
    Medium,
    Low,
    Static,
}

impl CacheTier {
    pub const ALL: [CacheTier; 4] = [Self::High, Self::Medium, Self::Low, Self::Static];

    pub const fn strategy(self) -> CacheStrategy {
        match self {
            Self::High => CacheStrategy::HIGH,
            Self::Medium => CacheStrategy::MEDIUM,
            Self::Low => CacheStrategy::LOW,
            Self::Static => CacheStrategy::STATIC,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Static => "static",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheTier {
    type Err = StrategyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "static" => Ok(Self::Static),
            other => Err(StrategyError::UnknownTier(other.to_string())),
        }
    }
}

/// Which layer of the resolver produced a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategySource {
    Context,
    Entity,
    Operation,
    Fallback,
}

impl fmt::Display for StrategySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Context => "context override",
            Self::Entity => "entity override",
            Self::Operation => "operation default",
            Self::Fallback => "fallback",
        })
    }
}

type EntityOp = (Entity, Operation);

/// Picks a [`CacheStrategy`] for an entity, operation and optional context.
///
/// Resolution is pure: the same inputs always yield the same strategy.
#[derive(Debug, Clone)]
pub struct StrategyResolver {
    contexts: HashMap<(Entity, Operation, String), CacheStrategy>,
    entities: HashMap<EntityOp, CacheStrategy>,
    operations: HashMap<Operation, CacheStrategy>,
    fallback: CacheStrategy,
}

impl StrategyResolver {
    pub fn builder() -> StrategyResolverBuilder {
        StrategyResolverBuilder::default()
    }

    pub fn resolve(
        &self,
        entity: &Entity,
        operation: &Operation,
        context: Option<&str>,
    ) -> CacheStrategy {
        self.resolve_with_source(entity, operation, context).0
    }

    pub fn resolve_with_source(
        &self,
        entity: &Entity,
        operation: &Operation,
        context: Option<&str>,
    ) -> (CacheStrategy, StrategySource) {
        if let Some(context) = context
            && let Some(strategy) =
                self.contexts
                    .get(&(entity.clone(), operation.clone(), context.to_string()))
        {
            return (*strategy, StrategySource::Context);
        }

        if let Some(strategy) = self.entities.get(&(entity.clone(), operation.clone())) {
            return (*strategy, StrategySource::Entity);
        }

        if let Some(strategy) = self.operations.get(operation) {
            return (*strategy, StrategySource::Operation);
        }

        (self.fallback, StrategySource::Fallback)
    }
}

impl Default for StrategyResolver {
    fn default() -> Self {
        Self {
            contexts: HashMap::new(),
            entities: HashMap::new(),
            operations: default_operations(),
            fallback: CacheStrategy::MEDIUM,
        }
    }
}

fn default_operations() -> HashMap<Operation, CacheStrategy> {
    HashMap::from([
        (Operation::List, CacheStrategy::MEDIUM),
        (Operation::Detail, CacheStrategy::LOW),
        (Operation::User, CacheStrategy::HIGH),
        (Operation::Search, CacheStrategy::HIGH),
        (Operation::Stats, CacheStrategy::LOW),
        (Operation::Realtime, CacheStrategy::REALTIME),
    ])
}

#[derive(Debug, Default)]
pub struct StrategyResolverBuilder {
    contexts: Vec<((Entity, Operation, String), CacheStrategy)>,
    entities: Vec<(EntityOp, CacheStrategy)>,
    operations: Vec<(Operation, CacheStrategy)>,
}

impl StrategyResolverBuilder {
    pub fn operation_default(mut self, operation: Operation, strategy: CacheStrategy) -> Self {
        self.operations.push((operation, strategy));
        self
    }

    pub fn entity_override(
        mut self,
        entity: impl Into<Entity>,
        operation: Operation,
        strategy: CacheStrategy,
    ) -> Self {
        self.entities.push(((entity.into(), operation), strategy));
        self
    }

    pub fn context_override(
        mut self,
        entity: impl Into<Entity>,
        operation: Operation,
        context: impl Into<String>,
        strategy: CacheStrategy,
    ) -> Self {
        self.contexts
            .push(((entity.into(), operation, context.into()), strategy));
        self
    }

    /// Validates every strategy; later registrations win over earlier ones.
    pub fn build(self) -> Result<StrategyResolver, StrategyError> {
        let mut resolver = StrategyResolver::default();

        for (operation, strategy) in self.operations {
            strategy.validate()?;
            resolver.operations.insert(operation, strategy);
        }
        for (key, strategy) in self.entities {
            strategy.validate()?;
            resolver.entities.insert(key, strategy);
        }
        for (key, strategy) in self.contexts {
            strategy.validate()?;
            resolver.contexts.insert(key, strategy);
        }

        Ok(resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> Entity {
        Entity::new("services")
    }

    #[test]
    fn every_tier_keeps_stale_before_gc() {
        for tier in CacheTier::ALL {
            assert!(tier.strategy().validate().is_ok(), "{tier} is invalid");
        }
        assert!(CacheStrategy::REALTIME.validate().is_ok());
    }

    #[test]
    fn operation_defaults_apply_without_overrides() {
        let resolver = StrategyResolver::default();
        assert_eq!(
            resolver.resolve(&services(), &Operation::List, None),
            CacheStrategy::MEDIUM
        );
        assert_eq!(
            resolver.resolve(&services(), &Operation::Detail, None),
            CacheStrategy::LOW
        );
        assert_eq!(
            resolver.resolve(&services(), &Operation::User, None),
            CacheStrategy::HIGH
        );
        assert_eq!(
            resolver.resolve(&services(), &Operation::Realtime, None).stale_time,
            Duration::ZERO
        );
    }

    #[test]
    fn unknown_operation_falls_back_to_medium() {
        let resolver = StrategyResolver::default();
        let (strategy, source) = resolver.resolve_with_source(
            &Entity::new("unknown"),
            &Operation::Custom("members".into()),
            None,
        );
        assert_eq!(strategy, CacheStrategy::MEDIUM);
        assert_eq!(source, StrategySource::Fallback);
    }

    #[test]
    fn context_beats_entity_beats_operation() {
        let homepage = CacheStrategy::MEDIUM
            .with_times(Duration::from_secs(60), Duration::from_secs(600));
        let resolver = StrategyResolver::builder()
            .entity_override("services", Operation::List, CacheStrategy::STATIC)
            .context_override("services", Operation::List, "homepage", homepage)
            .build()
            .expect("valid overrides");

        let (strategy, source) =
            resolver.resolve_with_source(&services(), &Operation::List, Some("homepage"));
        assert_eq!(strategy.stale_time, Duration::from_secs(60));
        assert_eq!(source, StrategySource::Context);

        let (strategy, source) =
            resolver.resolve_with_source(&services(), &Operation::List, Some("search_page"));
        assert_eq!(strategy, CacheStrategy::STATIC);
        assert_eq!(source, StrategySource::Entity);

        let (_, source) =
            resolver.resolve_with_source(&Entity::new("reviews"), &Operation::List, None);
        assert_eq!(source, StrategySource::Operation);
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = StrategyResolver::default();
        let first = resolver.resolve(&services(), &Operation::Search, Some("x"));
        for _ in 0..10 {
            assert_eq!(resolver.resolve(&services(), &Operation::Search, Some("x")), first);
        }
    }

    #[test]
    fn invalid_override_is_rejected() {
        let broken = CacheStrategy::HIGH.with_times(Duration::from_secs(60), Duration::from_secs(60));
        let error = StrategyResolver::builder()
            .entity_override("services", Operation::Detail, broken)
            .build()
            .expect_err("stale == gc must fail");
        assert!(matches!(error, StrategyError::StaleNotBeforeGc { .. }));
    }

    #[test]
    fn tiers_parse_case_insensitively() {
        assert_eq!("Static".parse::<CacheTier>(), Ok(CacheTier::Static));
        assert!("urgent".parse::<CacheTier>().is_err());
    }
}
