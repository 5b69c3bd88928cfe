//! Marketplace entity catalogue and cache strategy defaults.

use std::time::Duration;

use crate::application::datastore::Sort;
use crate::cache::{
    CacheStrategy, CatalogError, EntityConfig, EntityRegistry, Operation, StrategyError,
    StrategyResolver, StrategyResolverBuilder,
};

pub const SERVICES: &str = "services";
pub const PROMOTIONS: &str = "promotions";
pub const CATEGORIES: &str = "categories";
pub const REVIEWS: &str = "reviews";
pub const FAVORITES: &str = "favorites";
pub const PROFILES: &str = "profiles";
pub const BOOKINGS: &str = "bookings";
pub const STATS: &str = "stats";

/// Rendering context of the landing page.
pub const HOMEPAGE: &str = "homepage";

pub fn entity_configs() -> Vec<EntityConfig> {
    vec![
        EntityConfig::new(SERVICES)
            .owner_column("provider_id")
            .default_sort(Sort::descending("created_at"))
            .searchable(&["title", "description"])
            .invalidates(&[CATEGORIES, STATS]),
        EntityConfig::new(PROMOTIONS)
            .owner_column("provider_id")
            .default_sort(Sort::descending("budget"))
            .invalidates(&[STATS]),
        EntityConfig::new(CATEGORIES).default_sort(Sort::ascending("name")),
        EntityConfig::new(REVIEWS)
            .owner_column("author_id")
            .default_sort(Sort::descending("created_at"))
            .invalidates(&[SERVICES]),
        EntityConfig::new(FAVORITES)
            .owner_column("user_id")
            .default_sort(Sort::descending("created_at"))
            .invalidates(&[STATS]),
        EntityConfig::new(PROFILES)
            .searchable(&["display_name"])
            .invalidates(&[SERVICES]),
        EntityConfig::new(BOOKINGS)
            .owner_column("customer_id")
            .default_sort(Sort::descending("scheduled_for"))
            .invalidates(&[STATS]),
        EntityConfig::new(STATS).source("marketplace_stats"),
    ]
}

pub fn entity_registry() -> Result<EntityRegistry, CatalogError> {
    EntityRegistry::build(entity_configs())
}

/// Overrides on top of the per-operation defaults. Further overrides can be
/// chained onto the returned builder.
pub fn strategy_builder() -> StrategyResolverBuilder {
    StrategyResolver::builder()
        .context_override(
            SERVICES,
            Operation::List,
            HOMEPAGE,
            CacheStrategy::MEDIUM.with_times(Duration::from_secs(60), Duration::from_secs(600)),
        )
        .context_override(
            PROMOTIONS,
            Operation::List,
            HOMEPAGE,
            CacheStrategy::HIGH,
        )
        .entity_override(CATEGORIES, Operation::List, CacheStrategy::STATIC)
        .entity_override(BOOKINGS, Operation::User, CacheStrategy::REALTIME)
}

pub fn strategy_resolver() -> Result<StrategyResolver, StrategyError> {
    strategy_builder().build()
}
