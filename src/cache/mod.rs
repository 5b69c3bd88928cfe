//! Client-side query cache.
//!
//! - **Keys**: hierarchical `[entity, operation, params]` paths
//! - **Strategies**: freshness tiers resolved per entity, operation and context
//! - **Executor**: de-duplicated loads, stale-while-revalidate, retries, GC
//! - **Mutations**: optimistic writes with snapshot rollback
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! max_entries = 1000
//! retry_delay_ms = 1000
//! gc_sweep_interval_ms = 60000
//!
//! [[cache.overrides]]
//! entity = "services"
//! operation = "detail"
//! tier = "static"
//! ```

mod client;
mod config;
mod entities;
mod error;
mod executor;
mod keys;
pub(crate) mod lock;
mod mutation;
mod observer;
mod store;
mod strategy;

pub use client::{ListPage, ListParams, QueryClient};
pub use config::CacheConfig;
pub use entities::{CatalogError, EntityConfig, EntityRegistry};
pub use error::QueryError;
pub use executor::{Loader, QueryExecutor, loader};
pub use keys::{Entity, Operation, QueryFilter, QueryKey, QueryParams, hash_value};
pub use mutation::{
    MutationContext, MutationCoordinator, MutationOutcome, MutationRequest, MutationState,
    OptimisticUpdate, ToggleTarget, Updater,
};
pub use observer::Subscription;
pub use store::{QuerySnapshot, QueryStatus};
pub use strategy::{
    CacheStrategy, CacheTier, StrategyError, StrategyResolver, StrategyResolverBuilder,
    StrategySource,
};
