//! Application services built on the query cache.

pub mod catalog;
pub mod datastore;
pub mod error;
pub mod promotions;
