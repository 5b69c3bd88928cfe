//! Marketplace domain: entity catalogue and sponsored promotions.

pub mod error;
pub mod marketplace;
pub mod promotions;
