//! Budget-weighted rotation of sponsored items.
//!
//! Each candidate gets a weight of `max(1, ln(budget + 1) * 10)`; a draw
//! walks the cumulative probabilities with an injected random source.

mod draw;
mod rotator;
mod weights;

pub use draw::{FixedRandom, RandomSource, RngSource, draw};
pub use rotator::{CandidateSource, RotationHandle, RotationPolicy, Rotator, SelectCallback};
pub use weights::{Sponsored, WeightedItem, compute_weights, weight_for_budget};
