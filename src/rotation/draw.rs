//! Weighted random selection.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::weights::WeightedItem;

/// Uniform numbers in `[0, 1)`.
pub trait RandomSource: Send {
    fn next_unit(&mut self) -> f64;
}

/// Adapter over any `rand` generator.
#[derive(Debug, Clone)]
pub struct RngSource<R> {
    rng: R,
}

impl<R: Rng> RngSource<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RngSource<StdRng> {
    /// Reproducible sequence.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_os_rng() -> Self {
        Self::new(StdRng::from_os_rng())
    }
}

impl<R: Rng + Send> RandomSource for RngSource<R> {
    fn next_unit(&mut self) -> f64 {
        self.rng.random::<f64>()
    }
}

/// Always yields the same number.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_unit(&mut self) -> f64 {
        self.0
    }
}

/// Walk cumulative probabilities and return the first item whose cumulative
/// share reaches the drawn number.
///
/// Rounding can leave the total just under 1; the first item is the fallback.
pub fn draw<'a, T>(items: &'a [WeightedItem<T>], rng: &mut dyn RandomSource) -> Option<&'a T> {
    let first = items.first()?;
    let target = rng.next_unit();

    let mut cumulative = 0.0;
    for entry in items {
        cumulative += entry.probability;
        if cumulative >= target {
            return Some(&entry.item);
        }
    }
    Some(&first.item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(probabilities: &[f64]) -> Vec<WeightedItem<usize>> {
        probabilities
            .iter()
            .enumerate()
            .map(|(item, probability)| WeightedItem {
                item,
                weight: probability * 100.0,
                probability: *probability,
            })
            .collect()
    }

    #[test]
    fn empty_input_draws_nothing() {
        let items: Vec<WeightedItem<usize>> = Vec::new();
        assert_eq!(draw(&items, &mut FixedRandom(0.3)), None);
    }

    #[test]
    fn cumulative_walk_picks_matching_bucket() {
        let items = weighted(&[0.456, 0.338, 0.206]);
        assert_eq!(draw(&items, &mut FixedRandom(0.0)), Some(&0));
        assert_eq!(draw(&items, &mut FixedRandom(0.456)), Some(&0));
        assert_eq!(draw(&items, &mut FixedRandom(0.5)), Some(&1));
        assert_eq!(draw(&items, &mut FixedRandom(0.9)), Some(&2));
    }

    #[test]
    fn rounding_shortfall_falls_back_to_first() {
        let items = weighted(&[0.5, 0.49]);
        assert_eq!(draw(&items, &mut FixedRandom(0.999)), Some(&0));
    }

    #[test]
    fn seeded_sources_repeat() {
        let mut left = RngSource::seeded(7);
        let mut right = RngSource::seeded(7);
        for _ in 0..5 {
            let value = left.next_unit();
            assert!((0.0..1.0).contains(&value));
            assert_eq!(value, right.next_unit());
        }
    }

    #[test]
    fn draws_roughly_follow_probabilities() {
        let items = weighted(&[0.75, 0.25]);
        let mut rng = RngSource::seeded(42);
        let hits = (0..4000)
            .filter(|_| draw(&items, &mut rng) == Some(&0))
            .count();
        assert!((2800..3200).contains(&hits), "{hits}");
    }
}
