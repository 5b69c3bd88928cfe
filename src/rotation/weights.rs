//! Budget-to-weight conversion.

/// Something that can be rotated into a sponsored slot.
pub trait Sponsored {
    fn id(&self) -> &str;

    /// Remaining budget; non-positive budgets are never shown.
    fn budget(&self) -> f64;

    fn is_active(&self) -> bool {
        true
    }
}

/// Logarithmic weight with a floor of 1, so large budgets do not drown out
/// small ones. `None` for budgets that must not be shown.
pub fn weight_for_budget(budget: f64) -> Option<f64> {
    if budget.is_nan() || budget <= 0.0 {
        return None;
    }
    Some(((budget + 1.0).ln() * 10.0).max(1.0))
}

/// An eligible item with its share of the draw.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedItem<T> {
    pub item: T,
    pub weight: f64,
    pub probability: f64,
}

/// Weight every active, funded item and normalise to probabilities.
///
/// The result is ordered by descending weight; ties keep input order.
pub fn compute_weights<T>(items: impl IntoIterator<Item = T>) -> Vec<WeightedItem<T>>
where
    T: Sponsored,
{
    let mut weighted: Vec<WeightedItem<T>> = items
        .into_iter()
        .filter(Sponsored::is_active)
        .filter_map(|item| {
            weight_for_budget(item.budget()).map(|weight| WeightedItem {
                item,
                weight,
                probability: 0.0,
            })
        })
        .collect();

    let total: f64 = weighted.iter().map(|entry| entry.weight).sum();
    if total > 0.0 {
        for entry in &mut weighted {
            entry.probability = entry.weight / total;
        }
    }

    weighted.sort_by(|left, right| right.weight.total_cmp(&left.weight));
    weighted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        budget: f64,
        active: bool,
    }

    impl Sponsored for Item {
        fn id(&self) -> &str {
            self.id
        }

        fn budget(&self) -> f64 {
            self.budget
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn item(id: &'static str, budget: f64) -> Item {
        Item {
            id,
            budget,
            active: true,
        }
    }

    #[test]
    fn weight_follows_log_formula() {
        let weight = weight_for_budget(50.0).expect("funded");
        assert!((weight - 39.318).abs() < 1e-3, "{weight}");
        assert_eq!(weight_for_budget(0.0), None);
        assert_eq!(weight_for_budget(-5.0), None);
        assert_eq!(weight_for_budget(f64::NAN), None);
    }

    #[test]
    fn tiny_budgets_hit_the_floor() {
        assert_eq!(weight_for_budget(0.01), Some(1.0));
    }

    #[test]
    fn weight_is_monotonic_in_budget() {
        let mut previous = 0.0;
        for budget in [0.5, 1.0, 5.0, 10.0, 100.0, 1_000.0, 1e6] {
            let weight = weight_for_budget(budget).expect("funded");
            assert!(weight >= previous);
            previous = weight;
        }
    }

    #[test]
    fn probabilities_sum_to_one() {
        let weighted = compute_weights(vec![item("a", 10.0), item("b", 50.0), item("c", 200.0)]);
        let sum: f64 = weighted.iter().map(|entry| entry.probability).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn budget_scenario_orders_by_weight() {
        let weighted = compute_weights(vec![item("a", 10.0), item("b", 50.0), item("c", 200.0)]);
        let ids: Vec<_> = weighted.iter().map(|entry| entry.item.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let expected = [(53.033, 0.456), (39.318, 0.338), (23.979, 0.206)];
        for (entry, (weight, probability)) in weighted.iter().zip(expected) {
            assert!((entry.weight - weight).abs() < 1e-2, "{}", entry.weight);
            assert!((entry.probability - probability).abs() < 1e-3, "{}", entry.probability);
        }
    }

    #[test]
    fn inactive_and_unfunded_items_are_excluded() {
        let mut paused = item("paused", 100.0);
        paused.active = false;
        let weighted = compute_weights(vec![paused, item("empty", 0.0), item("live", 3.0)]);
        assert_eq!(weighted.len(), 1);
        assert_eq!(weighted[0].item.id, "live");
        assert_eq!(weighted[0].probability, 1.0);
    }

    #[test]
    fn ties_keep_input_order() {
        let weighted = compute_weights(vec![item("first", 20.0), item("second", 20.0)]);
        assert_eq!(weighted[0].item.id, "first");
    }
}
