//! Choosing which individuals to mutate and with which operators.

use crate::harness::TestingSummary;
use crate::operators::{BugCategory, OperatorDescriptor, OperatorRegistry};
use crate::population::{IndividualKey, Population};
use rand::seq::SliceRandom;
use rand::Rng;

/// Individuals to mutate when building `generation`, best first.
///
/// Individuals of generations `1..generation` scoring strictly above the
/// original program are preferred. When there are none, the original program
/// itself and every individual scoring at least as well are used. Ties keep
/// discovery order (generation, then id).
pub fn mutation_candidates(population: &Population, generation: usize) -> Vec<IndividualKey> {
    let Some(original) = population.original() else {
        return Vec::new();
    };
    let baseline = original.score();

    let earlier = population
        .generations()
        .iter()
        .take(generation)
        .skip(1);

    let mut candidates: Vec<(IndividualKey, f64)> = earlier
        .clone()
        .flat_map(|g| g.better_than(baseline))
        .map(|i| (i.key, i.score()))
        .collect();

    if candidates.is_empty() {
        candidates.push((original.key, baseline));
        candidates.extend(
            earlier
                .flat_map(|g| g.at_least(baseline))
                .map(|i| (i.key, i.score())),
        );
    }

    // Stable, so equal scores stay in discovery order
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    candidates.into_iter().map(|(key, _)| key).collect()
}

/// Pick the bug category to target for an individual.
///
/// Data races are chosen with probability equal to the individual's share
/// of data-race runs among data-race and deadlock runs.
pub fn choose_category<R: Rng + ?Sized>(summary: Option<&TestingSummary>, rng: &mut R) -> BugCategory {
    let p = summary.map_or(0.5, TestingSummary::data_race_ratio);
    if rng.random::<f64>() <= p {
        BugCategory::DataRace
    } else {
        BugCategory::Deadlock
    }
}

/// Operators to try for `category`, in random order. Every enabled operator
/// is used when none is tagged with the category.
pub fn operators_to_try<R: Rng + ?Sized>(
    registry: &OperatorRegistry,
    category: BugCategory,
    rng: &mut R,
) -> Vec<&'static OperatorDescriptor> {
    let mut operators = registry.for_category(category);
    if operators.is_empty() {
        operators = registry.all().to_vec();
    }
    operators.shuffle(rng);
    operators
}
