//! Multi-objective candidate selection.
//!
//! Dominance and crowding distance run over objective space: the primary
//! metric plus every secondary score dimension present in the batch.
//! Crowding distances collapse by score value, so two candidates with
//! identical scores share one entry.

use rand::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use evolv_shared::Program;

use super::types::{FitnessScore, PRIMARY_DIMENSION};

/// A population member paired with its evaluated fitness.
pub type ScoredProgram = (Arc<dyn Program>, FitnessScore);

/// All objective dimensions present in a batch of scores: the primary
/// metric followed by the union of secondary keys, in stable order.
#[must_use]
pub fn objective_dimensions(scores: &[FitnessScore]) -> Vec<String> {
    let mut dims = vec![PRIMARY_DIMENSION.to_string()];
    let secondary: BTreeSet<&String> = scores
        .iter()
        .flat_map(|s| s.secondary_scores().keys())
        .collect();
    dims.extend(secondary.into_iter().cloned());
    dims
}

/// True when `winner` dominates `loser`: at least as good on every
/// dimension and strictly better on at least one.
#[must_use]
pub fn dominates(winner: &FitnessScore, loser: &FitnessScore, dimensions: &[String]) -> bool {
    let mut strictly_better = false;
    for dim in dimensions {
        let w = winner.objective_value(dim);
        let l = loser.objective_value(dim);
        if w < l {
            return false;
        }
        if w > l {
            strictly_better = true;
        }
    }
    strictly_better
}

fn frontier_indices(scores: &[FitnessScore], dimensions: &[String]) -> Vec<usize> {
    (0..scores.len())
        .filter(|&i| {
            !scores
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && dominates(other, &scores[i], dimensions))
        })
        .collect()
}

/// The subset of `scores` not dominated by any other member. Empty and
/// singleton inputs return themselves unchanged; the member with the
/// highest `overall_score` is always present.
#[must_use]
pub fn find_pareto_frontier(scores: &[FitnessScore]) -> Vec<FitnessScore> {
    if scores.len() <= 1 {
        return scores.to_vec();
    }
    let dimensions = objective_dimensions(scores);
    let mut frontier: Vec<FitnessScore> = frontier_indices(scores, &dimensions)
        .into_iter()
        .map(|i| scores[i].clone())
        .collect();

    // Domination implies overall <= the dominator's overall, so the global
    // max can only be excluded when tied by value; reinstate it if so.
    if let Some(best) = scores.iter().max_by(|a, b| {
        a.overall_score()
            .partial_cmp(&b.overall_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        if !frontier.contains(best) {
            frontier.push(best.clone());
        }
    }
    frontier
}

/// NSGA-II crowding distance, keyed by score value.
///
/// Per dimension, the minimum and maximum elements receive an unbounded
/// distance; interior elements accumulate range-normalized gaps to their
/// neighbors across all dimensions.
#[must_use]
pub fn calculate_crowding_distance(scores: &[FitnessScore]) -> HashMap<FitnessScore, f64> {
    let mut distances: HashMap<FitnessScore, f64> = HashMap::new();
    if scores.is_empty() {
        return distances;
    }

    // Collapse by value first so equal scores share one entry.
    let mut unique: Vec<FitnessScore> = Vec::new();
    for score in scores {
        if !unique.contains(score) {
            unique.push(score.clone());
        }
    }
    for score in &unique {
        distances.insert(score.clone(), 0.0);
    }
    if unique.len() <= 2 {
        for score in &unique {
            distances.insert(score.clone(), f64::INFINITY);
        }
        return distances;
    }

    let dimensions = objective_dimensions(&unique);
    for dim in &dimensions {
        let mut order: Vec<usize> = (0..unique.len()).collect();
        order.sort_by(|&a, &b| {
            unique[a]
                .objective_value(dim)
                .partial_cmp(&unique[b].objective_value(dim))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let min_val = unique[order[0]].objective_value(dim);
        let max_val = unique[*order.last().expect("non-empty")].objective_value(dim);
        let range = max_val - min_val;
        if range <= f64::EPSILON {
            continue;
        }

        *distances.get_mut(&unique[order[0]]).expect("seeded") = f64::INFINITY;
        *distances
            .get_mut(&unique[*order.last().expect("non-empty")])
            .expect("seeded") = f64::INFINITY;

        for window in order.windows(3) {
            let (prev, curr, next) = (window[0], window[1], window[2]);
            let gap = (unique[next].objective_value(dim) - unique[prev].objective_value(dim))
                / range;
            let entry = distances.get_mut(&unique[curr]).expect("seeded");
            *entry += gap;
        }
    }
    distances
}

/// Pareto-based parent and survivor selection with tournament, elite, and
/// diversity fallbacks.
pub struct ParetoSelector {
    tournament_size: usize,
    rng: StdRng,
}

impl ParetoSelector {
    #[must_use]
    pub fn new(tournament_size: usize) -> Self {
        Self {
            tournament_size: tournament_size.max(1),
            rng: StdRng::from_entropy(),
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Select `count` parents: Pareto-frontier members first (higher
    /// crowding distance preferred, for diversity), topped up by tournament
    /// winners when the frontier runs short. `count` is clamped to the
    /// population size.
    pub fn select_parents(
        &mut self,
        population: &[ScoredProgram],
        count: usize,
    ) -> Vec<Arc<dyn Program>> {
        if population.is_empty() {
            return Vec::new();
        }
        let count = count.min(population.len());
        let scores: Vec<FitnessScore> = population.iter().map(|(_, s)| s.clone()).collect();
        let dimensions = objective_dimensions(&scores);
        let crowding = calculate_crowding_distance(&scores);

        let mut frontier = frontier_indices(&scores, &dimensions);
        frontier.sort_by(|&a, &b| {
            let da = crowding.get(&scores[a]).copied().unwrap_or(0.0);
            let db = crowding.get(&scores[b]).copied().unwrap_or(0.0);
            db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut parents: Vec<Arc<dyn Program>> = frontier
            .iter()
            .take(count)
            .map(|&i| population[i].0.clone())
            .collect();

        while parents.len() < count {
            if let Some((program, _)) = self.tournament_selection(population) {
                parents.push(program);
            } else {
                break;
            }
        }
        parents
    }

    /// Assemble `count` distinct survivors by combining the elite (top
    /// overall score) with the most diverse (top crowding distance).
    pub fn select_survivors(
        &mut self,
        population: &[ScoredProgram],
        count: usize,
    ) -> Vec<ScoredProgram> {
        if population.is_empty() {
            return Vec::new();
        }
        let count = count.min(population.len());
        let elite_share = count.div_ceil(2);

        let scores: Vec<FitnessScore> = population.iter().map(|(_, s)| s.clone()).collect();
        let crowding = calculate_crowding_distance(&scores);

        let mut chosen: Vec<usize> = Vec::with_capacity(count);

        let mut by_overall: Vec<usize> = (0..population.len()).collect();
        by_overall.sort_by(|&a, &b| {
            scores[b]
                .overall_score()
                .partial_cmp(&scores[a].overall_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chosen.extend(by_overall.iter().copied().take(elite_share));

        let mut by_crowding: Vec<usize> = (0..population.len()).collect();
        by_crowding.sort_by(|&a, &b| {
            let da = crowding.get(&scores[a]).copied().unwrap_or(0.0);
            let db = crowding.get(&scores[b]).copied().unwrap_or(0.0);
            db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
        });
        for idx in by_crowding {
            if chosen.len() >= count {
                break;
            }
            if !chosen.contains(&idx) {
                chosen.push(idx);
            }
        }
        // Top up from the overall ranking if crowding ties left gaps.
        for idx in by_overall {
            if chosen.len() >= count {
                break;
            }
            if !chosen.contains(&idx) {
                chosen.push(idx);
            }
        }

        chosen.into_iter().map(|i| population[i].clone()).collect()
    }

    /// Sample a small subset and return the winner by overall score, with
    /// frontier membership breaking ties. A singleton population returns
    /// its only member; empty returns None.
    pub fn tournament_selection(&mut self, population: &[ScoredProgram]) -> Option<ScoredProgram> {
        match population.len() {
            0 => return None,
            1 => return Some(population[0].clone()),
            _ => {}
        }

        let scores: Vec<FitnessScore> = population.iter().map(|(_, s)| s.clone()).collect();
        let dimensions = objective_dimensions(&scores);
        let frontier = frontier_indices(&scores, &dimensions);

        let sample_size = self.tournament_size.min(population.len());
        let mut best: Option<usize> = None;
        for _ in 0..sample_size {
            let idx = self.rng.gen_range(0..population.len());
            best = Some(match best {
                None => idx,
                Some(current) => {
                    let a = scores[idx].overall_score();
                    let b = scores[current].overall_score();
                    if a > b {
                        idx
                    } else if a < b {
                        current
                    } else if frontier.contains(&idx) && !frontier.contains(&current) {
                        idx
                    } else {
                        current
                    }
                }
            });
        }
        best.map(|i| population[i].clone())
    }

    /// Top `count` members by descending overall score (clamped, stable).
    #[must_use]
    pub fn elite_selection(
        &self,
        population: &[ScoredProgram],
        count: usize,
    ) -> Vec<ScoredProgram> {
        let mut order: Vec<usize> = (0..population.len()).collect();
        order.sort_by(|&a, &b| {
            population[b]
                .1
                .overall_score()
                .partial_cmp(&population[a].1.overall_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order
            .into_iter()
            .take(count.min(population.len()))
            .map(|i| population[i].clone())
            .collect()
    }

    /// Top `count` members by descending crowding distance (clamped,
    /// stable, no duplication).
    #[must_use]
    pub fn diversity_selection(
        &self,
        population: &[ScoredProgram],
        count: usize,
    ) -> Vec<ScoredProgram> {
        let scores: Vec<FitnessScore> = population.iter().map(|(_, s)| s.clone()).collect();
        let crowding = calculate_crowding_distance(&scores);
        let mut order: Vec<usize> = (0..population.len()).collect();
        order.sort_by(|&a, &b| {
            let da = crowding.get(&scores[a]).copied().unwrap_or(0.0);
            let db = crowding.get(&scores[b]).copied().unwrap_or(0.0);
            db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
        });
        order
            .into_iter()
            .take(count.min(population.len()))
            .map(|i| population[i].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::types::ScoreWeights;
    use crate::test_utils::MockProgram;
    use std::collections::BTreeMap;

    fn score(primary: f64, entries: &[(&str, f64)]) -> FitnessScore {
        let secondary: BTreeMap<String, f64> = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect();
        FitnessScore::new(primary, secondary, &ScoreWeights::default()).unwrap()
    }

    fn scored(primary: f64, entries: &[(&str, f64)]) -> ScoredProgram {
        (
            Arc::new(MockProgram::new(format!("instruction {primary}"))) as Arc<dyn Program>,
            score(primary, entries),
        )
    }

    // ── Dominance & frontier ──

    #[test]
    fn test_dominates_requires_strict_improvement() {
        let dims = vec![PRIMARY_DIMENSION.to_string(), "latency".to_string()];
        let better = score(0.9, &[("latency", 0.8)]);
        let worse = score(0.7, &[("latency", 0.8)]);
        assert!(dominates(&better, &worse, &dims));
        assert!(!dominates(&worse, &better, &dims));
        assert!(!dominates(&better, &better, &dims));
    }

    #[test]
    fn test_frontier_members_do_not_dominate_each_other() {
        let scores = vec![
            score(0.9, &[("latency", 0.2)]),
            score(0.5, &[("latency", 0.9)]),
            score(0.4, &[("latency", 0.1)]), // dominated by both
        ];
        let frontier = find_pareto_frontier(&scores);
        assert_eq!(frontier.len(), 2);
        let dims = objective_dimensions(&frontier);
        for a in &frontier {
            for b in &frontier {
                assert!(!dominates(a, b, &dims));
            }
        }
    }

    #[test]
    fn test_frontier_contains_max_overall() {
        let scores = vec![
            score(0.3, &[("latency", 0.3)]),
            score(0.95, &[("latency", 0.9)]),
            score(0.6, &[("latency", 0.5)]),
        ];
        let best = scores
            .iter()
            .max_by(|a, b| a.overall_score().partial_cmp(&b.overall_score()).unwrap())
            .unwrap();
        let frontier = find_pareto_frontier(&scores);
        assert!(frontier.contains(best));
    }

    #[test]
    fn test_frontier_small_inputs_unchanged() {
        assert!(find_pareto_frontier(&[]).is_empty());
        let single = vec![score(0.5, &[])];
        assert_eq!(find_pareto_frontier(&single), single);
    }

    // ── Crowding distance ──

    #[test]
    fn test_boundary_elements_exceed_interior() {
        let scores = vec![
            score(0.1, &[("latency", 0.1)]),
            score(0.5, &[("latency", 0.5)]),
            score(0.9, &[("latency", 0.9)]),
        ];
        let distances = calculate_crowding_distance(&scores);
        let low = distances[&scores[0]];
        let mid = distances[&scores[1]];
        let high = distances[&scores[2]];
        assert!(low > mid);
        assert!(high > mid);
        assert!(mid.is_finite());
    }

    #[test]
    fn test_equal_scores_share_one_entry() {
        let scores = vec![
            score(0.5, &[("latency", 0.5)]),
            score(0.5, &[("latency", 0.5)]),
            score(0.9, &[("latency", 0.1)]),
        ];
        let distances = calculate_crowding_distance(&scores);
        assert_eq!(distances.len(), 2);
    }

    #[test]
    fn test_crowding_empty_input() {
        assert!(calculate_crowding_distance(&[]).is_empty());
    }

    // ── Selection ──

    #[test]
    fn test_select_parents_clamps_and_fills() {
        let mut selector = ParetoSelector::new(3).with_seed(5);
        let population = vec![
            scored(0.9, &[("latency", 0.2)]),
            scored(0.5, &[("latency", 0.9)]),
            scored(0.4, &[("latency", 0.1)]),
        ];
        // More than population size: clamped
        let parents = selector.select_parents(&population, 10);
        assert_eq!(parents.len(), 3);
        // Frontier is 2 members; requesting 3 exercises the tournament fallback
        let parents = selector.select_parents(&population, 3);
        assert_eq!(parents.len(), 3);
    }

    #[test]
    fn test_select_parents_empty_population() {
        let mut selector = ParetoSelector::new(3).with_seed(5);
        assert!(selector.select_parents(&[], 4).is_empty());
    }

    #[test]
    fn test_select_survivors_distinct() {
        let mut selector = ParetoSelector::new(3).with_seed(5);
        let population = vec![
            scored(0.9, &[("latency", 0.2)]),
            scored(0.7, &[("latency", 0.9)]),
            scored(0.5, &[("latency", 0.5)]),
            scored(0.2, &[("latency", 0.3)]),
        ];
        let survivors = selector.select_survivors(&population, 3);
        assert_eq!(survivors.len(), 3);
        for (i, (_, a)) in survivors.iter().enumerate() {
            for (j, (_, b)) in survivors.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "survivors must be distinct members");
                }
            }
        }
    }

    #[test]
    fn test_tournament_singleton_and_empty() {
        let mut selector = ParetoSelector::new(3).with_seed(5);
        assert!(selector.tournament_selection(&[]).is_none());

        let single = vec![scored(0.4, &[])];
        let winner = selector.tournament_selection(&single).unwrap();
        assert_eq!(winner.1, single[0].1);
    }

    #[test]
    fn test_elite_selection_orders_by_overall() {
        let selector = ParetoSelector::new(3);
        let population = vec![scored(0.2, &[]), scored(0.9, &[]), scored(0.5, &[])];
        let elite = selector.elite_selection(&population, 2);
        assert_eq!(elite.len(), 2);
        assert!(elite[0].1.overall_score() >= elite[1].1.overall_score());
        assert!((elite[0].1.primary_score() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_diversity_selection_full_count_returns_all() {
        let selector = ParetoSelector::new(3);
        let population = vec![
            scored(0.1, &[("latency", 0.1)]),
            scored(0.5, &[("latency", 0.5)]),
            scored(0.9, &[("latency", 0.9)]),
        ];
        let selected = selector.diversity_selection(&population, population.len());
        assert_eq!(selected.len(), population.len());
        for (i, (_, a)) in selected.iter().enumerate() {
            for (j, (_, b)) in selected.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }
}
