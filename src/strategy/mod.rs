//! Search strategies.
//!
//! A strategy proposes configurations one at a time by index into a
//! [`SearchContext`] and is told the score of every proposal (lower is
//! better, `None` for skipped ones). Every proposal is followed by exactly
//! one `observe` call before the next `next`; repeated proposals are answered
//! from the tuner's memo without spending budget.

mod annealing;
mod exhaustive;
mod genetic;
mod local_search;
mod random;

pub use annealing::SimulatedAnnealing;
pub use exhaustive::BruteForce;
pub use genetic::GeneticAlgorithm;
pub use local_search::MultiStartLocalSearch;
pub use random::RandomSample;

use crate::space::{Configuration, SearchSpace};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub trait SearchStrategy: Send {
    fn name(&self) -> &'static str;

    /// Next configuration index to evaluate, or `None` when done.
    fn next(&mut self, ctx: &SearchContext) -> Option<usize>;

    fn observe(&mut self, index: usize, score: Option<f64>);

    /// True when proposals are exactly the enumeration order, so a run can
    /// stream the space instead of building a [`SearchContext`].
    fn is_sequential(&self) -> bool {
        false
    }
}

/// The valid configurations, materialised once, with their value positions.
pub struct SearchContext {
    configs: Vec<Configuration>,
    positions: Vec<Vec<usize>>,
    index: HashMap<Vec<usize>, usize>,
    dims: Vec<usize>,
}

impl SearchContext {
    pub fn new(space: &SearchSpace) -> Self {
        let configs = space.collect();
        let positions: Vec<Vec<usize>> = configs
            .iter()
            .map(|c| space.positions(c).unwrap_or_default())
            .collect();
        let index = positions
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();
        Self {
            configs,
            positions,
            index,
            dims: space.dims(),
        }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn config(&self, index: usize) -> &Configuration {
        &self.configs[index]
    }

    pub fn configs(&self) -> &[Configuration] {
        &self.configs
    }

    pub fn position(&self, index: usize) -> &[usize] {
        &self.positions[index]
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn index_of(&self, positions: &[usize]) -> Option<usize> {
        self.index.get(positions).copied()
    }

    /// Valid configurations that differ in exactly one parameter by one
    /// position in its value list.
    pub fn neighbours(&self, index: usize) -> Vec<usize> {
        let base = &self.positions[index];
        let mut out = Vec::new();
        let mut probe = base.clone();
        for (p, &dim) in self.dims.iter().enumerate() {
            let here = base[p];
            if here > 0 {
                probe[p] = here - 1;
                if let Some(i) = self.index_of(&probe) {
                    out.push(i);
                }
            }
            if here + 1 < dim {
                probe[p] = here + 1;
                if let Some(i) = self.index_of(&probe) {
                    out.push(i);
                }
            }
            probe[p] = here;
        }
        out
    }

    pub fn random_index(&self, rng: &mut StdRng) -> Option<usize> {
        if self.configs.is_empty() {
            None
        } else {
            Some(rng.gen_range(0..self.configs.len()))
        }
    }

    /// Closest valid configuration by L1 distance over value positions; ties
    /// go to the lowest index.
    pub fn nearest_valid(&self, positions: &[usize]) -> Option<usize> {
        if let Some(i) = self.index_of(positions) {
            return Some(i);
        }
        self.positions
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| {
                p.iter()
                    .zip(positions)
                    .map(|(a, b)| a.abs_diff(*b))
                    .sum::<usize>()
            })
            .map(|(i, _)| i)
    }
}

fn default_fraction() -> Option<f64> {
    None
}

fn default_popsize() -> usize {
    20
}

fn default_generations() -> usize {
    100
}

fn default_mutation_chance() -> u32 {
    10
}

fn default_t0() -> f64 {
    1.0
}

fn default_t_min() -> f64 {
    0.001
}

fn default_alpha() -> f64 {
    0.995
}

fn default_restarts() -> usize {
    8
}

/// Strategy selection and options, as written in a job file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum StrategyConfig {
    #[default]
    #[serde(alias = "exhaustive")]
    BruteForce,

    #[serde(alias = "random")]
    RandomSample {
        /// Share of the valid space to evaluate; 0.1 when neither this nor
        /// `max_fevals` is set.
        #[serde(default = "default_fraction")]
        fraction: Option<f64>,
        #[serde(default)]
        max_fevals: Option<usize>,
        #[serde(default)]
        seed: u64,
    },

    #[serde(alias = "genetic", alias = "ga")]
    GeneticAlgorithm {
        #[serde(default = "default_popsize")]
        popsize: usize,
        #[serde(default = "default_generations")]
        generations: usize,
        /// Each gene mutates with probability `1 / mutation_chance`.
        #[serde(default = "default_mutation_chance")]
        mutation_chance: u32,
        #[serde(default)]
        seed: u64,
    },

    #[serde(alias = "annealing")]
    SimulatedAnnealing {
        #[serde(default = "default_t0")]
        t0: f64,
        #[serde(default = "default_t_min")]
        t_min: f64,
        #[serde(default = "default_alpha")]
        alpha: f64,
        #[serde(default)]
        seed: u64,
    },

    #[serde(alias = "local_search", alias = "multi_start_local_search")]
    Mls {
        #[serde(default = "default_restarts")]
        restarts: usize,
        #[serde(default)]
        seed: u64,
    },
}

impl StrategyConfig {
    pub const NAMES: [&'static str; 5] = [
        "brute_force",
        "random_sample",
        "genetic_algorithm",
        "simulated_annealing",
        "mls",
    ];

    /// Strategy with default options, by name or alias.
    pub fn from_name(name: &str) -> Option<Self> {
        let json = serde_json::json!({ "name": name.trim().to_lowercase() });
        serde_json::from_value(json).ok()
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::BruteForce => "brute_force",
            StrategyConfig::RandomSample { .. } => "random_sample",
            StrategyConfig::GeneticAlgorithm { .. } => "genetic_algorithm",
            StrategyConfig::SimulatedAnnealing { .. } => "simulated_annealing",
            StrategyConfig::Mls { .. } => "mls",
        }
    }

    pub fn with_seed(mut self, new_seed: u64) -> Self {
        match &mut self {
            StrategyConfig::BruteForce => {}
            StrategyConfig::RandomSample { seed, .. }
            | StrategyConfig::GeneticAlgorithm { seed, .. }
            | StrategyConfig::SimulatedAnnealing { seed, .. }
            | StrategyConfig::Mls { seed, .. } => *seed = new_seed,
        }
        self
    }

    pub fn build(&self) -> Box<dyn SearchStrategy> {
        match self.clone() {
            StrategyConfig::BruteForce => Box::new(BruteForce::new()),
            StrategyConfig::RandomSample {
                fraction,
                max_fevals,
                seed,
            } => Box::new(RandomSample::new(fraction, max_fevals, seed)),
            StrategyConfig::GeneticAlgorithm {
                popsize,
                generations,
                mutation_chance,
                seed,
            } => Box::new(GeneticAlgorithm::new(
                popsize,
                generations,
                mutation_chance,
                seed,
            )),
            StrategyConfig::SimulatedAnnealing {
                t0,
                t_min,
                alpha,
                seed,
            } => Box::new(SimulatedAnnealing::new(t0, t_min, alpha, seed)),
            StrategyConfig::Mls { restarts, seed } => {
                Box::new(MultiStartLocalSearch::new(restarts, seed))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::space::{ParameterSpace, Restriction};

    pub fn context() -> SearchContext {
        let params = ParameterSpace::new()
            .with("block_size_x", [16, 32, 64, 128, 256, 512])
            .unwrap()
            .with("block_size_y", [1, 2, 4, 8])
            .unwrap()
            .with("tile", [1, 2, 4])
            .unwrap();
        let space = SearchSpace::new(
            params,
            vec![Restriction::parse("block_size_x * block_size_y <= 1024").unwrap()],
        )
        .unwrap();
        SearchContext::new(&space)
    }

    /// Smooth bowl with its minimum at (128, 4, 2).
    pub fn score(ctx: &SearchContext, index: usize) -> f64 {
        let p = ctx.position(index);
        let target = [3usize, 2, 1];
        1.0 + p
            .iter()
            .zip(target)
            .map(|(a, b)| (a.abs_diff(b) as f64).powi(2))
            .sum::<f64>()
    }

    /// Drive a strategy like the tuner does, with memoisation.
    pub fn drive(strategy: &mut dyn SearchStrategy, ctx: &SearchContext, limit: usize) -> Vec<usize> {
        let mut seen = std::collections::HashSet::new();
        let mut order = Vec::new();
        let mut proposals = 0;
        while let Some(i) = strategy.next(ctx) {
            proposals += 1;
            if seen.insert(i) {
                order.push(i);
            }
            strategy.observe(i, Some(score(ctx, i)));
            if proposals >= limit {
                break;
            }
        }
        order
    }
}
