//! Generational genetic algorithm over value positions.
//!
//! Each generation keeps the two best individuals, fills the rest with
//! children of rank-weighted parents (uniform crossover, per-gene mutation)
//! and repairs children that violate a restriction by moving them to the
//! nearest valid configuration.

use super::{SearchContext, SearchStrategy};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

const ELITES: usize = 2;

pub struct GeneticAlgorithm {
    popsize: usize,
    generations: usize,
    mutation_chance: u32,
    rng: StdRng,
    generation: usize,
    pending: VecDeque<usize>,
    evaluated: Vec<(usize, f64)>,
    started: bool,
}

impl GeneticAlgorithm {
    pub fn new(popsize: usize, generations: usize, mutation_chance: u32, seed: u64) -> Self {
        Self {
            popsize: popsize.max(ELITES + 1),
            generations: generations.max(1),
            mutation_chance: mutation_chance.max(1),
            rng: StdRng::seed_from_u64(seed),
            generation: 0,
            pending: VecDeque::new(),
            evaluated: Vec::new(),
            started: false,
        }
    }

    fn initial_population(&mut self, ctx: &SearchContext) {
        let n = self.popsize.min(ctx.len());
        self.pending = sample(&mut self.rng, ctx.len(), n).into_iter().collect();
    }

    /// Index into the sorted population, biased towards the front.
    fn pick_parent(&mut self, len: usize) -> usize {
        // weight of rank r is len - r
        let total = len * (len + 1) / 2;
        let mut ticket = self.rng.gen_range(0..total);
        for r in 0..len {
            let w = len - r;
            if ticket < w {
                return r;
            }
            ticket -= w;
        }
        len - 1
    }

    fn next_generation(&mut self, ctx: &SearchContext) {
        let mut population = std::mem::take(&mut self.evaluated);
        population.sort_by(|a, b| a.1.total_cmp(&b.1));
        population.dedup_by_key(|p| p.0);

        let elites: Vec<(usize, f64)> = population.iter().take(ELITES).copied().collect();
        let dims = ctx.dims().to_vec();
        for _ in 0..self.popsize.saturating_sub(elites.len()) {
            let a = population[self.pick_parent(population.len())].0;
            let b = population[self.pick_parent(population.len())].0;
            let (pa, pb) = (ctx.position(a), ctx.position(b));
            let mut child: Vec<usize> = pa
                .iter()
                .zip(pb)
                .map(|(x, y)| if self.rng.gen_bool(0.5) { *x } else { *y })
                .collect();
            for (gene, &dim) in child.iter_mut().zip(&dims) {
                if self.rng.gen_range(0..self.mutation_chance) == 0 {
                    *gene = self.rng.gen_range(0..dim);
                }
            }
            if let Some(i) = ctx.nearest_valid(&child) {
                self.pending.push_back(i);
            }
        }
        self.evaluated = elites;
        self.generation += 1;
    }
}

impl SearchStrategy for GeneticAlgorithm {
    fn name(&self) -> &'static str {
        "genetic_algorithm"
    }

    fn next(&mut self, ctx: &SearchContext) -> Option<usize> {
        if ctx.is_empty() {
            return None;
        }
        if !self.started {
            self.started = true;
            self.initial_population(ctx);
        }
        if self.pending.is_empty() {
            if self.generation + 1 >= self.generations || self.evaluated.is_empty() {
                return None;
            }
            self.next_generation(ctx);
        }
        self.pending.pop_front()
    }

    fn observe(&mut self, index: usize, score: Option<f64>) {
        self.evaluated.push((index, score.unwrap_or(f64::INFINITY)));
    }
}
