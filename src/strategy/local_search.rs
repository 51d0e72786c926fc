use super::{SearchContext, SearchStrategy};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;

/// Best-improvement hill climbing from random starts.
pub struct MultiStartLocalSearch {
    restarts: usize,
    starts: usize,
    rng: StdRng,
    current: Option<(usize, f64)>,
    awaiting_start: bool,
    queue: VecDeque<usize>,
    best_neighbour: Option<(usize, f64)>,
    pending_neighbours: Vec<usize>,
}

impl MultiStartLocalSearch {
    pub fn new(restarts: usize, seed: u64) -> Self {
        Self {
            restarts: restarts.max(1),
            starts: 0,
            rng: StdRng::seed_from_u64(seed),
            current: None,
            awaiting_start: false,
            queue: VecDeque::new(),
            best_neighbour: None,
            pending_neighbours: Vec::new(),
        }
    }

    fn end_round(&mut self) {
        match (self.current, self.best_neighbour.take()) {
            (Some((_, here)), Some((idx, score))) if score < here => {
                self.current = Some((idx, score));
                self.awaiting_start = false;
                self.pending_neighbours.push(idx);
            }
            // local optimum
            _ => self.current = None,
        }
    }
}

impl SearchStrategy for MultiStartLocalSearch {
    fn name(&self) -> &'static str {
        "mls"
    }

    fn next(&mut self, ctx: &SearchContext) -> Option<usize> {
        if let Some(center) = self.pending_neighbours.pop() {
            self.queue = ctx.neighbours(center).into();
            if self.queue.is_empty() {
                self.current = None;
            }
        }
        if let Some(i) = self.queue.pop_front() {
            return Some(i);
        }
        if self.starts >= self.restarts {
            return None;
        }
        self.starts += 1;
        self.awaiting_start = true;
        ctx.random_index(&mut self.rng)
    }

    fn observe(&mut self, index: usize, score: Option<f64>) {
        let score = score.unwrap_or(f64::INFINITY);
        if self.awaiting_start {
            self.awaiting_start = false;
            self.current = Some((index, score));
            self.pending_neighbours.push(index);
            return;
        }
        if self.best_neighbour.map_or(true, |(_, s)| score < s) {
            self.best_neighbour = Some((index, score));
        }
        if self.queue.is_empty() {
            self.end_round();
        }
    }
}
