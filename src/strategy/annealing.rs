use super::{SearchContext, SearchStrategy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Simulated annealing with a geometric schedule `T <- alpha * T`.
///
/// Moves go to a random neighbour; a worse candidate is accepted with
/// probability `exp(-(new - old) / old / T)`.
pub struct SimulatedAnnealing {
    temperature: f64,
    t_min: f64,
    alpha: f64,
    rng: StdRng,
    current: Option<(usize, Option<f64>)>,
}

impl SimulatedAnnealing {
    pub fn new(t0: f64, t_min: f64, alpha: f64, seed: u64) -> Self {
        Self {
            temperature: t0.max(f64::MIN_POSITIVE),
            t_min: t_min.max(0.0),
            alpha: alpha.clamp(0.0, 0.999_999),
            rng: StdRng::seed_from_u64(seed),
            current: None,
        }
    }

    fn accept(&mut self, old: Option<f64>, new: Option<f64>) -> bool {
        match (old, new) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(old), Some(new)) => {
                if new <= old {
                    return true;
                }
                let relative = if old.abs() > f64::EPSILON {
                    (new - old) / old.abs()
                } else {
                    new - old
                };
                let p = (-relative / self.temperature).exp();
                self.rng.gen::<f64>() < p
            }
        }
    }
}

impl SearchStrategy for SimulatedAnnealing {
    fn name(&self) -> &'static str {
        "simulated_annealing"
    }

    fn next(&mut self, ctx: &SearchContext) -> Option<usize> {
        if self.temperature < self.t_min {
            return None;
        }
        match self.current {
            None => ctx.random_index(&mut self.rng),
            Some((idx, _)) => {
                let neighbours = ctx.neighbours(idx);
                if neighbours.is_empty() {
                    ctx.random_index(&mut self.rng)
                } else {
                    Some(neighbours[self.rng.gen_range(0..neighbours.len())])
                }
            }
        }
    }

    fn observe(&mut self, index: usize, score: Option<f64>) {
        let old = self.current.and_then(|(_, s)| s);
        if self.current.is_none() || self.accept(old, score) {
            self.current = Some((index, score));
        }
        self.temperature *= self.alpha;
    }
}
