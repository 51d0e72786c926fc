use super::{SearchContext, SearchStrategy};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const DEFAULT_FRACTION: f64 = 0.1;

/// Seeded shuffle of the valid space, truncated to a fraction or a count.
pub struct RandomSample {
    fraction: Option<f64>,
    max_fevals: Option<usize>,
    rng: StdRng,
    order: Option<Vec<usize>>,
    cursor: usize,
}

impl RandomSample {
    pub fn new(fraction: Option<f64>, max_fevals: Option<usize>, seed: u64) -> Self {
        Self {
            fraction,
            max_fevals,
            rng: StdRng::seed_from_u64(seed),
            order: None,
            cursor: 0,
        }
    }

    fn sample_size(&self, len: usize) -> usize {
        let from_fraction = |f: f64| ((len as f64) * f.clamp(0.0, 1.0)).ceil() as usize;
        let n = match (self.fraction, self.max_fevals) {
            (Some(f), Some(m)) => from_fraction(f).min(m),
            (Some(f), None) => from_fraction(f),
            (None, Some(m)) => m,
            (None, None) => from_fraction(DEFAULT_FRACTION),
        };
        n.clamp(1, len.max(1))
    }
}

impl SearchStrategy for RandomSample {
    fn name(&self) -> &'static str {
        "random_sample"
    }

    fn next(&mut self, ctx: &SearchContext) -> Option<usize> {
        if ctx.is_empty() {
            return None;
        }
        if self.order.is_none() {
            let mut all: Vec<usize> = (0..ctx.len()).collect();
            all.shuffle(&mut self.rng);
            all.truncate(self.sample_size(ctx.len()));
            self.order = Some(all);
        }
        let order = self.order.as_ref()?;
        let next = order.get(self.cursor).copied();
        self.cursor += 1;
        next
    }

    fn observe(&mut self, _index: usize, _score: Option<f64>) {}
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn evaluates_requested_share_without_repeats() {
        let ctx = context();
        let order = drive(&mut RandomSample::new(Some(0.5), None, 1), &ctx, usize::MAX);
        assert_eq!(order.len(), (ctx.len() as f64 * 0.5).ceil() as usize);
        let unique: HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), order.len());

        let capped = drive(&mut RandomSample::new(None, Some(5), 1), &ctx, usize::MAX);
        assert_eq!(capped.len(), 5);
    }
}
