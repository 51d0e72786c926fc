use super::{SearchContext, SearchStrategy};

/// Every valid configuration exactly once, in enumeration order.
#[derive(Debug, Default)]
pub struct BruteForce {
    cursor: usize,
}

impl BruteForce {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SearchStrategy for BruteForce {
    fn name(&self) -> &'static str {
        "brute_force"
    }

    fn next(&mut self, ctx: &SearchContext) -> Option<usize> {
        if self.cursor >= ctx.len() {
            return None;
        }
        self.cursor += 1;
        Some(self.cursor - 1)
    }

    fn observe(&mut self, _index: usize, _score: Option<f64>) {}

    fn is_sequential(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn visits_in_order_once() {
        let ctx = context();
        let order = drive(&mut BruteForce::new(), &ctx, usize::MAX);
        assert_eq!(order, (0..ctx.len()).collect::<Vec<_>>());
        assert!(BruteForce::new().is_sequential());
    }
}
