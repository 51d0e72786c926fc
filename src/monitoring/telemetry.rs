//! Tuning counters exported in Prometheus text format.

use crate::feasibility::SkipReason;
use std::sync::atomic::{AtomicU64, Ordering};

/// Evaluation wall-time histogram buckets (milliseconds): compile plus all
/// iterations of one configuration.
const EVAL_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

/// Counters for one or more tuning runs. Safe to share between threads.
pub struct TuningTelemetry {
    evaluations: AtomicU64,
    cache_hits: AtomicU64,
    skips: [AtomicU64; 6],
    /// Cumulative evaluation time in microseconds.
    eval_sum_us: AtomicU64,
    bucket_counts: [AtomicU64; 10],
    /// Best kernel time so far in nanoseconds, `u64::MAX` when unset.
    best_time_ns: AtomicU64,
}

impl Default for TuningTelemetry {
    fn default() -> Self {
        Self {
            evaluations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            skips: Default::default(),
            eval_sum_us: AtomicU64::new(0),
            bucket_counts: Default::default(),
            best_time_ns: AtomicU64::new(u64::MAX),
        }
    }
}

impl TuningTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration was compiled and measured; `wall_ms` covers the whole
    /// evaluation.
    pub fn record_evaluation(&self, wall_ms: f64, kernel_time_ms: Option<f64>) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.eval_sum_us
            .fetch_add((wall_ms * 1000.0) as u64, Ordering::Relaxed);
        for (i, &bound) in EVAL_BUCKETS_MS.iter().enumerate() {
            if wall_ms <= bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(t) = kernel_time_ms.filter(|t| t.is_finite()) {
            self.best_time_ns
                .fetch_min((t * 1e6) as u64, Ordering::Relaxed);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, reason: &SkipReason) {
        self.skips[reason.category_index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn skips(&self, category: &str) -> u64 {
        SkipReason::CATEGORIES
            .iter()
            .position(|c| *c == category)
            .map(|i| self.skips[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn export_metrics(&self) -> String {
        let evaluations = self.evaluations();
        let hits = self.cache_hits();
        let sum_us = self.eval_sum_us.load(Ordering::Relaxed);
        let best = self.best_time_ns.load(Ordering::Relaxed);

        let mut out = String::new();
        out.push_str("# HELP ktuner_evaluations_total Configurations compiled and measured.\n");
        out.push_str("# TYPE ktuner_evaluations_total counter\n");
        out.push_str(&format!("ktuner_evaluations_total {}\n", evaluations));

        out.push_str("# HELP ktuner_cache_hits_total Results reused from the cache.\n");
        out.push_str("# TYPE ktuner_cache_hits_total counter\n");
        out.push_str(&format!("ktuner_cache_hits_total {}\n", hits));

        out.push_str("# HELP ktuner_skipped_total Configurations skipped, by category.\n");
        out.push_str("# TYPE ktuner_skipped_total counter\n");
        for (i, category) in SkipReason::CATEGORIES.iter().enumerate() {
            out.push_str(&format!(
                "ktuner_skipped_total{{category=\"{}\"}} {}\n",
                category,
                self.skips[i].load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ktuner_evaluation_ms Evaluation wall time histogram (ms).\n");
        out.push_str("# TYPE ktuner_evaluation_ms histogram\n");
        for (i, &bound) in EVAL_BUCKETS_MS.iter().enumerate() {
            out.push_str(&format!(
                "ktuner_evaluation_ms_bucket{{le=\"{}\"}} {}\n",
                bound,
                self.bucket_counts[i].load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "ktuner_evaluation_ms_bucket{{le=\"+Inf\"}} {}\n",
            evaluations
        ));
        out.push_str(&format!(
            "ktuner_evaluation_ms_sum {}\n",
            sum_us as f64 / 1000.0
        ));
        out.push_str(&format!("ktuner_evaluation_ms_count {}\n", evaluations));

        if best != u64::MAX {
            out.push_str("# HELP ktuner_best_time_ms Fastest measured kernel time (ms).\n");
            out.push_str("# TYPE ktuner_best_time_ms gauge\n");
            out.push_str(&format!("ktuner_best_time_ms {}\n", best as f64 / 1e6));
        }
        out
    }
}
