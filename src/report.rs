//! Tuning reports: every result of a run plus statistics and the environment.

use crate::benchmark::{BenchmarkResult, Objective};
use crate::cache::ProblemIdentity;
use crate::device::Environment;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Why a tuning run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The strategy has nothing more to propose.
    Completed,
    /// Every valid configuration has a result.
    SpaceExhausted,
    /// The strategy kept proposing configurations it had already seen.
    Stalled,
    MaxFevals,
    TimeLimit,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Completed => "completed",
            StopReason::SpaceExhausted => "space exhausted",
            StopReason::Stalled => "stalled",
            StopReason::MaxFevals => "evaluation budget reached",
            StopReason::TimeLimit => "time limit reached",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub cartesian_size: u64,
    /// Valid configurations. A brute-force run streams the space, so when it
    /// stops early this is how far enumeration got.
    pub valid_configurations: usize,
    /// Configurations benchmarked in this run (cache misses).
    pub evaluated: usize,
    pub cache_hits: usize,
    /// Repeated proposals answered from memory.
    pub duplicates: usize,
    /// Skipped results per category, cached ones included.
    pub skipped: BTreeMap<String, usize>,
    pub elapsed_secs: f64,
    pub stop_reason: StopReason,
}

impl RunStats {
    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningReport {
    pub problem: ProblemIdentity,
    pub objective: Objective,
    pub results: Vec<BenchmarkResult>,
    pub stats: RunStats,
    pub environment: Environment,
}

impl TuningReport {
    /// Best measured result under the run's objective.
    pub fn best(&self) -> Option<&BenchmarkResult> {
        self.ranked().into_iter().next()
    }

    /// Measured results, best first.
    pub fn ranked(&self) -> Vec<&BenchmarkResult> {
        let mut out: Vec<&BenchmarkResult> = self
            .results
            .iter()
            .filter(|r| self.objective.score(r).is_some())
            .collect();
        out.sort_by(|a, b| self.objective.compare(a, b));
        out
    }

    pub fn skipped(&self) -> impl Iterator<Item = &BenchmarkResult> {
        self.results.iter().filter(|r| r.is_skipped())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Human-readable summary with the `top_n` best configurations.
pub fn format_report(report: &TuningReport, top_n: usize) -> String {
    let stats = &report.stats;
    let mut out = String::new();
    out.push_str(&format!(
        "=== Tuning Report: {} [{}] on {} ===\n",
        report.problem.kernel_name, report.problem.problem_size, report.environment.device.name
    ));
    out.push_str(&format!(
        "Strategy: {} | {} iterations | backend {}\n",
        report.environment.strategy, report.environment.iterations, report.environment.backend
    ));
    out.push_str(&format!(
        "Space: {} valid of {} | evaluated {} | cache hits {} | skipped {} | {:.2}s ({})\n",
        stats.valid_configurations,
        stats.cartesian_size,
        stats.evaluated,
        stats.cache_hits,
        stats.total_skipped(),
        stats.elapsed_secs,
        stats.stop_reason
    ));
    for (category, n) in &stats.skipped {
        out.push_str(&format!("  skipped {}: {}\n", category, n));
    }

    let ranked = report.ranked();
    let Some(best) = ranked.first() else {
        out.push_str("No configuration was measured.\n");
        return out;
    };
    let best_score = report.objective.score(best).unwrap_or(f64::NAN);
    out.push_str(&format!("Best: {}\n", best.config));
    if let Some(m) = best.measurement() {
        out.push_str(&format!(
            "Perf: {:.4} ms (std {:.4}, min {:.4}, max {:.4})",
            m.time_ms, m.std_ms, m.min_ms, m.max_ms
        ));
        for (name, v) in m.metrics.iter() {
            out.push_str(&format!(" | {} {:.3}", name, v));
        }
        out.push('\n');
    }

    let n = ranked.len().min(top_n);
    if n > 1 {
        out.push_str(&format!("\nTop configurations ({}):\n", report.objective.metric));
        for (i, r) in ranked.iter().take(n).enumerate() {
            let score = report.objective.score(r).unwrap_or(f64::NAN);
            let value = r.metric(&report.objective.metric).unwrap_or(f64::NAN);
            out.push_str(&format!(
                "  #{}: {} | {:.4} | {:.2}x vs best\n",
                i + 1,
                r.config,
                value,
                score / best_score
            ));
        }
    }

    if let Some(worst) = ranked.last() {
        let ratio = report.objective.score(worst).unwrap_or(f64::NAN) / best_score;
        out.push_str(&format!(
            "\nParameter sensitivity: worst/best = {:.1}x\n",
            ratio
        ));
    }
    out
}
