//! Benchmark executor.
//!
//! For a configuration that passed the feasibility filter: substitute the
//! parameters into the kernel source, compile once, launch `iterations` times,
//! keep every sample and derive the user metrics. Compile and launch failures
//! become skip records; nothing in here aborts a tuning run.

mod metrics;
mod stats;

pub use metrics::{MetricEntry, MetricScope, MetricValues, Metrics};
pub use stats::{compute_stats, SampleStats};

use crate::backend::{Backend, KernelArg, ResourceUsage};
use crate::feasibility::{FeasibilityFilter, LaunchGeometry, SkipReason};
use crate::kernel::KernelSource;
use crate::space::Configuration;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_ITERATIONS: usize = 7;

/// Timing samples and derived metrics of one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Mean over all samples, milliseconds.
    pub time_ms: f64,
    pub times_ms: Vec<f64>,
    pub std_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    #[serde(default)]
    pub metrics: MetricValues,
    pub geometry: LaunchGeometry,
    #[serde(default)]
    pub resources: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Measured(Measurement),
    Skipped { reason: SkipReason },
}

/// Immutable record for one evaluated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub config: Configuration,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl BenchmarkResult {
    pub fn measured(config: Configuration, measurement: Measurement) -> Self {
        Self {
            config,
            outcome: Outcome::Measured(measurement),
        }
    }

    pub fn skipped(config: Configuration, reason: SkipReason) -> Self {
        Self {
            config,
            outcome: Outcome::Skipped { reason },
        }
    }

    pub fn measurement(&self) -> Option<&Measurement> {
        match &self.outcome {
            Outcome::Measured(m) => Some(m),
            Outcome::Skipped { .. } => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match &self.outcome {
            Outcome::Skipped { reason } => Some(reason),
            Outcome::Measured(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason().is_some()
    }

    pub fn time_ms(&self) -> Option<f64> {
        self.measurement().map(|m| m.time_ms)
    }

    /// `time` or a derived metric by name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        let m = self.measurement()?;
        if name == "time" {
            Some(m.time_ms)
        } else {
            m.metrics.get(name)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Minimize,
    Maximize,
}

/// Which metric the search optimises, and in which direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    #[serde(default = "default_objective_metric")]
    pub metric: String,
    #[serde(default)]
    pub direction: Direction,
}

fn default_objective_metric() -> String {
    "time".to_string()
}

impl Default for Objective {
    fn default() -> Self {
        Self::minimize("time")
    }
}

impl Objective {
    pub fn minimize(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
            direction: Direction::Minimize,
        }
    }

    pub fn maximize(metric: &str) -> Self {
        Self {
            metric: metric.to_string(),
            direction: Direction::Maximize,
        }
    }

    /// Score to minimise; `None` for skipped results and NaN metrics.
    pub fn score(&self, result: &BenchmarkResult) -> Option<f64> {
        let v = result.metric(&self.metric)?;
        if v.is_nan() {
            return None;
        }
        Some(match self.direction {
            Direction::Minimize => v,
            Direction::Maximize => -v,
        })
    }

    /// Ordering where the better result comes first; unscored results last.
    pub fn compare(&self, a: &BenchmarkResult, b: &BenchmarkResult) -> Ordering {
        match (self.score(a), self.score(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// Compiles and times configurations on one backend.
pub struct BenchmarkExecutor<'a> {
    kernel: &'a KernelSource,
    args: &'a [KernelArg],
    metrics: &'a Metrics,
    filter: &'a FeasibilityFilter,
    iterations: usize,
}

impl<'a> BenchmarkExecutor<'a> {
    pub fn new(
        kernel: &'a KernelSource,
        args: &'a [KernelArg],
        metrics: &'a Metrics,
        filter: &'a FeasibilityFilter,
        iterations: usize,
    ) -> Self {
        Self {
            kernel,
            args,
            metrics,
            filter,
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Feasibility check followed by measurement.
    pub fn evaluate(&self, backend: &mut dyn Backend, config: &Configuration) -> BenchmarkResult {
        match self.filter.check(config) {
            Ok(geometry) => self.measure(backend, config, geometry),
            Err(reason) => BenchmarkResult::skipped(config.clone(), reason),
        }
    }

    /// Compile once and launch `iterations` times. The geometry must come from
    /// the feasibility filter.
    pub fn measure(
        &self,
        backend: &mut dyn Backend,
        config: &Configuration,
        geometry: LaunchGeometry,
    ) -> BenchmarkResult {
        let prepared = self.kernel.prepare(config, &geometry);
        let compiled = match backend.compile(&prepared) {
            Ok(c) => c,
            Err(e) => {
                return BenchmarkResult::skipped(
                    config.clone(),
                    SkipReason::CompileError {
                        message: e.message,
                    },
                )
            }
        };
        if let Err(reason) = self.filter.check_compiled(&geometry, &compiled.resources) {
            return BenchmarkResult::skipped(config.clone(), reason);
        }

        let mut times_ms = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            match backend.launch(&compiled, &geometry, self.args) {
                Ok(d) => times_ms.push(d.as_secs_f64() * 1000.0),
                Err(e) => {
                    return BenchmarkResult::skipped(
                        config.clone(),
                        SkipReason::LaunchError {
                            message: e.message,
                        },
                    )
                }
            }
        }

        let stats = compute_stats(&times_ms);
        let metrics = self.metrics.evaluate(config, stats.mean, &geometry);
        BenchmarkResult::measured(
            config.clone(),
            Measurement {
                time_ms: stats.mean,
                times_ms,
                std_ms: stats.std,
                min_ms: stats.min,
                max_ms: stats.max,
                metrics,
                geometry,
                resources: compiled.resources,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(time: f64, gflops: f64) -> BenchmarkResult {
        let mut metrics = MetricValues::default();
        metrics.push("gflops", gflops);
        BenchmarkResult::measured(
            Configuration::from_pairs([("x", 1)]),
            Measurement {
                time_ms: time,
                times_ms: vec![time],
                std_ms: 0.0,
                min_ms: time,
                max_ms: time,
                metrics,
                geometry: LaunchGeometry {
                    block: [1, 1, 1],
                    grid: [1, 1, 1],
                    shared_memory: 0,
                },
                resources: ResourceUsage::default(),
            },
        )
    }

    #[test]
    fn objective_direction() {
        let fast = result(1.0, 10.0);
        let slow = result(2.0, 20.0);
        assert_eq!(Objective::default().compare(&fast, &slow), Ordering::Less);
        assert_eq!(
            Objective::maximize("gflops").compare(&fast, &slow),
            Ordering::Greater
        );
        let skipped = BenchmarkResult::skipped(
            Configuration::from_pairs([("x", 2)]),
            SkipReason::LaunchError {
                message: "boom".into(),
            },
        );
        assert_eq!(Objective::default().score(&skipped), None);
        assert_eq!(Objective::default().compare(&skipped, &slow), Ordering::Greater);
    }

    #[test]
    fn result_json_shape() {
        let skipped = BenchmarkResult::skipped(
            Configuration::from_pairs([("block_size_x", 2048)]),
            SkipReason::TooManyThreads {
                threads: 2048,
                limit: 1024,
            },
        );
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"]["category"], "too-many-threads");
        assert_eq!(json["config"]["block_size_x"], 2048);

        let measured = result(1.5, 3.0);
        let text = serde_json::to_string(&measured).unwrap();
        let back: BenchmarkResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, measured);
    }
}
