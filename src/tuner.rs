//! Tuning run orchestration.
//!
//! A [`Tuner`] validates the problem, then walks the strategy's proposals one
//! configuration at a time: cache lookup, feasibility check, benchmark,
//! record. Brute force is fed straight from the lazy space iterator; every
//! other strategy works on the materialised valid space. Cancellation, the time limit and the evaluation budget are checked
//! only between configurations, and the result store is flushed on every
//! exit path that returns a report.

use crate::backend::{Backend, KernelArg};
use crate::benchmark::{
    BenchmarkExecutor, BenchmarkResult, Metrics, Objective, Outcome, DEFAULT_ITERATIONS,
};
use crate::cache::{ProblemIdentity, ResultCache, ResultStore};
use crate::device::{DeviceProperties, Environment};
use crate::errors::{Result, TunerError};
use crate::feasibility::{
    FeasibilityFilter, GridDivisors, ProblemSize, ResourceModel, DEFAULT_BLOCK_SIZE_NAMES,
};
use crate::kernel::KernelSource;
use crate::monitoring::TuningTelemetry;
use crate::report::{RunStats, StopReason, TuningReport};
use crate::space::{Configuration, SearchSpace};
use crate::strategy::{SearchContext, SearchStrategy, StrategyConfig};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Repeated proposals tolerated in a row before a run counts as stalled.
const MIN_DUPLICATE_STREAK: usize = 1000;

/// What to tune.
#[derive(Debug, Clone)]
pub struct TuningProblem {
    pub kernel: KernelSource,
    pub problem_size: ProblemSize,
    pub args: Vec<KernelArg>,
    pub space: SearchSpace,
    pub metrics: Metrics,
}

impl TuningProblem {
    pub fn new(kernel: KernelSource, problem_size: ProblemSize, space: SearchSpace) -> Self {
        Self {
            kernel,
            problem_size,
            args: Vec::new(),
            space,
            metrics: Metrics::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<KernelArg>) -> Self {
        self.args = args;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Budget {
    /// Maximum number of configurations benchmarked in this run; cache hits
    /// and repeated proposals are free.
    pub max_fevals: Option<usize>,
    pub time_limit: Option<Duration>,
}

/// How to tune.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningOptions {
    pub iterations: usize,
    pub verbose: bool,
    pub objective: Objective,
    pub strategy: StrategyConfig,
    pub budget: Budget,
    pub block_size_names: [String; 3],
    pub grid_div: GridDivisors,
    pub resources: ResourceModel,
}

impl Default for TuningOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            verbose: false,
            objective: Objective::default(),
            strategy: StrategyConfig::default(),
            budget: Budget::default(),
            block_size_names: DEFAULT_BLOCK_SIZE_NAMES.map(String::from),
            grid_div: GridDivisors::default(),
            resources: ResourceModel::default(),
        }
    }
}

/// Cooperative cancellation, observed between configurations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Tuner {
    problem: TuningProblem,
    options: TuningOptions,
    cancel: CancelToken,
    telemetry: Arc<TuningTelemetry>,
}

impl Tuner {
    pub fn new(problem: TuningProblem, options: TuningOptions) -> Self {
        Self {
            problem,
            options,
            cancel: CancelToken::new(),
            telemetry: Arc::new(TuningTelemetry::new()),
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TuningTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn telemetry(&self) -> &TuningTelemetry {
        &self.telemetry
    }

    pub fn problem(&self) -> &TuningProblem {
        &self.problem
    }

    pub fn options(&self) -> &TuningOptions {
        &self.options
    }

    pub fn problem_identity(&self, device: &DeviceProperties) -> ProblemIdentity {
        ProblemIdentity {
            kernel_name: self.problem.kernel.name().to_string(),
            problem_size: self.problem.problem_size.to_string(),
            device_name: device.name.clone(),
            param_names: self.problem.space.names().to_vec(),
        }
    }

    /// Check everything that can be checked without benchmarking.
    pub fn validate(&self, device: &DeviceProperties) -> Result<FeasibilityFilter> {
        if self.options.iterations == 0 {
            return Err(TunerError::config("iterations must be at least 1"));
        }
        self.problem.metrics.validate(self.problem.space.names())?;
        let objective = &self.options.objective.metric;
        if objective != "time" && !self.problem.metrics.contains(objective) {
            return Err(TunerError::config(format!(
                "objective `{}` is neither `time` nor a declared metric",
                objective
            )));
        }
        FeasibilityFilter::new(
            device.clone(),
            &self.problem.problem_size,
            &self.problem.space,
            &self.options.block_size_names,
            &self.options.grid_div,
            &self.options.resources,
        )
    }

    fn log_result(&self, result: &BenchmarkResult, cached: bool) {
        let source = if cached { " (cached)" } else { "" };
        let line = match (result.skip_reason(), result.measurement()) {
            (Some(reason), _) => format!("skipped [{}]{}: {}", result.config, source, reason),
            (None, Some(m)) => {
                let mut s = format!("[{}]{}: {:.4} ms", result.config, source, m.time_ms);
                for (name, v) in m.metrics.iter() {
                    s.push_str(&format!(", {}={:.3}", name, v));
                }
                s
            }
            (None, None) => return,
        };
        if self.options.verbose {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }

    /// Run one tuning session on one backend.
    pub fn run<S: ResultStore>(&self, backend: &mut dyn Backend, store: S) -> Result<TuningReport> {
        let start = Instant::now();
        let device = backend.device().clone();
        let filter = self.validate(&device)?;
        let identity = self.problem_identity(&device);
        let executor = BenchmarkExecutor::new(
            &self.problem.kernel,
            &self.problem.args,
            &self.problem.metrics,
            &filter,
            self.options.iterations,
        );
        let mut session = Session {
            tuner: self,
            executor,
            identity,
            store,
            start,
            results: Vec::new(),
            skipped: BTreeMap::new(),
            evaluated: 0,
            cache_hits: 0,
            duplicates: 0,
        };

        let mut strategy = self.options.strategy.build();
        let (stop_reason, valid_configurations) = if strategy.is_sequential() {
            info!(
                "tuning {} on {} with {}: streaming {} candidate configurations",
                session.identity.kernel_name,
                device.name,
                strategy.name(),
                self.problem.space.cartesian_size()
            );
            self.sweep(&mut session, backend)?
        } else {
            self.search(&mut session, backend, strategy.as_mut())?
        };
        if stop_reason == StopReason::Completed && valid_configurations == 0 {
            warn!("restrictions leave no valid configuration");
        }

        let Session {
            identity,
            mut store,
            results,
            skipped,
            evaluated,
            cache_hits,
            duplicates,
            ..
        } = session;
        store.flush()?;
        let stats = RunStats {
            cartesian_size: self.problem.space.cartesian_size(),
            valid_configurations,
            evaluated,
            cache_hits,
            duplicates,
            skipped,
            elapsed_secs: start.elapsed().as_secs_f64(),
            stop_reason,
        };
        info!(
            "finished {} on {}: {} results, {} evaluated, {} cached, {} skipped ({})",
            identity.kernel_name,
            device.name,
            results.len(),
            stats.evaluated,
            stats.cache_hits,
            stats.total_skipped(),
            stats.stop_reason
        );

        Ok(TuningReport {
            environment: Environment::capture(
                device,
                backend.name(),
                self.options.iterations,
                strategy.name(),
            ),
            problem: identity,
            objective: self.options.objective.clone(),
            results,
            stats,
        })
    }

    /// Enumeration order straight from the lazy iterator. Returns the number
    /// of valid configurations reached.
    fn sweep<S: ResultStore>(
        &self,
        session: &mut Session<'_, S>,
        backend: &mut dyn Backend,
    ) -> Result<(StopReason, usize)> {
        let mut reached = 0;
        for config in self.problem.space.iter() {
            if let Some(reason) = session.stop_reason() {
                return Ok((reason, reached));
            }
            reached += 1;
            session.visit(backend, &config)?;
        }
        Ok((StopReason::Completed, reached))
    }

    /// Strategy-driven search over the materialised space.
    fn search<S: ResultStore>(
        &self,
        session: &mut Session<'_, S>,
        backend: &mut dyn Backend,
        strategy: &mut dyn SearchStrategy,
    ) -> Result<(StopReason, usize)> {
        let ctx = SearchContext::new(&self.problem.space);
        info!(
            "tuning {} on {} with {}: {} valid of {} configurations",
            session.identity.kernel_name,
            session.identity.device_name,
            strategy.name(),
            ctx.len(),
            self.problem.space.cartesian_size()
        );

        let max_streak = MIN_DUPLICATE_STREAK.max(ctx.len() * 10);
        let mut memo: HashMap<usize, Option<f64>> = HashMap::new();
        let mut streak = 0;

        let stop_reason = loop {
            if let Some(reason) = session.stop_reason() {
                break reason;
            }
            let Some(index) = strategy.next(&ctx) else {
                break StopReason::Completed;
            };

            if let Some(&score) = memo.get(&index) {
                strategy.observe(index, score);
                session.duplicates += 1;
                streak += 1;
                if memo.len() >= ctx.len() {
                    break StopReason::SpaceExhausted;
                }
                if streak >= max_streak {
                    break StopReason::Stalled;
                }
                continue;
            }
            streak = 0;

            let score = session.visit(backend, ctx.config(index))?;
            memo.insert(index, score);
            strategy.observe(index, score);
        };
        Ok((stop_reason, ctx.len()))
    }
}

/// Mutable state of one run on one backend.
struct Session<'a, S> {
    tuner: &'a Tuner,
    executor: BenchmarkExecutor<'a>,
    identity: ProblemIdentity,
    store: S,
    start: Instant,
    results: Vec<BenchmarkResult>,
    skipped: BTreeMap<String, usize>,
    evaluated: usize,
    cache_hits: usize,
    duplicates: usize,
}

impl<S: ResultStore> Session<'_, S> {
    /// Cancellation, time limit and evaluation budget, checked between
    /// configurations only.
    fn stop_reason(&self) -> Option<StopReason> {
        let budget = &self.tuner.options.budget;
        if self.tuner.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if budget
            .time_limit
            .is_some_and(|limit| self.start.elapsed() >= limit)
        {
            Some(StopReason::TimeLimit)
        } else if budget.max_fevals.is_some_and(|max| self.evaluated >= max) {
            Some(StopReason::MaxFevals)
        } else {
            None
        }
    }

    /// Cache lookup or benchmark for one configuration; returns its score.
    fn visit(&mut self, backend: &mut dyn Backend, config: &Configuration) -> Result<Option<f64>> {
        let tuner = self.tuner;
        let (result, cached) = match self.store.lookup(&self.identity, config) {
            Some(mut hit) => {
                self.cache_hits += 1;
                tuner.telemetry.record_cache_hit();
                // metrics may have changed since the entry was recorded
                if let Outcome::Measured(m) = &mut hit.outcome {
                    m.metrics = tuner
                        .problem
                        .metrics
                        .evaluate(config, m.time_ms, &m.geometry);
                }
                (hit, true)
            }
            None => {
                let t0 = Instant::now();
                let result = self.executor.evaluate(backend, config);
                self.evaluated += 1;
                if result.measurement().is_some() {
                    tuner
                        .telemetry
                        .record_evaluation(t0.elapsed().as_secs_f64() * 1e3, result.time_ms());
                }
                self.store.record(&self.identity, &result)?;
                (result, false)
            }
        };

        if let Some(reason) = result.skip_reason() {
            *self
                .skipped
                .entry(reason.category().to_string())
                .or_default() += 1;
            if !cached {
                tuner.telemetry.record_skip(reason);
            }
        }
        tuner.log_result(&result, cached);

        let score = tuner.options.objective.score(&result);
        self.results.push(result);
        Ok(score)
    }
}

/// One sequential session per backend, run in parallel across backends.
/// Reports come back in backend order.
pub fn tune_devices(
    tuner: &Tuner,
    backends: Vec<Box<dyn Backend>>,
    cache: &Mutex<ResultCache>,
) -> Vec<Result<TuningReport>> {
    backends
        .into_par_iter()
        .map(|mut backend| tuner.run(backend.as_mut(), cache))
        .collect()
}
