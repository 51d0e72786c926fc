//! # ktuner
//!
//! Search-space exploration, feasibility filtering, benchmarking and result
//! caching for GPU kernel auto-tuning.
//!
//! ## Architecture
//!
//! - **Configuration space**: ordered parameters and candidate values, pruned by
//!   restriction expressions or typed predicates, enumerated lazily
//! - **Feasibility filter**: launch geometry by grid-divisor ceiling division,
//!   device limits checked before anything is compiled
//! - **Benchmark executor**: `#define` substitution, compile once, N timed
//!   launches, ordered derived metrics
//! - **Search strategies**: brute force, random sample, genetic algorithm,
//!   simulated annealing, multi-start local search; all seeded
//! - **Result cache**: append-only JSON Lines keyed by problem identity and
//!   configuration, resumable after a crash

pub mod backend;
pub mod benchmark;
pub mod cache;
pub mod device;
pub mod errors;
pub mod expr;
pub mod feasibility;
pub mod job;
pub mod kernel;
pub mod monitoring;
pub mod report;
pub mod space;
pub mod strategy;
pub mod tuner;

pub use backend::{Backend, CompiledKernel, HostBackend, KernelArg, ResourceUsage, SimulatedBackend};
pub use benchmark::{
    BenchmarkExecutor, BenchmarkResult, Direction, Measurement, MetricScope, Metrics, Objective,
    Outcome,
};
pub use cache::{ProblemIdentity, ResultCache, ResultStore};
pub use device::{DeviceProperties, Environment};
pub use errors::{CompileError, LaunchError, TunerError};
pub use expr::{Expr, ExprError, Value};
pub use feasibility::{
    ceil_div, FeasibilityFilter, GridDivisors, LaunchGeometry, ProblemSize, ResourceModel,
    SkipReason,
};
pub use job::TuningJob;
pub use kernel::{KernelSource, PreparedKernel};
pub use monitoring::TuningTelemetry;
pub use report::{format_report, RunStats, StopReason, TuningReport};
pub use space::{Configuration, ParamValue, ParameterSpace, Restriction, SearchSpace};
pub use strategy::{SearchContext, SearchStrategy, StrategyConfig};
pub use tuner::{tune_devices, Budget, CancelToken, Tuner, TuningOptions, TuningProblem};
