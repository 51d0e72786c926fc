//! JSON job files: the whole tuning invocation in one document.
//!
//! ```json
//! {
//!   "kernel": { "path": "vector_add.cu", "name": "vector_add" },
//!   "problem_size": 1000000,
//!   "arguments": [ { "type": "buffer", "elements": 1000000, "elem_bytes": 4 } ],
//!   "tune_params": [ { "name": "block_size_x", "values": [32, 64, 128, 256] } ],
//!   "restrictions": [ "block_size_x >= 64" ],
//!   "metrics": [ { "name": "gbs", "expr": "12e6 / (time / 1e3) / 1e9" } ],
//!   "strategy": { "name": "random_sample", "fraction": 0.5, "seed": 1 },
//!   "cache": "vector_add.cache.jsonl"
//! }
//! ```
//!
//! Relative paths resolve against the directory holding the job file.

use crate::backend::KernelArg;
use crate::benchmark::{Metrics, Objective, DEFAULT_ITERATIONS};
use crate::device::DeviceProperties;
use crate::errors::{Result, TunerError};
use crate::feasibility::{GridDivisors, ProblemSize, ResourceModel, DEFAULT_BLOCK_SIZE_NAMES};
use crate::kernel::KernelSource;
use crate::space::{ParameterSpace, Restriction, SearchSpace};
use crate::strategy::StrategyConfig;
use crate::tuner::{Budget, Tuner, TuningOptions, TuningProblem};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DEVICE: &str = "a100";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelRef {
    pub path: PathBuf,
    pub name: String,
}

/// A preset name or a full device description.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DeviceSpec {
    Preset(String),
    Properties(DeviceProperties),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobBudget {
    #[serde(default)]
    pub max_fevals: Option<usize>,
    #[serde(default)]
    pub time_limit_secs: Option<f64>,
}

fn default_iterations() -> usize {
    DEFAULT_ITERATIONS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TuningJob {
    pub kernel: KernelRef,
    pub problem_size: ProblemSize,
    #[serde(default)]
    pub arguments: Vec<KernelArg>,
    pub tune_params: ParameterSpace,
    #[serde(default)]
    pub grid_div_x: Option<Vec<String>>,
    #[serde(default)]
    pub grid_div_y: Option<Vec<String>>,
    #[serde(default)]
    pub grid_div_z: Option<Vec<String>>,
    #[serde(default)]
    pub block_size_names: Option<Vec<String>>,
    #[serde(default)]
    pub restrictions: Vec<String>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub cache: Option<PathBuf>,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub device: Option<DeviceSpec>,
    #[serde(default)]
    pub budget: JobBudget,
    /// Shared memory per block in bytes, as an expression.
    #[serde(default)]
    pub shared_memory: Option<String>,
    #[serde(default)]
    pub registers_per_thread: Option<String>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl TuningJob {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TunerError::config(format!("cannot read job file {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&text, base)
    }

    pub fn from_json(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut job: TuningJob = serde_json::from_str(text)?;
        job.base_dir = base_dir.into();
        Ok(job)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn kernel_source(&self) -> Result<KernelSource> {
        KernelSource::from_file(self.resolve(&self.kernel.path), &self.kernel.name)
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache.as_deref().map(|p| self.resolve(p))
    }

    pub fn device(&self) -> Result<DeviceProperties> {
        match &self.device {
            None => DeviceProperties::preset(DEFAULT_DEVICE)
                .ok_or_else(|| TunerError::config("default device preset missing")),
            Some(DeviceSpec::Preset(name)) => DeviceProperties::preset(name).ok_or_else(|| {
                TunerError::config(format!(
                    "unknown device preset `{}` (known: {})",
                    name,
                    DeviceProperties::PRESETS.join(", ")
                ))
            }),
            Some(DeviceSpec::Properties(props)) => Ok(props.clone()),
        }
    }

    pub fn space(&self) -> Result<SearchSpace> {
        let restrictions = self
            .restrictions
            .iter()
            .map(|r| Restriction::parse(r))
            .collect::<Result<Vec<_>>>()?;
        SearchSpace::new(self.tune_params.clone(), restrictions)
    }

    pub fn problem(&self) -> Result<TuningProblem> {
        Ok(TuningProblem::new(
            self.kernel_source()?,
            self.problem_size.clone(),
            self.space()?,
        )
        .with_args(self.arguments.clone())
        .with_metrics(self.metrics.clone()))
    }

    pub fn options(&self) -> Result<TuningOptions> {
        let mut block_size_names = DEFAULT_BLOCK_SIZE_NAMES.map(String::from);
        if let Some(names) = &self.block_size_names {
            if names.is_empty() || names.len() > 3 {
                return Err(TunerError::config(
                    "block_size_names must list 1 to 3 parameter names",
                ));
            }
            for (slot, name) in block_size_names.iter_mut().zip(names) {
                *slot = name.clone();
            }
        }
        let time_limit = match self.budget.time_limit_secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
            Some(secs) => {
                return Err(TunerError::config(format!(
                    "time_limit_secs must be a non-negative number, got {}",
                    secs
                )))
            }
            None => None,
        };
        Ok(TuningOptions {
            iterations: self.iterations,
            verbose: self.verbose,
            objective: self.objective.clone(),
            strategy: self.strategy.clone(),
            budget: Budget {
                max_fevals: self.budget.max_fevals,
                time_limit,
            },
            block_size_names,
            grid_div: GridDivisors {
                x: self.grid_div_x.clone(),
                y: self.grid_div_y.clone(),
                z: self.grid_div_z.clone(),
            },
            resources: ResourceModel {
                shared_memory: self.shared_memory.clone(),
                registers_per_thread: self.registers_per_thread.clone(),
            },
        })
    }

    pub fn tuner(&self) -> Result<Tuner> {
        Ok(Tuner::new(self.problem()?, self.options()?))
    }
}
