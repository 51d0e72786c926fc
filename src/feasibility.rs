//! Launch feasibility filter.
//!
//! Derives the launch geometry of a configuration (threads per block, blocks
//! per grid by ceiling division of the problem size) and rejects
//! configurations that exceed device limits before anything is compiled.
//! Rejections are values ([`SkipReason`]), never errors: tuning continues.

use crate::backend::ResourceUsage;
use crate::device::DeviceProperties;
use crate::errors::{Result, TunerError};
use crate::expr::{Expr, Scope, Value};
use crate::space::{Configuration, SearchSpace};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

pub const DEFAULT_BLOCK_SIZE_NAMES: [&str; 3] = ["block_size_x", "block_size_y", "block_size_z"];

/// Names visible to resource and metric expressions besides the parameters.
pub const GEOMETRY_VARIABLES: [&str; 8] = [
    "block_size_x",
    "block_size_y",
    "block_size_z",
    "grid_size_x",
    "grid_size_y",
    "grid_size_z",
    "threads_per_block",
    "blocks",
];

/// Number of blocks needed to cover `problem` items with `per_block` items each.
pub fn ceil_div(problem: u64, per_block: u64) -> u64 {
    problem.div_ceil(per_block.max(1))
}

/// Why a configuration was not measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "kebab-case")]
pub enum SkipReason {
    TooManyThreads { threads: u64, limit: u64 },
    TooMuchSharedMemory { bytes: u64, limit: u64 },
    TooManyRegisters { registers: u64, limit: u64 },
    InvalidGeometry { message: String },
    CompileError { message: String },
    LaunchError { message: String },
}

impl SkipReason {
    pub const CATEGORIES: [&'static str; 6] = [
        "too-many-threads",
        "too-much-shared-memory",
        "too-many-registers",
        "invalid-geometry",
        "compile-error",
        "launch-error",
    ];

    pub fn category(&self) -> &'static str {
        Self::CATEGORIES[self.category_index()]
    }

    pub fn category_index(&self) -> usize {
        match self {
            SkipReason::TooManyThreads { .. } => 0,
            SkipReason::TooMuchSharedMemory { .. } => 1,
            SkipReason::TooManyRegisters { .. } => 2,
            SkipReason::InvalidGeometry { .. } => 3,
            SkipReason::CompileError { .. } => 4,
            SkipReason::LaunchError { .. } => 5,
        }
    }

    /// True for rejections raised before compilation.
    pub fn is_feasibility(&self) -> bool {
        self.category_index() < 4
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooManyThreads { threads, limit } => {
                write!(f, "too-many-threads: {} > {}", threads, limit)
            }
            SkipReason::TooMuchSharedMemory { bytes, limit } => {
                write!(f, "too-much-shared-memory: {} B > {} B", bytes, limit)
            }
            SkipReason::TooManyRegisters { registers, limit } => {
                write!(f, "too-many-registers: {} > {}", registers, limit)
            }
            SkipReason::InvalidGeometry { message } => write!(f, "invalid-geometry: {}", message),
            SkipReason::CompileError { message } => write!(f, "compile-error: {}", message),
            SkipReason::LaunchError { message } => write!(f, "launch-error: {}", message),
        }
    }
}

/// Block and grid dimensions of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub block: [u32; 3],
    pub grid: [u64; 3],
    /// Dynamic shared memory requested at launch, in bytes.
    #[serde(default)]
    pub shared_memory: u64,
}

impl LaunchGeometry {
    pub fn threads_per_block(&self) -> u64 {
        self.block
            .iter()
            .fold(1u64, |acc, &b| acc.saturating_mul(b as u64))
    }

    pub fn blocks(&self) -> u64 {
        self.grid.iter().fold(1u64, |acc, &g| acc.saturating_mul(g))
    }

    pub fn total_threads(&self) -> u64 {
        self.threads_per_block().saturating_mul(self.blocks())
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let v = match name {
            "block_size_x" => self.block[0] as i64,
            "block_size_y" => self.block[1] as i64,
            "block_size_z" => self.block[2] as i64,
            "grid_size_x" => self.grid[0] as i64,
            "grid_size_y" => self.grid[1] as i64,
            "grid_size_z" => self.grid[2] as i64,
            "threads_per_block" => self.threads_per_block() as i64,
            "blocks" => self.blocks() as i64,
            _ => return None,
        };
        Some(Value::Int(v))
    }
}

impl fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid=({}, {}, {}) block=({}, {}, {})",
            self.grid[0], self.grid[1], self.grid[2], self.block[0], self.block[1], self.block[2]
        )
    }
}

/// One problem-size dimension: a fixed extent or an expression over parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDimension", into = "RawDimension")]
pub enum Dimension {
    Fixed(u64),
    Expr { source: String, expr: Expr },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawDimension {
    Fixed(u64),
    Expr(String),
}

impl TryFrom<RawDimension> for Dimension {
    type Error = TunerError;

    fn try_from(raw: RawDimension) -> Result<Self> {
        match raw {
            RawDimension::Fixed(n) => Ok(Dimension::Fixed(n)),
            RawDimension::Expr(s) => Dimension::parse(&s),
        }
    }
}

impl From<Dimension> for RawDimension {
    fn from(d: Dimension) -> Self {
        match d {
            Dimension::Fixed(n) => RawDimension::Fixed(n),
            Dimension::Expr { source, .. } => RawDimension::Expr(source),
        }
    }
}

impl Dimension {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(Dimension::Expr {
            source: source.to_string(),
            expr: Expr::parse(source)?,
        })
    }

    fn resolve(&self, config: &Configuration) -> std::result::Result<u64, String> {
        match self {
            Dimension::Fixed(n) => Ok(*n),
            Dimension::Expr { source, expr } => positive_integer(expr, config)
                .map_err(|e| format!("problem size `{}`: {}", source, e)),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Fixed(n) => write!(f, "{}", n),
            Dimension::Expr { source, .. } => write!(f, "{}", source),
        }
    }
}

impl From<u64> for Dimension {
    fn from(n: u64) -> Self {
        Dimension::Fixed(n)
    }
}

/// Problem extent in one to three dimensions.
///
/// In a job file this is a number, an expression string, or an array of up to
/// three of those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProblemSize", into = "Vec<Dimension>")]
pub struct ProblemSize {
    dims: Vec<Dimension>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawProblemSize {
    One(Dimension),
    Many(Vec<Dimension>),
}

impl TryFrom<RawProblemSize> for ProblemSize {
    type Error = TunerError;

    fn try_from(raw: RawProblemSize) -> Result<Self> {
        match raw {
            RawProblemSize::One(d) => ProblemSize::new(vec![d]),
            RawProblemSize::Many(dims) => ProblemSize::new(dims),
        }
    }
}

impl From<ProblemSize> for Vec<Dimension> {
    fn from(p: ProblemSize) -> Self {
        p.dims
    }
}

impl ProblemSize {
    pub fn new(dims: Vec<Dimension>) -> Result<Self> {
        if dims.is_empty() || dims.len() > 3 {
            return Err(TunerError::config(format!(
                "problem size must have 1 to 3 dimensions, got {}",
                dims.len()
            )));
        }
        if dims.iter().any(|d| matches!(d, Dimension::Fixed(0))) {
            return Err(TunerError::config("problem size dimensions must be >= 1"));
        }
        Ok(Self { dims })
    }

    pub fn d1(x: u64) -> Result<Self> {
        Self::new(vec![x.into()])
    }

    pub fn d2(x: u64, y: u64) -> Result<Self> {
        Self::new(vec![x.into(), y.into()])
    }

    pub fn d3(x: u64, y: u64, z: u64) -> Result<Self> {
        Self::new(vec![x.into(), y.into(), z.into()])
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = self
            .dims
            .iter()
            .filter_map(|d| match d {
                Dimension::Expr { expr, .. } => Some(expr.variables()),
                Dimension::Fixed(_) => None,
            })
            .flatten()
            .collect();
        vars.sort();
        vars.dedup();
        vars
    }

    /// Extents for x, y, z; missing dimensions are 1.
    pub fn resolve(&self, config: &Configuration) -> std::result::Result<[u64; 3], String> {
        let mut out = [1u64; 3];
        for (i, d) in self.dims.iter().enumerate() {
            out[i] = d.resolve(config)?;
        }
        Ok(out)
    }
}

impl fmt::Display for ProblemSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("x"))
    }
}

/// Per-dimension divisor expressions. `None` means "the block size parameter
/// of that dimension, or 1 if the space has none".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridDivisors {
    #[serde(default)]
    pub x: Option<Vec<String>>,
    #[serde(default)]
    pub y: Option<Vec<String>>,
    #[serde(default)]
    pub z: Option<Vec<String>>,
}

impl GridDivisors {
    pub fn x<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.x = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn y<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.y = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn z<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.z = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn get(&self, dim: usize) -> Option<&Vec<String>> {
        match dim {
            0 => self.x.as_ref(),
            1 => self.y.as_ref(),
            _ => self.z.as_ref(),
        }
    }
}

/// Optional per-configuration resource estimates, as expressions over the
/// parameters and the geometry variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceModel {
    /// Bytes of shared memory per block.
    #[serde(default)]
    pub shared_memory: Option<String>,
    #[serde(default)]
    pub registers_per_thread: Option<String>,
}

struct NamedExpr {
    source: String,
    expr: Expr,
}

impl NamedExpr {
    fn parse(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            expr: Expr::parse(source)?,
        })
    }
}

struct GeometryScope<'a> {
    config: &'a Configuration,
    geometry: &'a LaunchGeometry,
}

impl Scope for GeometryScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.geometry
            .lookup(name)
            .or_else(|| self.config.lookup(name))
    }
}

fn positive_integer(expr: &Expr, scope: &dyn Scope) -> std::result::Result<u64, String> {
    let v = expr.eval(scope).map_err(|e| e.to_string())?;
    match v.as_f64() {
        Some(x) if x >= 1.0 && x.is_finite() => Ok(x.ceil() as u64),
        Some(x) => Err(format!("evaluated to {}, expected a positive integer", x)),
        None => Err(format!("evaluated to `{}`, expected a number", v)),
    }
}

/// Checks configurations against device limits.
pub struct FeasibilityFilter {
    device: DeviceProperties,
    problem: ProblemSize,
    block_names: [String; 3],
    divisors: [Vec<NamedExpr>; 3],
    shared_memory: Option<NamedExpr>,
    registers: Option<NamedExpr>,
}

impl FeasibilityFilter {
    /// Validates every expression against the space's parameter names.
    pub fn new(
        device: DeviceProperties,
        problem: &ProblemSize,
        space: &SearchSpace,
        block_names: &[String; 3],
        grid_div: &GridDivisors,
        resources: &ResourceModel,
    ) -> Result<Self> {
        let params = space.names();
        let defined = |name: &str| params.iter().any(|p| p == name);

        for var in problem.variables() {
            if !defined(&var) {
                return Err(TunerError::config(format!(
                    "problem size references undefined parameter `{}`",
                    var
                )));
            }
        }

        let mut divisors: [Vec<NamedExpr>; 3] = Default::default();
        for (dim, slot) in divisors.iter_mut().enumerate() {
            match grid_div.get(dim) {
                Some(list) => {
                    for source in list {
                        let named = NamedExpr::parse(source)?;
                        for var in named.expr.variables() {
                            if !defined(&var) {
                                return Err(TunerError::config(format!(
                                    "grid divisor `{}` references undefined parameter `{}`",
                                    source, var
                                )));
                            }
                        }
                        slot.push(named);
                    }
                }
                None => {
                    if defined(&block_names[dim]) {
                        slot.push(NamedExpr::parse(&block_names[dim])?);
                    }
                }
            }
        }

        let parse_resource = |source: &Option<String>| -> Result<Option<NamedExpr>> {
            let Some(source) = source else {
                return Ok(None);
            };
            let named = NamedExpr::parse(source)?;
            for var in named.expr.variables() {
                if !defined(&var) && !GEOMETRY_VARIABLES.contains(&var.as_str()) {
                    return Err(TunerError::config(format!(
                        "resource expression `{}` references undefined name `{}`",
                        source, var
                    )));
                }
            }
            Ok(Some(named))
        };

        Ok(Self {
            shared_memory: parse_resource(&resources.shared_memory)?,
            registers: parse_resource(&resources.registers_per_thread)?,
            device,
            problem: problem.clone(),
            block_names: block_names.clone(),
            divisors,
        })
    }

    pub fn device(&self) -> &DeviceProperties {
        &self.device
    }

    fn block_dims(&self, config: &Configuration) -> std::result::Result<[u32; 3], SkipReason> {
        let mut block = [1u32; 3];
        for (i, name) in self.block_names.iter().enumerate() {
            let Some(value) = config.get(name) else {
                continue;
            };
            match value.as_i64() {
                Some(v) if v >= 1 => {
                    block[i] = u32::try_from(v).unwrap_or(u32::MAX);
                }
                _ => {
                    return Err(SkipReason::InvalidGeometry {
                        message: format!("{} = {} is not a positive integer", name, value),
                    })
                }
            }
        }
        Ok(block)
    }

    /// Geometry and pre-compilation limits for one configuration.
    pub fn check(&self, config: &Configuration) -> std::result::Result<LaunchGeometry, SkipReason> {
        let result = self.check_inner(config);
        if let Err(reason) = &result {
            debug!("feasibility reject [{}]: {}", config, reason);
        }
        result
    }

    fn check_inner(
        &self,
        config: &Configuration,
    ) -> std::result::Result<LaunchGeometry, SkipReason> {
        let block = self.block_dims(config)?;
        let threads = block
            .iter()
            .fold(1u64, |acc, &b| acc.saturating_mul(b as u64));
        let limit = self.device.max_threads_per_block as u64;
        if threads > limit {
            return Err(SkipReason::TooManyThreads { threads, limit });
        }
        for (b, max) in block.iter().zip(self.device.max_block_dims.iter()) {
            if b > max {
                return Err(SkipReason::TooManyThreads {
                    threads: *b as u64,
                    limit: *max as u64,
                });
            }
        }

        let extents = self
            .problem
            .resolve(config)
            .map_err(|message| SkipReason::InvalidGeometry { message })?;

        let mut grid = [1u64; 3];
        for dim in 0..3 {
            let mut product: u64 = 1;
            for d in &self.divisors[dim] {
                let v = positive_integer(&d.expr, config).map_err(|e| {
                    SkipReason::InvalidGeometry {
                        message: format!("grid divisor `{}`: {}", d.source, e),
                    }
                })?;
                product = product.saturating_mul(v);
            }
            grid[dim] = ceil_div(extents[dim], product);
        }

        let mut geometry = LaunchGeometry {
            block,
            grid,
            shared_memory: 0,
        };
        let scope = GeometryScope {
            config,
            geometry: &geometry,
        };

        let shared = match &self.shared_memory {
            Some(named) => Some(self.resource(named, &scope)?),
            None => None,
        };
        let registers = match &self.registers {
            Some(named) => Some(self.resource(named, &scope)?),
            None => None,
        };

        if let Some(bytes) = shared {
            self.check_shared_memory(bytes)?;
            geometry.shared_memory = bytes;
        }
        if let Some(regs) = registers {
            self.check_registers(regs, threads)?;
        }
        Ok(geometry)
    }

    fn resource(&self, named: &NamedExpr, scope: &dyn Scope) -> std::result::Result<u64, SkipReason> {
        let v = named
            .expr
            .eval_f64(scope)
            .map_err(|e| SkipReason::InvalidGeometry {
                message: format!("resource `{}`: {}", named.source, e),
            })?;
        if v < 0.0 || !v.is_finite() {
            return Err(SkipReason::InvalidGeometry {
                message: format!("resource `{}` evaluated to {}", named.source, v),
            });
        }
        Ok(v.ceil() as u64)
    }

    fn check_shared_memory(&self, bytes: u64) -> std::result::Result<(), SkipReason> {
        let limit = self.device.max_shared_memory_per_block;
        if bytes > limit {
            return Err(SkipReason::TooMuchSharedMemory { bytes, limit });
        }
        Ok(())
    }

    fn check_registers(&self, per_thread: u64, threads: u64) -> std::result::Result<(), SkipReason> {
        let per_thread_limit = self.device.max_registers_per_thread as u64;
        if per_thread > per_thread_limit {
            return Err(SkipReason::TooManyRegisters {
                registers: per_thread,
                limit: per_thread_limit,
            });
        }
        let total = per_thread.saturating_mul(threads);
        let limit = self.device.max_registers_per_block as u64;
        if total > limit {
            return Err(SkipReason::TooManyRegisters {
                registers: total,
                limit,
            });
        }
        Ok(())
    }

    /// Re-applies the shared memory and register limits to what the compiler
    /// actually reported.
    pub fn check_compiled(
        &self,
        geometry: &LaunchGeometry,
        usage: &ResourceUsage,
    ) -> std::result::Result<(), SkipReason> {
        self.check_shared_memory(usage.static_shared_memory + geometry.shared_memory)?;
        self.check_registers(usage.registers_per_thread as u64, geometry.threads_per_block())
    }
}
