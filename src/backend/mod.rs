//! Accelerator driver interface.
//!
//! The tuner never talks to a device directly. A [`Backend`] compiles a
//! [`PreparedKernel`] and times launches of the result; its failures are
//! per-configuration and come back as [`CompileError`] / [`LaunchError`].

mod host;
mod simulated;

pub use host::HostBackend;
pub use simulated::SimulatedBackend;

use crate::device::DeviceProperties;
use crate::errors::{CompileError, LaunchError};
use crate::feasibility::LaunchGeometry;
use crate::kernel::PreparedKernel;
use crate::space::Configuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resources the compiler reports for a kernel build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub registers_per_thread: u32,
    /// Bytes.
    pub static_shared_memory: u64,
}

/// Handle to a compiled kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledKernel {
    pub name: String,
    pub handle: u64,
    pub config: Configuration,
    pub resources: ResourceUsage,
}

/// One kernel argument, matching the kernel's call signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelArg {
    Int { value: i64 },
    Float { value: f64 },
    Buffer { elements: u64, elem_bytes: u32 },
}

impl KernelArg {
    pub fn buffer_f32(elements: u64) -> Self {
        KernelArg::Buffer {
            elements,
            elem_bytes: 4,
        }
    }

    /// Bytes moved through device memory when the argument is a buffer.
    pub fn bytes(&self) -> u64 {
        match self {
            KernelArg::Buffer {
                elements,
                elem_bytes,
            } => elements.saturating_mul(*elem_bytes as u64),
            _ => 0,
        }
    }
}

pub trait Backend: Send {
    fn name(&self) -> &str;

    fn device(&self) -> &DeviceProperties;

    fn compile(&mut self, kernel: &PreparedKernel) -> Result<CompiledKernel, CompileError>;

    /// Run the kernel once and return the device time of that launch.
    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        geometry: &LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<Duration, LaunchError>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn device(&self) -> &DeviceProperties {
        (**self).device()
    }

    fn compile(&mut self, kernel: &PreparedKernel) -> Result<CompiledKernel, CompileError> {
        (**self).compile(kernel)
    }

    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        geometry: &LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<Duration, LaunchError> {
        (**self).launch(kernel, geometry, args)
    }
}
