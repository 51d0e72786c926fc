//! CPU backend: "kernels" are Rust closures timed with `Instant`.

use super::{Backend, CompiledKernel, KernelArg, ResourceUsage};
use crate::device::DeviceProperties;
use crate::errors::{CompileError, LaunchError};
use crate::feasibility::LaunchGeometry;
use crate::kernel::PreparedKernel;
use crate::space::Configuration;
use std::time::{Duration, Instant};

type HostKernel =
    dyn FnMut(&Configuration, &LaunchGeometry, &[KernelArg]) -> Result<(), String> + Send;

/// Runs a closure parameterised by the configuration and launch geometry.
pub struct HostBackend {
    device: DeviceProperties,
    kernel: Box<HostKernel>,
    next_handle: u64,
}

impl HostBackend {
    pub fn new<F>(kernel: F) -> Self
    where
        F: FnMut(&Configuration, &LaunchGeometry, &[KernelArg]) -> Result<(), String>
            + Send
            + 'static,
    {
        Self {
            device: DeviceProperties::host(),
            kernel: Box::new(kernel),
            next_handle: 0,
        }
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn device(&self) -> &DeviceProperties {
        &self.device
    }

    fn compile(&mut self, kernel: &PreparedKernel) -> Result<CompiledKernel, CompileError> {
        if kernel.config.is_empty() {
            return Err(CompileError::new(&kernel.name, "empty configuration"));
        }
        self.next_handle += 1;
        Ok(CompiledKernel {
            name: kernel.name.clone(),
            handle: self.next_handle,
            config: kernel.config.clone(),
            resources: ResourceUsage::default(),
        })
    }

    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        geometry: &LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<Duration, LaunchError> {
        let t0 = Instant::now();
        (self.kernel)(&kernel.config, geometry, args)
            .map_err(|message| LaunchError::new(&kernel.name, message))?;
        Ok(t0.elapsed())
    }
}
