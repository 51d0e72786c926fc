//! Deterministic performance-model backend.
//!
//! Estimates a launch time from the geometry (waves over the multiprocessors,
//! warp utilisation, tail effect), the bytes the buffer arguments move and a
//! per-configuration landscape factor, then adds seeded timing jitter. Useful
//! for dry runs of a job and for tests that count compiles and launches.

use super::{Backend, CompiledKernel, KernelArg, ResourceUsage};
use crate::device::DeviceProperties;
use crate::errors::{CompileError, LaunchError};
use crate::feasibility::LaunchGeometry;
use crate::kernel::PreparedKernel;
use crate::space::Configuration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

type FailureHook = Arc<dyn Fn(&Configuration) -> Option<String> + Send + Sync>;
type UsageModel = Arc<dyn Fn(&Configuration) -> ResourceUsage + Send + Sync>;

const LAUNCH_OVERHEAD_MS: f64 = 0.004;
const MAX_THREADS_PER_SM: u64 = 2048;
const MAX_BLOCKS_PER_SM: u64 = 16;

/// FNV-1a, stable across runs and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

pub struct SimulatedBackend {
    device: DeviceProperties,
    seed: u64,
    noise: f64,
    flops_per_thread: f64,
    compile_failure: Option<FailureHook>,
    launch_failure: Option<FailureHook>,
    usage: Option<UsageModel>,
    rngs: Vec<(u64, StdRng)>,
    compiles: usize,
    launches: usize,
}

impl SimulatedBackend {
    pub fn new(device: DeviceProperties) -> Self {
        Self {
            device,
            seed: 0,
            noise: 0.02,
            flops_per_thread: 2.0,
            compile_failure: None,
            launch_failure: None,
            usage: None,
            rngs: Vec::new(),
            compiles: 0,
            launches: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Relative timing jitter; 0 makes every sample identical.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.max(0.0);
        self
    }

    pub fn with_flops_per_thread(mut self, flops: f64) -> Self {
        self.flops_per_thread = flops.max(0.0);
        self
    }

    /// Fail compilation with the returned message for matching configurations.
    pub fn with_compile_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Configuration) -> Option<String> + Send + Sync + 'static,
    {
        self.compile_failure = Some(Arc::new(hook));
        self
    }

    pub fn with_launch_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Configuration) -> Option<String> + Send + Sync + 'static,
    {
        self.launch_failure = Some(Arc::new(hook));
        self
    }

    /// Register and static shared memory usage reported after compilation.
    pub fn with_resource_usage<F>(mut self, model: F) -> Self
    where
        F: Fn(&Configuration) -> ResourceUsage + Send + Sync + 'static,
    {
        self.usage = Some(Arc::new(model));
        self
    }

    pub fn compile_count(&self) -> usize {
        self.compiles
    }

    pub fn launch_count(&self) -> usize {
        self.launches
    }

    /// Noise-free model time in milliseconds.
    pub fn model_time_ms(&self, kernel: &CompiledKernel, geometry: &LaunchGeometry, args: &[KernelArg]) -> f64 {
        let dev = &self.device;
        let warp = dev.warp_size.max(1) as u64;
        let threads = geometry.threads_per_block().max(1);
        let warps = threads.div_ceil(warp);
        let warp_efficiency = threads as f64 / (warps * warp) as f64;

        let per_sm = (MAX_THREADS_PER_SM / threads).clamp(1, MAX_BLOCKS_PER_SM);
        let slots = per_sm * dev.multiprocessor_count.max(1) as u64;
        let blocks = geometry.blocks().max(1);
        let waves = blocks.div_ceil(slots);
        let tail_efficiency = blocks as f64 / (waves * slots) as f64;
        // small blocks cannot hide latency
        let occupancy = ((per_sm * threads) as f64 / MAX_THREADS_PER_SM as f64).min(1.0);

        let bytes: u64 = args.iter().map(KernelArg::bytes).sum();
        let memory_ms = bytes as f64 / (dev.memory_bandwidth_gbps * 1e9) * 1e3;
        let compute_ms = geometry.total_threads() as f64 * self.flops_per_thread
            / (dev.peak_gflops * 1e9)
            * 1e3;

        let efficiency = warp_efficiency * tail_efficiency.max(0.05) * occupancy.max(0.05).sqrt();
        let landscape = self.landscape(&kernel.config);
        LAUNCH_OVERHEAD_MS + memory_ms.max(compute_ms) / efficiency * landscape
    }

    /// Fixed factor in [0.85, 1.15) per configuration, seeded.
    fn landscape(&self, config: &Configuration) -> f64 {
        let h = fnv1a(config.key().as_bytes()) ^ self.seed.rotate_left(17);
        let unit = (h >> 11) as f64 / (1u64 << 53) as f64;
        0.85 + 0.3 * unit
    }

    fn rng_for(&mut self, handle: u64) -> &mut StdRng {
        let pos = match self.rngs.iter().position(|(h, _)| *h == handle) {
            Some(pos) => pos,
            None => {
                let rng = StdRng::seed_from_u64(self.seed ^ handle);
                self.rngs.push((handle, rng));
                self.rngs.len() - 1
            }
        };
        &mut self.rngs[pos].1
    }
}

impl Backend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn device(&self) -> &DeviceProperties {
        &self.device
    }

    fn compile(&mut self, kernel: &PreparedKernel) -> Result<CompiledKernel, CompileError> {
        self.compiles += 1;
        if let Some(hook) = &self.compile_failure {
            if let Some(message) = hook(&kernel.config) {
                return Err(CompileError::new(&kernel.name, message));
            }
        }
        let resources = match &self.usage {
            Some(model) => model(&kernel.config),
            None => ResourceUsage {
                registers_per_thread: 32,
                static_shared_memory: 0,
            },
        };
        Ok(CompiledKernel {
            name: kernel.name.clone(),
            handle: fnv1a(kernel.source.as_bytes()),
            config: kernel.config.clone(),
            resources,
        })
    }

    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        geometry: &LaunchGeometry,
        args: &[KernelArg],
    ) -> Result<Duration, LaunchError> {
        self.launches += 1;
        if let Some(hook) = &self.launch_failure {
            if let Some(message) = hook(&kernel.config) {
                return Err(LaunchError::new(&kernel.name, message));
            }
        }
        let base = self.model_time_ms(kernel, geometry, args);
        let noise = self.noise;
        let jitter = if noise > 0.0 {
            self.rng_for(kernel.handle).gen_range(-noise..noise)
        } else {
            0.0
        };
        let ms = (base * (1.0 + jitter)).max(1e-6);
        Ok(Duration::from_secs_f64(ms / 1e3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelSource;

    fn kernel(bx: i64) -> PreparedKernel {
        let src = KernelSource::from_string("k", "__global__ void k() {}").unwrap();
        let cfg = Configuration::from_pairs([("block_size_x", bx)]);
        src.prepare(&cfg, &geometry(bx as u32))
    }

    fn geometry(bx: u32) -> LaunchGeometry {
        LaunchGeometry {
            block: [bx, 1, 1],
            grid: [(1u64 << 20).div_ceil(bx as u64), 1, 1],
            shared_memory: 0,
        }
    }

    #[test]
    fn timings_are_reproducible_for_a_seed() {
        let args = [KernelArg::buffer_f32(1 << 20), KernelArg::buffer_f32(1 << 20)];
        let run = |seed| {
            let mut b = SimulatedBackend::new(DeviceProperties::a100()).with_seed(seed);
            let k = b.compile(&kernel(128)).unwrap();
            (0..5)
                .map(|_| b.launch(&k, &geometry(128), &args).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(3), run(3));
        assert_ne!(run(3), run(4));
    }

    #[test]
    fn partial_warps_are_slower() {
        let b = SimulatedBackend::new(DeviceProperties::rtx3070()).with_noise(0.0);
        let args = [KernelArg::buffer_f32(1 << 24)];
        let full = CompiledKernel {
            name: "k".into(),
            handle: 1,
            config: Configuration::from_pairs([("x", 1)]),
            resources: ResourceUsage::default(),
        };
        let t_full = b.model_time_ms(&full, &geometry(256), &args);
        let t_partial = b.model_time_ms(&full, &geometry(33), &args);
        assert!(t_partial > t_full);
    }

    #[test]
    fn failure_hooks_and_counters() {
        let mut b = SimulatedBackend::new(DeviceProperties::a100())
            .with_compile_failure(|c| (c.get_i64("block_size_x") == Some(64)).then(|| "ptxas error".into()));
        assert!(b.compile(&kernel(64)).is_err());
        assert!(b.compile(&kernel(128)).is_ok());
        assert_eq!(b.compile_count(), 2);
        assert_eq!(b.launch_count(), 0);
    }
}
