//! Device descriptors and the reproducibility environment record.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Launch limits and a coarse throughput model for one accelerator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub name: String,
    pub max_threads_per_block: u32,
    pub max_block_dims: [u32; 3],
    /// Bytes.
    pub max_shared_memory_per_block: u64,
    pub max_registers_per_block: u32,
    #[serde(default = "default_registers_per_thread")]
    pub max_registers_per_thread: u32,
    pub multiprocessor_count: u32,
    pub warp_size: u32,
    #[serde(default = "default_bandwidth")]
    pub memory_bandwidth_gbps: f64,
    #[serde(default = "default_gflops")]
    pub peak_gflops: f64,
}

fn default_registers_per_thread() -> u32 {
    255
}

fn default_bandwidth() -> f64 {
    500.0
}

fn default_gflops() -> f64 {
    10_000.0
}

impl DeviceProperties {
    pub fn rtx3070() -> Self {
        Self {
            name: "NVIDIA GeForce RTX 3070".to_string(),
            max_threads_per_block: 1024,
            max_block_dims: [1024, 1024, 64],
            max_shared_memory_per_block: 99 * 1024,
            max_registers_per_block: 65536,
            max_registers_per_thread: 255,
            multiprocessor_count: 46,
            warp_size: 32,
            memory_bandwidth_gbps: 448.0,
            peak_gflops: 20_300.0,
        }
    }

    pub fn a100() -> Self {
        Self {
            name: "NVIDIA A100-SXM4-40GB".to_string(),
            max_threads_per_block: 1024,
            max_block_dims: [1024, 1024, 64],
            max_shared_memory_per_block: 164 * 1024,
            max_registers_per_block: 65536,
            max_registers_per_thread: 255,
            multiprocessor_count: 108,
            warp_size: 32,
            memory_bandwidth_gbps: 1555.0,
            peak_gflops: 19_500.0,
        }
    }

    pub fn mi250() -> Self {
        Self {
            name: "AMD Instinct MI250X".to_string(),
            max_threads_per_block: 1024,
            max_block_dims: [1024, 1024, 1024],
            max_shared_memory_per_block: 64 * 1024,
            max_registers_per_block: 131072,
            max_registers_per_thread: 256,
            multiprocessor_count: 220,
            warp_size: 64,
            memory_bandwidth_gbps: 3277.0,
            peak_gflops: 47_900.0,
        }
    }

    /// The CPU seen as a device with one "thread block" per core.
    pub fn host() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            name: format!("host ({} {})", std::env::consts::OS, std::env::consts::ARCH),
            max_threads_per_block: 1024,
            max_block_dims: [1024, 1024, 64],
            max_shared_memory_per_block: 1024 * 1024,
            max_registers_per_block: u32::MAX,
            max_registers_per_thread: u32::MAX,
            multiprocessor_count: cores,
            warp_size: 1,
            memory_bandwidth_gbps: 50.0,
            peak_gflops: 100.0 * cores as f64,
        }
    }

    pub const PRESETS: [&'static str; 4] = ["rtx3070", "a100", "mi250", "host"];

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "rtx3070" => Some(Self::rtx3070()),
            "a100" => Some(Self::a100()),
            "mi250" | "mi250x" => Some(Self::mi250()),
            "host" | "cpu" => Some(Self::host()),
            _ => None,
        }
    }
}

/// Hardware and software identification stored with every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub device: DeviceProperties,
    pub backend: String,
    pub tuner_version: String,
    pub os: String,
    pub arch: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub iterations: usize,
    pub strategy: String,
}

impl Environment {
    pub fn capture(
        device: DeviceProperties,
        backend: &str,
        iterations: usize,
        strategy: &str,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            device,
            backend: backend.to_string(),
            tuner_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            timestamp,
            iterations,
            strategy: strategy.to_string(),
        }
    }
}
