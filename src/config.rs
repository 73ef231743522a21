use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use crate::collectors::Collector;
use crate::collectors::cpu::MemoryField;
use crate::collectors::gpu::{GpuTool, NoGpu, NvidiaSmi, NvmlTool};
use crate::collectors::process::ProcessTarget;
use crate::sampler::DEFAULT_INTERVAL;

/// Where GPU memory readings come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum GpuBackend {
    /// Run the `nvidia-smi` command line tool.
    #[default]
    NvidiaSmi,
    /// Query the driver through NVML.
    Nvml,
    /// Track CPU memory only.
    Disabled,
}

impl GpuBackend {
    pub fn build(self) -> Arc<dyn GpuTool> {
        match self {
            GpuBackend::NvidiaSmi => Arc::new(NvidiaSmi::new()),
            GpuBackend::Nvml => match NvmlTool::init() {
                Ok(tool) => Arc::new(tool),
                Err(e) => {
                    warn!("Failed to initialize NVML: {}", e);
                    warn!("GPU monitoring will not be available");
                    Arc::new(NoGpu)
                }
            },
            GpuBackend::Disabled => Arc::new(NoGpu),
        }
    }
}

/// Settings for one tracking session.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub interval: Duration,
    pub target: ProcessTarget,
    pub memory_field: MemoryField,
    pub backend: GpuBackend,
    /// Folder the report is written to as JSON when the session ends.
    pub export_dir: Option<PathBuf>,
    pub export_prefix: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            target: ProcessTarget::CurrentTree,
            memory_field: MemoryField::Rss,
            backend: GpuBackend::NvidiaSmi,
            export_dir: None,
            export_prefix: None,
        }
    }
}

impl TrackerConfig {
    /// Builds a collector with a fresh GPU registry.
    pub fn collector(&self) -> Collector {
        Collector::new(self.target.clone(), self.memory_field, self.backend.build())
    }
}
