//! Peak CPU and GPU memory tracking for a unit of work and its process tree.
//!
//! A background [`sampler::Sampler`] periodically reads the resident memory
//! of every process in the tracked tree and the GPU memory those processes
//! hold, and keeps the running maxima. [`track_peak_memory`] wraps a closure
//! with a sampler and returns a [`MemoryReport`].

pub mod collectors;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mode;
pub mod report;
pub mod sampler;
pub mod track;

pub use collectors::Collector;
pub use collectors::cpu::MemoryField;
pub use collectors::process::ProcessTarget;
pub use config::{GpuBackend, TrackerConfig};
pub use metrics::{PeakState, Snapshot};
pub use mode::TargetMode;
pub use report::MemoryReport;
pub use sampler::{Sampler, SamplerState, SnapshotSource};
pub use track::{TrackGuard, track_peak_memory};
