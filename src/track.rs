//! Peak memory tracking around a unit of work.
//!
//! [`TrackGuard`] starts a sampler when created and stops it when finished
//! or dropped, so the report is produced on every exit path of the work,
//! including panics and early returns.

use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use crate::config::TrackerConfig;
use crate::error::SamplerError;
use crate::report::MemoryReport;
use crate::sampler::{Sampler, SnapshotSource};

pub struct TrackGuard {
    name: String,
    sampler: Sampler,
    export_dir: Option<PathBuf>,
    export_prefix: Option<String>,
    finished: bool,
}

impl TrackGuard {
    /// Starts sampling the processes described by `config`.
    pub fn start(name: &str, config: &TrackerConfig) -> Result<Self, SamplerError> {
        let mut guard = Self::with_source(name, config.collector(), config.interval)?;
        guard.export_dir = config.export_dir.clone();
        guard.export_prefix = config.export_prefix.clone();
        Ok(guard)
    }

    /// Starts sampling an arbitrary snapshot source.
    pub fn with_source(
        name: &str,
        source: impl SnapshotSource + 'static,
        interval: Duration,
    ) -> Result<Self, SamplerError> {
        let mut sampler = Sampler::new(source, interval);
        sampler.start()?;
        Ok(Self {
            name: name.to_string(),
            sampler,
            export_dir: None,
            export_prefix: None,
            finished: false,
        })
    }

    /// Stops sampling and returns the report.
    pub fn finish(mut self) -> MemoryReport {
        self.complete()
    }

    fn complete(&mut self) -> MemoryReport {
        self.finished = true;
        let peaks = match self.sampler.stop() {
            Ok(peaks) => peaks,
            Err(e) => {
                warn!("Sampler for {} did not stop cleanly: {}", self.name, e);
                self.sampler.peaks()
            }
        };

        let report = MemoryReport::new(&self.name, &peaks);
        info!(
            "Peak memory for {}: cpu {:.2} MB, gpu {:.2} MB over {} samples",
            report.function_name,
            report.peak_cpu_memory_mb,
            report.peak_gpu_total_memory_mb,
            report.samples
        );

        if let Some(dir) = &self.export_dir {
            match report.write_json(dir, self.export_prefix.as_deref()) {
                Ok(path) => info!("Report saved to: {}", path.display()),
                Err(e) => warn!("Failed to export report for {}: {}", self.name, e),
            }
        }
        report
    }
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.complete();
        }
    }
}

/// Runs `work` while sampling the memory described by `config`, and returns
/// its output together with the peak memory report.
///
/// Only a failure to start the sampler is returned as an error; GPU or
/// process errors during the run degrade the readings instead.
pub fn track_peak_memory<T>(
    name: &str,
    config: &TrackerConfig,
    work: impl FnOnce() -> T,
) -> Result<(T, MemoryReport), SamplerError> {
    let guard = TrackGuard::start(name, config)?;
    let output = work();
    Ok((output, guard.finish()))
}
