use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use crate::error::ExportError;
use crate::metrics::{GpuIndex, PeakState};

/// Peak memory of one tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub function_name: String,
    #[serde(rename = "peak_cpu_memory_MB")]
    pub peak_cpu_memory_mb: f64,
    #[serde(rename = "peak_gpu_total_memory_MB")]
    pub peak_gpu_total_memory_mb: f64,
    #[serde(rename = "peak_gpu_memory_MB_by_gpu", skip_serializing_if = "BTreeMap::is_empty")]
    pub peak_gpu_memory_mb_by_gpu: BTreeMap<GpuIndex, f64>,
    pub samples: u64,
}

impl MemoryReport {
    pub fn new(function_name: &str, peaks: &PeakState) -> Self {
        Self {
            function_name: function_name.to_string(),
            peak_cpu_memory_mb: peaks.peak_cpu_mem,
            peak_gpu_total_memory_mb: peaks.peak_gpu_total_mem,
            peak_gpu_memory_mb_by_gpu: peaks.peak_per_gpu_mem.clone(),
            samples: peaks.samples,
        }
    }

    /// `[<prefix>_]<function_name>_memory_metrics_<timestamp>.json`
    pub fn file_name(&self, prefix: Option<&str>, timestamp: u64) -> String {
        match prefix {
            Some(prefix) => format!(
                "{}_{}_memory_metrics_{}.json",
                prefix, self.function_name, timestamp
            ),
            None => format!("{}_memory_metrics_{}.json", self.function_name, timestamp),
        }
    }

    /// Writes the report as pretty JSON into `output_folder`, creating it if
    /// needed, and returns the file path.
    pub fn write_json(
        &self,
        output_folder: &Path,
        prefix: Option<&str>,
    ) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(output_folder)?;

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let json_data = serde_json::to_string_pretty(self)?;
        let filepath = output_folder.join(self.file_name(prefix, timestamp));

        let mut file = fs::File::create(&filepath)?;
        file.write_all(json_data.as_bytes())?;

        Ok(filepath)
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Peak CPU Memory for {}: {:.2} MB",
            self.function_name, self.peak_cpu_memory_mb
        )?;
        write!(
            f,
            "Peak GPU Total Memory for {}: {:.2} MB",
            self.function_name, self.peak_gpu_total_memory_mb
        )?;
        for (index, mb) in &self.peak_gpu_memory_mb_by_gpu {
            write!(f, "\n  GPU {}: {:.2} MB", index, mb)?;
        }
        Ok(())
    }
}
