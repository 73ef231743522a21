use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

pub type Pid = u32;
pub type GpuIndex = u32;

/// Pids of the tracked work at one sampling moment.
pub type ProcessSet = HashSet<Pid>;

pub const BYTES_PER_MB: f64 = (1u64 << 20) as f64;

/// One physical device as reported by device enumeration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub index: GpuIndex,
    pub name: String,
    pub uuid: String,
}

/// One row of the compute-process query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeApp {
    pub pid: Pid,
    pub gpu_name: String,
    pub gpu_uuid: String,
    pub process_name: String,
    pub used_memory_mb: f64,
}

/// A compute-app row belonging to the tracked processes, with its GPU
/// index resolved. `gpu_index` is `None` when the uuid is unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuUsage {
    pub pid: Pid,
    pub gpu_index: Option<GpuIndex>,
    pub used_memory_mb: f64,
}

/// Memory one process held at a sampling moment, in MB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessMemory {
    pub cpu_mem: f64,
    /// Summed over every GPU the process used, resolved or not.
    pub gpu_mem: f64,
}

/// Memory readings for one sampling moment, all in MB.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub cpu_mem: f64,
    pub gpu_total_mem: f64,
    pub per_gpu_mem: BTreeMap<GpuIndex, f64>,
    /// Breakdown by process. Sums to `cpu_mem` and `gpu_total_mem`.
    pub per_pid: BTreeMap<Pid, ProcessMemory>,
    /// Memory on GPUs whose uuid the registry could not resolve.
    pub unresolved_gpu_mem: f64,
    pub malformed_rows: usize,
    pub vanished_pids: usize,
}

/// Running maxima over the snapshots of one sampling session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeakState {
    pub peak_cpu_mem: f64,
    pub peak_gpu_total_mem: f64,
    pub peak_per_gpu_mem: BTreeMap<GpuIndex, f64>,
    pub peak_unresolved_gpu_mem: f64,
    pub samples: u64,
    pub malformed_rows: u64,
}

impl PeakState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one snapshot into the maxima. Never decreases any peak.
    pub fn fold(&mut self, snapshot: &Snapshot) {
        self.peak_cpu_mem = self.peak_cpu_mem.max(snapshot.cpu_mem);
        self.peak_gpu_total_mem = self.peak_gpu_total_mem.max(snapshot.gpu_total_mem);
        self.peak_unresolved_gpu_mem = self
            .peak_unresolved_gpu_mem
            .max(snapshot.unresolved_gpu_mem);

        for (&index, &mem) in &snapshot.per_gpu_mem {
            let peak = self.peak_per_gpu_mem.entry(index).or_insert(0.0);
            *peak = peak.max(mem);
        }

        self.samples += 1;
        self.malformed_rows += snapshot.malformed_rows as u64;
    }
}
