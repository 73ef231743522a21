pub mod cpu;
pub mod gpu;
pub mod process;
pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;
use crate::collectors::cpu::{MemoryField, read_memory_mb};
use crate::collectors::gpu::{GpuReading, GpuTool, GpuUsageQuerier};
use crate::collectors::process::{ProcessTable, ProcessTarget};
use crate::collectors::registry::GpuRegistry;
use crate::metrics::{GpuIndex, Pid, ProcessMemory, Snapshot};
use crate::sampler::SnapshotSource;

/// Combines one moment's readings into a snapshot.
///
/// `per_gpu_mem` gets one entry per index in `known_gpus`, zero when no row
/// used that GPU. Rows without a resolved index go to the unresolved bucket,
/// so `gpu_total_mem` always equals the per-GPU sum plus that bucket.
/// `per_pid` keeps each process's share of both totals.
pub fn aggregate(
    cpu_readings: &[(Pid, f64)],
    gpu: &GpuReading,
    known_gpus: &[GpuIndex],
    vanished_pids: usize,
) -> Snapshot {
    let mut per_gpu_mem: BTreeMap<GpuIndex, f64> =
        known_gpus.iter().map(|&index| (index, 0.0)).collect();
    let mut unresolved_gpu_mem = 0.0;
    let mut per_pid: BTreeMap<Pid, ProcessMemory> = BTreeMap::new();

    for &(pid, mb) in cpu_readings {
        per_pid.entry(pid).or_default().cpu_mem += mb;
    }

    for usage in &gpu.usage {
        match usage.gpu_index {
            Some(index) => *per_gpu_mem.entry(index).or_insert(0.0) += usage.used_memory_mb,
            None => unresolved_gpu_mem += usage.used_memory_mb,
        }
        per_pid.entry(usage.pid).or_default().gpu_mem += usage.used_memory_mb;
    }

    Snapshot {
        cpu_mem: cpu_readings.iter().map(|&(_, mb)| mb).sum(),
        gpu_total_mem: gpu.usage.iter().map(|u| u.used_memory_mb).sum(),
        per_gpu_mem,
        per_pid,
        unresolved_gpu_mem,
        malformed_rows: gpu.malformed_rows,
        vanished_pids,
    }
}

/// Takes live snapshots of a process target: CPU memory from the process
/// table and GPU memory from a [`GpuTool`].
pub struct Collector {
    target: ProcessTarget,
    field: MemoryField,
    processes: ProcessTable,
    gpu: GpuUsageQuerier,
}

impl Collector {
    pub fn new(target: ProcessTarget, field: MemoryField, tool: Arc<dyn GpuTool>) -> Self {
        let registry = Arc::new(GpuRegistry::new(tool.clone()));
        Self::with_registry(target, field, tool, registry)
    }

    /// Like [`Collector::new`] but resolving uuids through a caller-owned registry.
    pub fn with_registry(
        target: ProcessTarget,
        field: MemoryField,
        tool: Arc<dyn GpuTool>,
        registry: Arc<GpuRegistry>,
    ) -> Self {
        Self {
            target,
            field,
            processes: ProcessTable::new(),
            gpu: GpuUsageQuerier::new(tool, registry),
        }
    }

    pub fn registry(&self) -> &Arc<GpuRegistry> {
        self.gpu.registry()
    }

    pub fn take_snapshot(&mut self) -> Snapshot {
        self.processes.refresh(&self.target);
        let pids = self.processes.enumerate(&self.target);

        let mut cpu_readings = Vec::with_capacity(pids.len());
        let mut vanished = 0;
        for &pid in &pids {
            match read_memory_mb(self.processes.system(), pid, self.field) {
                Ok(mb) => cpu_readings.push((pid, mb)),
                Err(e) => {
                    trace!("skipping pid {}: {}", pid, e);
                    vanished += 1;
                }
            }
        }

        let gpu = self.gpu.query(&pids);
        let known_gpus = self.gpu.registry().known_indices();
        aggregate(&cpu_readings, &gpu, &known_gpus, vanished)
    }
}

impl SnapshotSource for Collector {
    fn take_snapshot(&mut self) -> Snapshot {
        Collector::take_snapshot(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::gpu::NvidiaSmi;
    use crate::metrics::GpuUsage;

    fn usage(pid: u32, gpu_index: Option<GpuIndex>, mb: f64) -> GpuUsage {
        GpuUsage { pid, gpu_index, used_memory_mb: mb }
    }

    #[test]
    fn same_pid_on_two_gpus() {
        let gpu = GpuReading {
            usage: vec![usage(10, Some(0), 512.0), usage(10, Some(1), 256.0)],
            malformed_rows: 0,
        };
        let snapshot = aggregate(&[(10, 100.0)], &gpu, &[0, 1], 0);

        assert_eq!(snapshot.gpu_total_mem, 768.0);
        assert_eq!(snapshot.per_gpu_mem, BTreeMap::from([(0, 512.0), (1, 256.0)]));
    }

    #[test]
    fn zero_fills_idle_gpus() {
        let gpu = GpuReading {
            usage: vec![usage(10, Some(2), 8.0)],
            malformed_rows: 0,
        };
        let snapshot = aggregate(&[], &gpu, &[0, 1, 2], 0);

        assert_eq!(snapshot.per_gpu_mem, BTreeMap::from([(0, 0.0), (1, 0.0), (2, 8.0)]));
        assert_eq!(snapshot.cpu_mem, 0.0);
    }

    #[test]
    fn total_is_per_gpu_plus_unresolved() {
        let gpu = GpuReading {
            usage: vec![
                usage(1, Some(0), 10.0),
                usage(2, None, 5.5),
                usage(3, Some(1), 20.0),
                usage(3, None, 1.5),
            ],
            malformed_rows: 3,
        };
        let snapshot = aggregate(&[(1, 1.0), (2, 2.0), (3, 3.5)], &gpu, &[0, 1], 2);

        let per_gpu: f64 = snapshot.per_gpu_mem.values().sum();
        assert_eq!(snapshot.gpu_total_mem, per_gpu + snapshot.unresolved_gpu_mem);
        assert_eq!(snapshot.unresolved_gpu_mem, 7.0);
        assert_eq!(snapshot.cpu_mem, 6.5);
        assert_eq!(snapshot.malformed_rows, 3);
        assert_eq!(snapshot.vanished_pids, 2);
    }

    #[test]
    fn keeps_each_process_share() {
        let gpu = GpuReading {
            usage: vec![
                usage(10, Some(0), 512.0),
                usage(10, None, 64.0),
                usage(11, Some(1), 32.0),
            ],
            malformed_rows: 0,
        };
        let snapshot = aggregate(&[(10, 100.0), (12, 40.0)], &gpu, &[0, 1], 0);

        assert_eq!(
            snapshot.per_pid,
            BTreeMap::from([
                (10, ProcessMemory { cpu_mem: 100.0, gpu_mem: 576.0 }),
                (11, ProcessMemory { cpu_mem: 0.0, gpu_mem: 32.0 }),
                (12, ProcessMemory { cpu_mem: 40.0, gpu_mem: 0.0 }),
            ])
        );
        let cpu: f64 = snapshot.per_pid.values().map(|p| p.cpu_mem).sum();
        let gpu_mem: f64 = snapshot.per_pid.values().map(|p| p.gpu_mem).sum();
        assert_eq!(cpu, snapshot.cpu_mem);
        assert_eq!(gpu_mem, snapshot.gpu_total_mem);
    }

    #[test]
    fn collector_without_gpu_tool_reports_cpu_only() {
        let tool = Arc::new(NvidiaSmi::with_program("/nonexistent/nvidia-smi"));
        let mut collector = Collector::new(ProcessTarget::CurrentTree, MemoryField::Rss, tool);

        let snapshot = collector.take_snapshot();
        assert!(snapshot.cpu_mem > 0.0);
        assert_eq!(snapshot.gpu_total_mem, 0.0);
        assert!(snapshot.per_gpu_mem.is_empty());
    }

    #[test]
    fn vanished_pids_are_skipped() {
        let target = ProcessTarget::Fixed(vec![std::process::id(), u32::MAX - 1]);
        let tool = Arc::new(NvidiaSmi::with_program("/nonexistent/nvidia-smi"));
        let mut collector = Collector::new(target, MemoryField::Rss, tool);

        let snapshot = collector.take_snapshot();
        assert!(snapshot.cpu_mem > 0.0);
        assert_eq!(snapshot.vanished_pids, 1);
        assert!(snapshot.per_pid.contains_key(&std::process::id()));
        assert!(!snapshot.per_pid.contains_key(&(u32::MAX - 1)));
    }
}
