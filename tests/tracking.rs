use memscope::collectors::gpu::{
    ComputeApps, GpuTool, NvidiaSmi, parse_compute_apps, parse_gpu_list,
};
use memscope::collectors::process::ProcessTable;
use memscope::error::ToolError;
use memscope::metrics::GpuInfo;
use memscope::{
    Collector, GpuBackend, MemoryField, ProcessTarget, TrackGuard, TrackerConfig, track_peak_memory,
};
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Pretends the current process holds memory on two GPUs.
struct TwoGpuTool {
    pid: u32,
}

impl GpuTool for TwoGpuTool {
    fn name(&self) -> &str {
        "two-gpus"
    }

    fn list_gpus(&self) -> Result<Vec<GpuInfo>, ToolError> {
        Ok(parse_gpu_list(
            "GPU 1: Tesla V100 (UUID: GPU-bbbb)\nGPU 0: Tesla V100 (UUID: GPU-aaaa)\n",
        ))
    }

    fn compute_apps(&self) -> Result<ComputeApps, ToolError> {
        let output = format!(
            "{pid}, Tesla V100, GPU-aaaa, python, 300\n\
             {pid}, Tesla V100, GPU-bbbb, python, 200\n\
             1, Tesla V100, GPU-aaaa, someone-else, 9000\n",
            pid = self.pid
        );
        Ok(parse_compute_apps(&output))
    }
}

#[test]
fn missing_gpu_tool_gives_cpu_only_report() {
    let tool = Arc::new(NvidiaSmi::with_program("/nonexistent/nvidia-smi"));
    let collector = Collector::new(ProcessTarget::CurrentTree, MemoryField::Rss, tool);

    let guard = TrackGuard::with_source("cpu-only", collector, Duration::from_millis(5)).unwrap();
    thread::sleep(Duration::from_millis(30));
    let report = guard.finish();

    assert!(report.samples >= 1);
    assert!(report.peak_cpu_memory_mb > 0.0);
    assert_eq!(report.peak_gpu_total_memory_mb, 0.0);
    assert!(report.peak_gpu_memory_mb_by_gpu.is_empty());
}

#[test]
fn one_pid_on_two_gpus() {
    let pid = std::process::id();
    let tool = Arc::new(TwoGpuTool { pid });
    let mut collector = Collector::new(ProcessTarget::Fixed(vec![pid]), MemoryField::Rss, tool);

    let snapshot = collector.take_snapshot();
    assert_eq!(snapshot.gpu_total_mem, 500.0);
    assert_eq!(snapshot.per_gpu_mem, BTreeMap::from([(0, 300.0), (1, 200.0)]));
    assert_eq!(snapshot.unresolved_gpu_mem, 0.0);
    assert_eq!(snapshot.per_pid[&pid].gpu_mem, 500.0);
    assert!(!snapshot.per_pid.contains_key(&1));
    assert!(collector.registry().is_loaded());
}

#[test]
fn peak_sees_a_large_allocation() {
    let config = TrackerConfig {
        interval: Duration::from_millis(5),
        backend: GpuBackend::Disabled,
        ..TrackerConfig::default()
    };

    let (len, report) = track_peak_memory("allocate", &config, || {
        let buffer = std::hint::black_box(vec![1u8; 128 << 20]);
        thread::sleep(Duration::from_millis(200));
        buffer.len()
    })
    .unwrap();

    assert_eq!(len, 128 << 20);
    assert!(report.peak_cpu_memory_mb >= 100.0, "peak was {}", report.peak_cpu_memory_mb);
}

#[test]
fn child_processes_are_part_of_the_tree() {
    let mut child = Command::new("sleep").arg("5").spawn().unwrap();
    let child_pid = child.id();

    let mut table = ProcessTable::new();
    table.refresh(&ProcessTarget::CurrentTree);
    let own_tree = table.enumerate(&ProcessTarget::CurrentTree);
    let child_tree = table.enumerate(&ProcessTarget::Trees(vec![child_pid]));

    child.kill().unwrap();
    child.wait().unwrap();

    assert!(own_tree.contains(&std::process::id()));
    assert!(own_tree.contains(&child_pid));
    assert!(child_tree.contains(&child_pid));
    assert!(!child_tree.contains(&std::process::id()));
}

#[test]
fn nonexistent_explicit_pid_does_not_fail_the_session() {
    let target = ProcessTarget::from_pid_list("4294967294", memscope::TargetMode::Fixed).unwrap();
    let mut collector = Collector::new(target, MemoryField::Rss, GpuBackend::Disabled.build());

    let snapshot = collector.take_snapshot();
    assert_eq!(snapshot.cpu_mem, 0.0);
    assert_eq!(snapshot.vanished_pids, 1);
}

#[test]
fn exports_json_report_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrackerConfig {
        interval: Duration::from_millis(5),
        backend: GpuBackend::Disabled,
        export_dir: Some(dir.path().to_path_buf()),
        export_prefix: Some("exp1".to_string()),
        ..TrackerConfig::default()
    };

    let ((), report) =
        track_peak_memory("main", &config, || thread::sleep(Duration::from_millis(20))).unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    let file_name = entries[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with("exp1_main_memory_metrics_"));
    assert!(file_name.ends_with(".json"));

    let contents = std::fs::read_to_string(&entries[0]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(value["function_name"], "main");
    assert_eq!(value["peak_cpu_memory_MB"], report.peak_cpu_memory_mb);
    assert_eq!(value["peak_gpu_total_memory_MB"], 0.0);
}
