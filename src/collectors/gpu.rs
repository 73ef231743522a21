use nvml_wrapper::Nvml;
use nvml_wrapper::enums::device::UsedGpuMemory;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use crate::collectors::registry::GpuRegistry;
use crate::error::{MalformedRow, ToolError};
use crate::metrics::{BYTES_PER_MB, ComputeApp, GpuIndex, GpuInfo, GpuUsage, Pid, ProcessSet};

/// A source of GPU device and compute-process information.
pub trait GpuTool: Send + Sync {
    fn name(&self) -> &str;

    /// Lists every device with its index, name and uuid.
    fn list_gpus(&self) -> Result<Vec<GpuInfo>, ToolError>;

    /// Lists the processes currently holding device memory.
    fn compute_apps(&self) -> Result<ComputeApps, ToolError>;
}

/// Output of a compute-process query: parsed rows plus the rows that failed to parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeApps {
    pub rows: Vec<ComputeApp>,
    pub malformed: Vec<MalformedRow>,
}

const LIST_GPUS_ARGS: &[&str] = &["--list-gpus"];
const QUERY_COMPUTE_APPS_ARGS: &[&str] = &[
    "--query-compute-apps=pid,gpu_name,gpu_uuid,process_name,used_memory",
    "--format=csv,nounits,noheader",
];

/// Queries devices through the `nvidia-smi` command line tool.
pub struct NvidiaSmi {
    program: PathBuf,
}

impl NvidiaSmi {
    pub fn new() -> Self {
        Self::with_program("nvidia-smi")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String, ToolError> {
        let tool = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| ToolError::Unavailable { tool: tool.clone(), source })?;

        if !output.status.success() {
            // nvidia-smi prints most failures on stdout.
            let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if message.is_empty() {
                message = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(ToolError::Failed {
                tool,
                status: output.status.to_string(),
                stderr: message,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuTool for NvidiaSmi {
    fn name(&self) -> &str {
        "nvidia-smi"
    }

    fn list_gpus(&self) -> Result<Vec<GpuInfo>, ToolError> {
        self.run(LIST_GPUS_ARGS).map(|out| parse_gpu_list(&out))
    }

    fn compute_apps(&self) -> Result<ComputeApps, ToolError> {
        self.run(QUERY_COMPUTE_APPS_ARGS).map(|out| parse_compute_apps(&out))
    }
}

/// Queries devices through NVML.
pub struct NvmlTool {
    nvml: Nvml,
}

impl NvmlTool {
    pub fn init() -> Result<Self, ToolError> {
        let nvml = Nvml::init().map_err(|e| ToolError::Nvml(e.to_string()))?;
        Ok(Self { nvml })
    }
}

impl GpuTool for NvmlTool {
    fn name(&self) -> &str {
        "nvml"
    }

    fn list_gpus(&self) -> Result<Vec<GpuInfo>, ToolError> {
        let device_count = self.nvml.device_count().map_err(|e| ToolError::Nvml(e.to_string()))?;

        let mut gpus = Vec::with_capacity(device_count as usize);
        for index in 0..device_count {
            let device = match self.nvml.device_by_index(index) {
                Ok(dev) => dev,
                Err(e) => {
                    warn!("Failed to open GPU {}: {}", index, e);
                    continue;
                }
            };
            let uuid = match device.uuid() {
                Ok(uuid) => uuid,
                Err(e) => {
                    warn!("Failed to read uuid of GPU {}: {}", index, e);
                    continue;
                }
            };
            gpus.push(GpuInfo {
                index: index as GpuIndex,
                name: device.name().unwrap_or_default(),
                uuid,
            });
        }
        Ok(gpus)
    }

    fn compute_apps(&self) -> Result<ComputeApps, ToolError> {
        let device_count = self.nvml.device_count().map_err(|e| ToolError::Nvml(e.to_string()))?;

        let mut devices = Vec::with_capacity(device_count as usize);
        for index in 0..device_count {
            let device = match self.nvml.device_by_index(index) {
                Ok(dev) => dev,
                Err(e) => {
                    warn!("Failed to open GPU {}: {}", index, e);
                    continue;
                }
            };
            let compute_procs = match device.running_compute_processes() {
                Ok(procs) => procs,
                Err(e) => {
                    warn!("Failed to list compute processes on GPU {}: {}", index, e);
                    continue;
                }
            };
            let uuid = device.uuid().map_err(|e| {
                warn!("Failed to read uuid of GPU {}: {}", index, e);
                e.to_string()
            });

            devices.push(DeviceProcesses {
                index: index as GpuIndex,
                name: device.name().unwrap_or_default(),
                uuid,
                processes: compute_procs
                    .into_iter()
                    .map(|p| match p.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => (p.pid, Some(bytes)),
                        UsedGpuMemory::Unavailable => (p.pid, None),
                    })
                    .collect(),
            });
        }
        Ok(device_compute_apps(devices))
    }
}

/// Compute processes of one device as reported by NVML.
///
/// `uuid` is the error message when the uuid could not be read; memory
/// is `None` when the driver does not report it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProcesses {
    pub index: GpuIndex,
    pub name: String,
    pub uuid: Result<String, String>,
    pub processes: Vec<(Pid, Option<u64>)>,
}

/// Flattens per-device process lists into compute-app rows.
///
/// Rows of a device without a readable uuid keep an empty uuid, which the
/// registry cannot resolve, so their memory still counts toward the total.
pub fn device_compute_apps(devices: impl IntoIterator<Item = DeviceProcesses>) -> ComputeApps {
    let mut apps = ComputeApps::default();
    for device in devices {
        let gpu_uuid = device.uuid.unwrap_or_default();
        for (pid, used_bytes) in device.processes {
            match used_bytes {
                Some(bytes) => apps.rows.push(ComputeApp {
                    pid,
                    gpu_name: device.name.clone(),
                    gpu_uuid: gpu_uuid.clone(),
                    process_name: String::new(),
                    used_memory_mb: bytes as f64 / BYTES_PER_MB,
                }),
                None => apps.malformed.push(MalformedRow::new(
                    &format!("pid {} on GPU {}", pid, device.index),
                    "used memory unavailable",
                )),
            }
        }
    }
    apps
}

/// A tool that sees no GPUs, for hosts where GPU tracking is disabled.
pub struct NoGpu;

impl GpuTool for NoGpu {
    fn name(&self) -> &str {
        "none"
    }

    fn list_gpus(&self) -> Result<Vec<GpuInfo>, ToolError> {
        Ok(Vec::new())
    }

    fn compute_apps(&self) -> Result<ComputeApps, ToolError> {
        Ok(ComputeApps::default())
    }
}

/// Parses one `nvidia-smi --list-gpus` line:
/// `GPU 0: Tesla P100-PCIE-16GB (UUID: GPU-4b3bcbe7-8762-7baf-cd29-c1c51268360d)`
pub fn parse_gpu_line(line: &str) -> Result<GpuInfo, MalformedRow> {
    let rest = line
        .trim()
        .strip_prefix("GPU ")
        .ok_or_else(|| MalformedRow::new(line, "missing `GPU` prefix"))?;
    let (index, rest) = rest
        .split_once(':')
        .ok_or_else(|| MalformedRow::new(line, "missing `:` after index"))?;
    let index = index
        .trim()
        .parse::<GpuIndex>()
        .map_err(|_| MalformedRow::new(line, "invalid index"))?;
    let (name, uuid) = rest
        .rsplit_once("(UUID:")
        .ok_or_else(|| MalformedRow::new(line, "missing uuid"))?;
    let uuid = uuid
        .trim()
        .strip_suffix(')')
        .ok_or_else(|| MalformedRow::new(line, "unterminated uuid"))?
        .trim();
    if uuid.is_empty() {
        return Err(MalformedRow::new(line, "empty uuid"));
    }

    Ok(GpuInfo {
        index,
        name: name.trim().to_string(),
        uuid: uuid.to_string(),
    })
}

/// Parses the whole device listing. Lines that are not GPU lines (such as
/// indented MIG entries) are skipped; malformed GPU lines are logged.
pub fn parse_gpu_list(output: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        if !line.starts_with("GPU ") {
            trace!("skipping device line {:?}", line);
            continue;
        }
        match parse_gpu_line(line) {
            Ok(gpu) => gpus.push(gpu),
            Err(e) => warn!("{}", e),
        }
    }
    gpus
}

/// Parses one compute-app row: `pid, gpu_name, gpu_uuid, process_name, used_memory`.
///
/// The process name is whatever lies between the third and the last comma,
/// so names that contain commas still parse.
pub fn parse_compute_app(line: &str) -> Result<ComputeApp, MalformedRow> {
    let fields = line.split(',').count();
    if fields < 5 {
        return Err(MalformedRow::new(line, format!("expected 5 fields, found {}", fields)));
    }

    let mut head = line.splitn(4, ',').map(str::trim);
    let (Some(pid), Some(gpu_name), Some(gpu_uuid), Some(tail)) =
        (head.next(), head.next(), head.next(), head.next())
    else {
        return Err(MalformedRow::new(line, "expected 5 fields"));
    };
    let (process_name, used_memory) = tail
        .rsplit_once(',')
        .ok_or_else(|| MalformedRow::new(line, "missing used_memory"))?;

    let pid = pid
        .parse::<Pid>()
        .map_err(|_| MalformedRow::new(line, format!("invalid pid {:?}", pid)))?;
    let used_memory = used_memory.trim();
    let used_memory_mb = used_memory
        .parse::<f64>()
        .ok()
        .filter(|mb| mb.is_finite() && *mb >= 0.0)
        .ok_or_else(|| MalformedRow::new(line, format!("invalid used_memory {:?}", used_memory)))?;

    Ok(ComputeApp {
        pid,
        gpu_name: gpu_name.to_string(),
        gpu_uuid: gpu_uuid.to_string(),
        process_name: process_name.trim().to_string(),
        used_memory_mb,
    })
}

/// Parses the whole compute-app output. Empty output means no compute processes.
pub fn parse_compute_apps(output: &str) -> ComputeApps {
    let mut apps = ComputeApps::default();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match parse_compute_app(line) {
            Ok(row) => apps.rows.push(row),
            Err(e) => apps.malformed.push(e),
        }
    }
    apps
}

/// GPU memory held by the tracked processes at one moment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuReading {
    pub usage: Vec<GpuUsage>,
    pub malformed_rows: usize,
}

/// Queries compute processes and keeps the rows belonging to a process set.
pub struct GpuUsageQuerier {
    tool: Arc<dyn GpuTool>,
    registry: Arc<GpuRegistry>,
    tool_warned: bool,
}

impl GpuUsageQuerier {
    pub fn new(tool: Arc<dyn GpuTool>, registry: Arc<GpuRegistry>) -> Self {
        Self {
            tool,
            registry,
            tool_warned: false,
        }
    }

    pub fn registry(&self) -> &Arc<GpuRegistry> {
        &self.registry
    }

    /// Returns the usage rows of `pids`. A missing or failing tool yields an
    /// empty reading; malformed rows are logged and counted.
    pub fn query(&mut self, pids: &ProcessSet) -> GpuReading {
        let apps = match self.tool.compute_apps() {
            Ok(apps) => apps,
            Err(e) => {
                if self.tool_warned {
                    debug!("GPU query failed: {}", e);
                } else {
                    warn!("GPU query failed, reporting CPU memory only: {}", e);
                    self.tool_warned = true;
                }
                return GpuReading::default();
            }
        };

        for bad in &apps.malformed {
            warn!("{}: {}", self.tool.name(), bad);
        }

        let usage = apps
            .rows
            .into_iter()
            .filter(|row| pids.contains(&row.pid))
            .map(|row| GpuUsage {
                pid: row.pid,
                gpu_index: self.registry.resolve(&row.gpu_uuid),
                used_memory_mb: row.used_memory_mb,
            })
            .collect();

        GpuReading {
            usage,
            malformed_rows: apps.malformed.len(),
        }
    }
}
