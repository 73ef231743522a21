use clap::ValueEnum;
use sysinfo::System;
use crate::error::CollectError;
use crate::metrics::{BYTES_PER_MB, Pid};

/// Which memory counter of a process is read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MemoryField {
    /// Resident set size.
    #[default]
    Rss,
    /// Virtual memory size.
    Vms,
}

/// Reads one process's memory in MB from the last refresh of `system`.
pub fn read_memory_mb(system: &System, pid: Pid, field: MemoryField) -> Result<f64, CollectError> {
    let process = system
        .process(sysinfo::Pid::from_u32(pid))
        .ok_or(CollectError::ProcessNotFound(pid))?;

    let bytes = match field {
        MemoryField::Rss => process.memory(),
        MemoryField::Vms => process.virtual_memory(),
    };
    Ok(bytes as f64 / BYTES_PER_MB)
}
