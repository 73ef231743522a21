use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use std::collections::HashMap;
use tracing::warn;
use crate::error::PidListError;
use crate::metrics::{Pid, ProcessSet};
use crate::mode::TargetMode;

/// Which processes a session measures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProcessTarget {
    /// The calling process and all of its descendants, rediscovered every tick.
    #[default]
    CurrentTree,
    /// Exactly these pids, used verbatim for the whole session.
    Fixed(Vec<Pid>),
    /// These pids and all of their descendants, rediscovered every tick.
    Trees(Vec<Pid>),
}

impl ProcessTarget {
    pub fn from_pids(pids: Vec<Pid>, mode: TargetMode) -> Self {
        match mode {
            TargetMode::Fixed => ProcessTarget::Fixed(pids),
            TargetMode::Tree => ProcessTarget::Trees(pids),
        }
    }

    /// Builds a target from a comma-separated pid list such as `"12,40, 41"`.
    pub fn from_pid_list(list: &str, mode: TargetMode) -> Result<Self, PidListError> {
        Ok(Self::from_pids(parse_pid_list(list)?, mode))
    }
}

/// Parses a comma-separated list of pids. The pids need not exist.
///
/// Any integer is accepted. Negative values and values above the pid range
/// can never name a process, so they are dropped with a warning, the same
/// way a pid that does not exist contributes nothing.
pub fn parse_pid_list(list: &str) -> Result<Vec<Pid>, PidListError> {
    let mut pids = Vec::new();
    for token in list.split(',').map(str::trim) {
        let value: i64 = token
            .parse()
            .map_err(|_| PidListError::InvalidPid(token.to_string()))?;
        match Pid::try_from(value) {
            Ok(pid) => pids.push(pid),
            Err(_) => warn!("ignoring pid {}: no process can have it", value),
        }
    }
    Ok(pids)
}

/// Live view of the process table, refreshed once per tick.
pub struct ProcessTable {
    system: System,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { system: System::new() }
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    /// Refreshes memory counters for the processes `target` may cover.
    ///
    /// Tree targets need parent links for every process, so the whole table
    /// is refreshed; fixed targets only touch their own pids.
    pub fn refresh(&mut self, target: &ProcessTarget) {
        let kind = ProcessRefreshKind::nothing().with_memory();
        match target {
            ProcessTarget::Fixed(pids) => {
                let pids: Vec<sysinfo::Pid> =
                    pids.iter().map(|&p| sysinfo::Pid::from_u32(p)).collect();
                self.system
                    .refresh_processes_specifics(ProcessesToUpdate::Some(&pids), true, kind);
            }
            ProcessTarget::CurrentTree | ProcessTarget::Trees(_) => {
                self.system
                    .refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
            }
        }
    }

    /// Returns the process set for `target` as of the last refresh.
    pub fn enumerate(&self, target: &ProcessTarget) -> ProcessSet {
        match target {
            ProcessTarget::Fixed(pids) => pids.iter().copied().collect(),
            ProcessTarget::CurrentTree => self.descendants(&[std::process::id()]),
            ProcessTarget::Trees(roots) => self.descendants(roots),
        }
    }

    fn descendants(&self, roots: &[Pid]) -> ProcessSet {
        // Threads show up as tasks sharing their process's memory; skip them.
        let edges = self
            .system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .filter_map(|(pid, process)| {
                process.parent().map(|parent| (pid.as_u32(), parent.as_u32()))
            });
        collect_tree(edges, roots)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks `(child, parent)` edges and returns the roots plus every
/// transitive descendant. Roots are included even if absent from the edges.
pub fn collect_tree(edges: impl IntoIterator<Item = (Pid, Pid)>, roots: &[Pid]) -> ProcessSet {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (child, parent) in edges {
        children.entry(parent).or_default().push(child);
    }

    let mut set: ProcessSet = roots.iter().copied().collect();
    let mut stack: Vec<Pid> = roots.to_vec();
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if set.insert(kid) {
                    stack.push(kid);
                }
            }
        }
    }
    set
}
