use std::io;
use thiserror::Error;

use crate::metrics::Pid;
use crate::sampler::SamplerState;

/// Failure to get an answer out of a GPU query tool.
///
/// Both variants are degradations: the caller reports zero GPU memory for
/// the tick instead of failing it.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} is not available: {source}")]
    Unavailable {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("NVML error: {0}")]
    Nvml(String),
}

/// A line of tool output that does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed row {line:?}: {reason}")]
pub struct MalformedRow {
    pub line: String,
    pub reason: String,
}

impl MalformedRow {
    pub fn new(line: &str, reason: impl Into<String>) -> Self {
        Self {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PidListError {
    #[error("invalid pid {0:?}")]
    InvalidPid(String),
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("sampler is {found:?}, expected {expected:?}")]
    InvalidState {
        expected: SamplerState,
        found: SamplerState,
    },

    #[error("sampler thread panicked")]
    Panicked,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
