//! Error taxonomy for a retrieval run
//!
//! Only [`RetrievalError::Configuration`] is fatal. Every other variant is recovered at
//! the smallest unit of work (one series, one study) and surfaces through the run
//! summary and the logs.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::config::ConfigError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Association with {0} not established")]
    Connectivity(String),

    #[error("Remote returned status 0x{code:04X}: {detail}")]
    ProtocolStatus { code: u16, detail: String },

    #[error("External tool {tool} failed: {reason}")]
    ToolInvocation { tool: PathBuf, reason: String },

    #[error("Storage write failed: {0}")]
    StorageWrite(#[from] StorageError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] dimse::DimseError),
}

/// Category of a recovered failure, kept in the run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Connectivity,
    ProtocolStatus,
    ToolInvocation,
    StorageWrite,
    Protocol,
}

impl RetrievalError {
    pub fn tool(tool: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ToolInvocation {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Series-level error for objects the remote reported as failed
    pub fn suboperations_failed(code: u16, failed: u64) -> Self {
        Self::ProtocolStatus {
            code,
            detail: format!("{} sub-operations failed", failed),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            // Configuration errors never reach a unit of work
            RetrievalError::Configuration(_) => FailureKind::Protocol,
            RetrievalError::Connectivity(_) => FailureKind::Connectivity,
            RetrievalError::ProtocolStatus { .. } => FailureKind::ProtocolStatus,
            RetrievalError::ToolInvocation { .. } => FailureKind::ToolInvocation,
            RetrievalError::StorageWrite(_) => FailureKind::StorageWrite,
            RetrievalError::Protocol(e) if e.is_recoverable() => FailureKind::Connectivity,
            RetrievalError::Protocol(_) => FailureKind::Protocol,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Connectivity => "connectivity",
            FailureKind::ProtocolStatus => "protocol-status",
            FailureKind::ToolInvocation => "tool-invocation",
            FailureKind::StorageWrite => "storage-write",
            FailureKind::Protocol => "protocol",
        };
        f.write_str(name)
    }
}
