/// Error types for the dispatch runtime
///
/// Platform failures carry the failing entry point and a status code;
/// everything above the HAL reports through `DispatchError`.

use crate::types::{AgentRole, RegionClass};
use std::fmt;

/// Result type for dispatch runtime operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Status codes reported by platform services.
///
/// Numeric values follow the HSA status code space so the same taxonomy
/// serves the simulated and the real backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformStatus {
    Error,
    InvalidArgument,
    InvalidQueueCreation,
    InvalidAllocation,
    InvalidAgent,
    InvalidRegion,
    InvalidSignal,
    InvalidQueue,
    OutOfResources,
    NotInitialized,
    InvalidCodeObject,
    InvalidExecutable,
    FrozenExecutable,
    InvalidSymbolName,
    /// A code the runtime reported that has no named variant.
    Other(u32),
}

impl PlatformStatus {
    pub fn code(self) -> u32 {
        match self {
            PlatformStatus::Error => 0x1000,
            PlatformStatus::InvalidArgument => 0x1001,
            PlatformStatus::InvalidQueueCreation => 0x1002,
            PlatformStatus::InvalidAllocation => 0x1003,
            PlatformStatus::InvalidAgent => 0x1004,
            PlatformStatus::InvalidRegion => 0x1005,
            PlatformStatus::InvalidSignal => 0x1006,
            PlatformStatus::InvalidQueue => 0x1007,
            PlatformStatus::OutOfResources => 0x1008,
            PlatformStatus::NotInitialized => 0x100B,
            PlatformStatus::InvalidCodeObject => 0x1010,
            PlatformStatus::InvalidExecutable => 0x1011,
            PlatformStatus::FrozenExecutable => 0x1012,
            PlatformStatus::InvalidSymbolName => 0x1013,
            PlatformStatus::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0x1000 => PlatformStatus::Error,
            0x1001 => PlatformStatus::InvalidArgument,
            0x1002 => PlatformStatus::InvalidQueueCreation,
            0x1003 => PlatformStatus::InvalidAllocation,
            0x1004 => PlatformStatus::InvalidAgent,
            0x1005 => PlatformStatus::InvalidRegion,
            0x1006 => PlatformStatus::InvalidSignal,
            0x1007 => PlatformStatus::InvalidQueue,
            0x1008 => PlatformStatus::OutOfResources,
            0x100B => PlatformStatus::NotInitialized,
            0x1010 => PlatformStatus::InvalidCodeObject,
            0x1011 => PlatformStatus::InvalidExecutable,
            0x1012 => PlatformStatus::FrozenExecutable,
            0x1013 => PlatformStatus::InvalidSymbolName,
            other => PlatformStatus::Other(other),
        }
    }

    /// Human-readable description of the status
    pub fn description(self) -> &'static str {
        match self {
            PlatformStatus::Error => "a generic error has occurred",
            PlatformStatus::InvalidArgument => "one of the actual arguments does not meet a precondition",
            PlatformStatus::InvalidQueueCreation => "the requested queue creation is not valid",
            PlatformStatus::InvalidAllocation => "the requested allocation is not valid",
            PlatformStatus::InvalidAgent => "the agent is invalid",
            PlatformStatus::InvalidRegion => "the memory region is invalid",
            PlatformStatus::InvalidSignal => "the signal is invalid",
            PlatformStatus::InvalidQueue => "the queue is invalid",
            PlatformStatus::OutOfResources => "the runtime failed to allocate the necessary resources",
            PlatformStatus::NotInitialized => "the runtime has not been initialized",
            PlatformStatus::InvalidCodeObject => "the code object is invalid",
            PlatformStatus::InvalidExecutable => "the executable is invalid",
            PlatformStatus::FrozenExecutable => "the executable is frozen",
            PlatformStatus::InvalidSymbolName => "there is no symbol with the given name",
            PlatformStatus::Other(_) => "unrecognized status code",
        }
    }
}

impl fmt::Display for PlatformStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.description(), self.code())
    }
}

/// A failed platform service call
#[derive(Debug, Clone, thiserror::Error)]
#[error("{op} failed: {status}")]
pub struct PlatformError {
    /// Name of the platform entry point that failed
    pub op: &'static str,
    pub status: PlatformStatus,
}

impl PlatformError {
    pub fn new(op: &'static str, status: PlatformStatus) -> Self {
        Self { op, status }
    }
}

/// Step of the code-loading pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Stage,
    Deserialize,
    Create,
    Load,
    Freeze,
    Resolve,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStage::Stage => "staging",
            LoadStage::Deserialize => "deserialize",
            LoadStage::Create => "executable create",
            LoadStage::Load => "code object load",
            LoadStage::Freeze => "freeze",
            LoadStage::Resolve => "symbol resolve",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the dispatch runtime
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No agent of the requested role matched the selection policy
    #[error("no {0} agent found")]
    AgentNotFound(AgentRole),

    /// The accelerator exposes no region of this class
    #[error("memory region class {0} is not available on the accelerator")]
    RegionUnavailable(RegionClass),

    /// A step of the code-loading pipeline failed
    #[error("kernel load failed at {stage}: {source}")]
    Load {
        stage: LoadStage,
        #[source]
        source: Box<DispatchError>,
    },

    /// Host tried to touch device-local memory directly
    #[error("memory region class {0} is not host accessible")]
    NotHostAccessible(RegionClass),

    /// Requested queue size is not usable
    #[error("invalid queue size {requested} (agent maximum {max}, must be a power of two)")]
    InvalidQueueSize { requested: u32, max: u32 },

    /// Dispatch geometry with a zero-sized dimension
    #[error("invalid dispatch geometry: workgroup {workgroup:?}, grid {grid:?}")]
    InvalidGeometry { workgroup: [u16; 3], grid: [u32; 3] },

    /// Access outside of a region buffer
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    OutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Completion signal did not reach zero in time
    #[error("completion signal not reached within {0:?}")]
    Timeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Wrap an error as a failure of the given load stage
    pub fn at_stage(self, stage: LoadStage) -> Self {
        DispatchError::Load {
            stage,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_roundtrip() {
        for status in [
            PlatformStatus::Error,
            PlatformStatus::InvalidAgent,
            PlatformStatus::OutOfResources,
            PlatformStatus::InvalidSymbolName,
            PlatformStatus::FrozenExecutable,
        ] {
            assert_eq!(PlatformStatus::from_code(status.code()), status);
        }
        assert_eq!(PlatformStatus::from_code(0x4242), PlatformStatus::Other(0x4242));
    }

    #[test]
    fn load_error_names_stage() {
        let err = DispatchError::from(PlatformError::new(
            "get_symbol",
            PlatformStatus::InvalidSymbolName,
        ))
        .at_stage(LoadStage::Resolve);
        let text = err.to_string();
        assert!(text.contains("symbol resolve"), "{text}");
    }
}
