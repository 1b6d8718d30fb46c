/// Core types for the dispatch runtime
///
/// Opaque platform handles, the agent/region data model and the runtime
/// configuration shared by every layer.

use crate::error::{DispatchError, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// The unset handle
            pub const NULL: Self = Self(0);

            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }
    };
}

opaque_handle!(
    /// Platform handle of a compute agent
    AgentHandle
);
opaque_handle!(
    /// Platform handle of a memory region
    RegionHandle
);
opaque_handle!(
    /// Platform handle of a hardware signal
    SignalHandle
);
opaque_handle!(
    /// Deserialized code object
    CodeObjectHandle
);
opaque_handle!(ExecutableHandle);
opaque_handle!(SymbolHandle);
opaque_handle!(
    /// Resolved kernel entry, written into the dispatch packet
    KernelObject
);

/// Three-dimensional extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Copy> Dim3<T> {
    pub const fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [T; 3] {
        [self.x, self.y, self.z]
    }
}

/// Device type as reported by agent enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Other(u32),
}

/// Role an agent plays in the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Host,
    Accelerator,
}

impl AgentRole {
    pub fn of(device: DeviceType) -> Option<Self> {
        match device {
            DeviceType::Cpu => Some(AgentRole::Host),
            DeviceType::Gpu => Some(AgentRole::Accelerator),
            DeviceType::Other(_) => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Host => f.write_str("host"),
            AgentRole::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Raw agent description produced by platform enumeration
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub handle: AgentHandle,
    pub device: DeviceType,
    pub name: String,
}

/// Coherency/locality class of an accelerator memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionClass {
    /// Fine-grained memory coherent between host and accelerator
    System,
    /// Kernel argument memory
    Kernarg,
    /// Coarse-grained accelerator memory the host can access
    HostVisibleLocal,
    /// Coarse-grained accelerator memory private to the device
    DeviceLocal,
}

impl RegionClass {
    pub const COUNT: usize = 4;

    pub const ALL: [RegionClass; Self::COUNT] = [
        RegionClass::System,
        RegionClass::Kernarg,
        RegionClass::HostVisibleLocal,
        RegionClass::DeviceLocal,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_host_accessible(self) -> bool {
        !matches!(self, RegionClass::DeviceLocal)
    }
}

impl fmt::Display for RegionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionClass::System => "SYSTEM",
            RegionClass::Kernarg => "KERNARG",
            RegionClass::HostVisibleLocal => "HOST_VISIBLE_LOCAL",
            RegionClass::DeviceLocal => "DEVICE_LOCAL",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// Region metadata used for classification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        const KERNARG = 1 << 0;
        const FINE_GRAINED = 1 << 1;
        const COARSE_GRAINED = 1 << 2;
        const HOST_ACCESSIBLE = 1 << 3;
    }
}

/// Memory segment a region belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSegment {
    Global,
    ReadOnly,
    Private,
    Group,
    Kernarg,
}

/// Raw region description produced by platform enumeration
#[derive(Debug, Clone)]
pub struct RegionInfo {
    pub handle: RegionHandle,
    pub segment: RegionSegment,
    pub flags: RegionFlags,
    /// Size in bytes
    pub size: usize,
}

/// How to pick one agent when several of the same role exist
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Last enumerated agent wins
    #[default]
    Last,
    First,
    /// N-th agent of the role, in enumeration order
    Index(usize),
    /// First agent whose name contains the string
    NameContains(String),
}

/// What a producer does when its slot is still owned by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the accelerator has consumed the slot's previous packet
    #[default]
    Backpressure,
    /// Write immediately; bounding in-flight work is the caller's job
    Overwrite,
}

/// Configuration for the dispatch runtime
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Accelerator selection
    pub accelerator: SelectionPolicy,
    /// Host agent selection
    pub host: SelectionPolicy,
    /// Ring size; `None` uses the agent maximum
    pub queue_size: Option<u32>,
    pub overflow: OverflowPolicy,
    /// Upper bound of a single blocking wait inside `CompletionSignal::wait`
    pub wait_slice_ms: u64,
    /// Timeout used by `dispatch_and_wait`
    pub default_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            accelerator: SelectionPolicy::Last,
            host: SelectionPolicy::Last,
            queue_size: None,
            overflow: OverflowPolicy::Backpressure,
            wait_slice_ms: 10,
            default_timeout_ms: 10_000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DispatchError::Config(e.to_string()))
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `RAYOS_DISPATCH_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(size) = get("RAYOS_DISPATCH_QUEUE_SIZE") {
            let size = size
                .parse()
                .map_err(|_| DispatchError::Config(format!("bad queue size: {size}")))?;
            self.queue_size = Some(size);
        }
        if let Some(index) = get("RAYOS_DISPATCH_AGENT_INDEX") {
            let index = index
                .parse()
                .map_err(|_| DispatchError::Config(format!("bad agent index: {index}")))?;
            self.accelerator = SelectionPolicy::Index(index);
        }
        if let Some(name) = get("RAYOS_DISPATCH_AGENT_NAME") {
            self.accelerator = SelectionPolicy::NameContains(name);
        }
        if let Some(policy) = get("RAYOS_DISPATCH_OVERFLOW") {
            self.overflow = match policy.as_str() {
                "backpressure" => OverflowPolicy::Backpressure,
                "overwrite" => OverflowPolicy::Overwrite,
                other => {
                    return Err(DispatchError::Config(format!(
                        "unknown overflow policy: {other}"
                    )))
                }
            };
        }
        Ok(self)
    }

    /// Whole milliseconds covering `d`, never less than one
    pub fn millis_ceil(d: Duration) -> u64 {
        d.as_nanos().div_ceil(1_000_000).max(1) as u64
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.max(1))
    }
}
