/// Hardware Abstraction Layer - "The Spine"
///
/// Every service the dispatch core consumes from the platform (agent and
/// region enumeration, region allocation, code objects, signals, hardware
/// queues) sits behind the `Platform` trait. `sim` provides an in-process
/// accelerator; `hsa` drives the real runtime.

pub mod agent;
pub mod allocator;
pub mod region;
pub mod sim;

#[cfg(feature = "hsa")]
pub mod hsa;

use crate::error::PlatformError;
use crate::types::{
    AgentHandle, AgentInfo, CodeObjectHandle, ExecutableHandle, KernelObject, RegionHandle,
    RegionInfo, SignalHandle, SymbolHandle,
};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Platform services consumed by the dispatch core
pub trait Platform: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    fn init(&self) -> PlatformResult<()>;
    fn shut_down(&self) -> PlatformResult<()>;

    fn agents(&self) -> PlatformResult<Vec<AgentInfo>>;
    fn regions(&self, agent: AgentHandle) -> PlatformResult<Vec<RegionInfo>>;

    fn queue_max_size(&self, agent: AgentHandle) -> PlatformResult<u32>;
    /// Create a multi-producer hardware queue of exactly `size` slots
    fn create_queue(&self, agent: AgentHandle, size: u32) -> PlatformResult<Arc<dyn HardwareQueue>>;

    fn allocate(&self, region: RegionHandle, size: usize) -> PlatformResult<NonNull<u8>>;
    fn free(&self, ptr: NonNull<u8>) -> PlatformResult<()>;
    /// Copy `size` bytes between two platform allocations
    fn memory_copy(&self, dst: NonNull<u8>, src: NonNull<u8>, size: usize) -> PlatformResult<()>;
    /// Grant `agent` read/write ownership of an allocation
    fn assign_agent(&self, ptr: NonNull<u8>, agent: AgentHandle) -> PlatformResult<()>;

    fn deserialize_code_object(&self, blob: &[u8]) -> PlatformResult<CodeObjectHandle>;
    fn destroy_code_object(&self, code_object: CodeObjectHandle) -> PlatformResult<()>;
    /// Create an empty, unfrozen executable
    fn create_executable(&self) -> PlatformResult<ExecutableHandle>;
    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        agent: AgentHandle,
        code_object: CodeObjectHandle,
    ) -> PlatformResult<()>;
    fn freeze_executable(&self, executable: ExecutableHandle) -> PlatformResult<()>;
    fn destroy_executable(&self, executable: ExecutableHandle) -> PlatformResult<()>;
    fn get_symbol(
        &self,
        executable: ExecutableHandle,
        name: &str,
        agent: AgentHandle,
    ) -> PlatformResult<SymbolHandle>;
    fn kernel_object(&self, symbol: SymbolHandle) -> PlatformResult<KernelObject>;

    fn signal_create(&self, initial: i64) -> PlatformResult<SignalHandle>;
    fn signal_destroy(&self, signal: SignalHandle) -> PlatformResult<()>;
    /// Load with acquire ordering
    fn signal_load(&self, signal: SignalHandle) -> i64;
    /// Store with relaxed ordering
    fn signal_store(&self, signal: SignalHandle, value: i64);
    /// Block until the signal equals `value` or `timeout` passes.
    /// Returns the last observed value; may return early.
    fn signal_wait_eq(&self, signal: SignalHandle, value: i64, timeout: Duration) -> i64;
}

/// A hardware ring of 64-byte packet slots
pub trait HardwareQueue: Send + Sync {
    fn id(&self) -> u64;
    /// First byte of the ring, aligned to the packet size
    fn base_address(&self) -> NonNull<u8>;
    /// Number of slots, always a power of two
    fn capacity(&self) -> u32;
    /// Relaxed fetch-and-add on the write index, returns the previous value
    fn add_write_index(&self, count: u64) -> u64;
    fn load_write_index(&self) -> u64;
    /// Acquire load of the consumer's read index
    fn load_read_index(&self) -> u64;
    /// Relaxed store of the packet index into the doorbell. The consumer
    /// takes no slot past the highest index rung.
    fn ring_doorbell(&self, index: u64);
}

struct Session {
    platform: Arc<dyn Platform>,
}

impl Drop for Session {
    fn drop(&mut self) {
        log::info!("Shutting down platform runtime ({})", self.platform.name());
        if let Err(e) = self.platform.shut_down() {
            log::error!("{e}");
        }
    }
}

/// Scoped handle to an initialized platform.
///
/// Cloning is cheap. The platform is shut down when the last clone drops,
/// so queues, programs, buffers and signals keep it alive while in use.
#[derive(Clone)]
pub struct Runtime {
    session: Arc<Session>,
}

impl Runtime {
    pub fn new(platform: Arc<dyn Platform>) -> PlatformResult<Self> {
        log::info!("Initializing platform runtime ({})", platform.name());
        platform.init()?;
        Ok(Self {
            session: Arc::new(Session { platform }),
        })
    }

    pub fn platform(&self) -> &dyn Platform {
        self.session.platform.as_ref()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("platform", &self.session.platform.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimPlatform;

    #[test]
    fn shut_down_runs_once_after_last_clone() {
        let sim = Arc::new(SimPlatform::builder().build());
        let rt = Runtime::new(sim.clone()).unwrap();
        let clone = rt.clone();
        assert!(sim.is_initialized());

        drop(rt);
        assert!(sim.is_initialized());

        drop(clone);
        assert!(!sim.is_initialized());
        assert_eq!(sim.shutdown_count(), 1);
    }
}
