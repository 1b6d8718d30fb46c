/// RayOS Dispatch Runtime
///
/// A minimal compute-accelerator dispatch path: discover a host and an
/// accelerator agent, classify the accelerator's memory regions, load a
/// kernel binary, encode kernel dispatch packets into a lock-free
/// multi-producer ring and wait for their completion signals.

pub mod types;
pub mod error;
pub mod hal;
pub mod loader;
pub mod packet;
pub mod queue;
pub mod dispatch;
pub mod signal;

pub use dispatch::DispatchDescriptor;
pub use error::{DispatchError, Result};
pub use hal::{Platform, Runtime};
pub use loader::Program;
pub use signal::CompletionSignal;
pub use types::{OverflowPolicy, RegionClass, RuntimeConfig, SelectionPolicy};

use hal::agent::{discover_agents, Agent, Topology};
use hal::allocator::{RegionAllocator, RegionBuffer};
use queue::{CommandQueue, QueueStats};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// The dispatch runtime - one host/accelerator pair and its queue
pub struct DispatchRuntime {
    queue: CommandQueue,
    allocator: RegionAllocator,
    topology: Topology,
    config: RuntimeConfig,
    runtime: Runtime,
}

impl DispatchRuntime {
    /// Bring up the platform, pick agents and create the queue
    pub fn initialize(platform: Arc<dyn Platform>, config: RuntimeConfig) -> Result<Self> {
        log::info!("=== Initializing RayOS Dispatch Runtime ===");

        let runtime = Runtime::new(platform)?;
        log::info!("✓ Platform runtime ({}) initialized", runtime.platform().name());

        let topology = discover_agents(&runtime, &config.host, &config.accelerator)?;
        log::info!("✓ Agents discovered");

        let allocator = RegionAllocator::new(runtime.clone(), &topology.accelerator);
        log::info!("✓ Region allocator initialized");

        let queue = CommandQueue::create(&runtime, &topology.accelerator, config.queue_size, config.overflow)?;
        log::info!("✓ Command queue initialized");

        log::info!("=== RayOS Dispatch Runtime Ready ===");

        Ok(Self {
            queue,
            allocator,
            topology,
            config,
            runtime,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn host(&self) -> &Agent {
        &self.topology.host
    }

    pub fn accelerator(&self) -> &Agent {
        &self.topology.accelerator
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn allocator(&self) -> &RegionAllocator {
        &self.allocator
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Load a kernel binary for the accelerator and resolve `entry`
    pub fn load_program(&self, blob: &[u8], entry: &str) -> Result<Program> {
        loader::load(&self.allocator, &self.topology.accelerator, blob, entry)
    }

    pub fn load_program_from_file(&self, path: impl AsRef<Path>, entry: &str) -> Result<Program> {
        loader::load_from_file(&self.allocator, &self.topology.accelerator, path, entry)
    }

    /// Allocate from one of the accelerator's region classes
    pub fn allocate(&self, class: RegionClass, size: usize) -> Result<RegionBuffer> {
        self.allocator.allocate(class, size)
    }

    /// A fresh completion signal armed for one dispatch
    pub fn create_signal(&self) -> Result<CompletionSignal> {
        CompletionSignal::new(&self.runtime)
    }

    /// Encode and publish one dispatch, returning its packet index
    pub fn dispatch(&self, desc: &DispatchDescriptor) -> Result<u64> {
        dispatch::encode(&self.queue, desc)
    }

    /// Wait on `signal` using the configured wait slice
    pub fn wait(&self, signal: &CompletionSignal, timeout: Duration) -> bool {
        signal.wait_sliced(timeout, self.config.wait_slice())
    }

    /// Dispatch with a fresh completion signal and block until it completes
    /// or the configured default timeout passes
    pub fn dispatch_and_wait(&self, desc: DispatchDescriptor) -> Result<u64> {
        self.dispatch_and_wait_timeout(desc, self.config.default_timeout())
    }

    pub fn dispatch_and_wait_timeout(&self, desc: DispatchDescriptor, timeout: Duration) -> Result<u64> {
        let signal = self.create_signal()?;
        let index = self.dispatch(&desc.completion_signal(&signal))?;
        if !self.wait(&signal, timeout) {
            return Err(DispatchError::Timeout(timeout));
        }
        Ok(index)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

impl std::fmt::Debug for DispatchRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("runtime", &self.runtime)
            .field("accelerator", &self.topology.accelerator.name)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Builder for DispatchRuntime with custom configuration
pub struct DispatchRuntimeBuilder {
    config: RuntimeConfig,
}

impl DispatchRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Accelerator selection policy
    pub fn with_selection(mut self, policy: SelectionPolicy) -> Self {
        self.config.accelerator = policy;
        self
    }

    pub fn with_host_selection(mut self, policy: SelectionPolicy) -> Self {
        self.config.host = policy;
        self
    }

    pub fn with_queue_size(mut self, size: u32) -> Self {
        self.config.queue_size = Some(size);
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow = policy;
        self
    }

    pub fn with_wait_slice(mut self, slice: Duration) -> Self {
        self.config.wait_slice_ms = RuntimeConfig::millis_ceil(slice);
        self
    }

    /// Timeout for `dispatch_and_wait`, rounded up to whole milliseconds
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_ms = RuntimeConfig::millis_ceil(timeout);
        self
    }

    pub fn build(self, platform: Arc<dyn Platform>) -> Result<DispatchRuntime> {
        DispatchRuntime::initialize(platform, self.config)
    }
}

impl Default for DispatchRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::sim::{SimCodeObject, SimPlatform};

    #[test]
    fn builder_applies_settings() {
        let rt = DispatchRuntimeBuilder::new()
            .with_queue_size(64)
            .with_overflow_policy(OverflowPolicy::Overwrite)
            .with_wait_slice(Duration::from_millis(2))
            .build(Arc::new(SimPlatform::builder().build()))
            .unwrap();
        assert_eq!(rt.queue().capacity(), 64);
        assert_eq!(rt.config().overflow, OverflowPolicy::Overwrite);
        assert_eq!(rt.config().wait_slice(), Duration::from_millis(2));
    }

    #[test]
    fn missing_accelerator_by_name() {
        let res = DispatchRuntimeBuilder::new()
            .with_selection(SelectionPolicy::NameContains("gfx1100".into()))
            .build(Arc::new(SimPlatform::builder().build()));
        assert!(matches!(res, Err(DispatchError::AgentNotFound(types::AgentRole::Accelerator))));
    }

    #[test]
    fn dispatch_and_wait_completes() {
        let sim = Arc::new(SimPlatform::builder().kernel("noop", |_| {}).build());
        let rt = DispatchRuntimeBuilder::new()
            .with_queue_size(16)
            .build(sim.clone())
            .unwrap();
        let program = rt
            .load_program(&SimCodeObject::new(["noop"]).to_bytes(), "noop")
            .unwrap();

        let desc = DispatchDescriptor::new(program.kernel_object()).grid(32, 1, 1);
        let index = rt.dispatch_and_wait(desc).unwrap();
        assert_eq!(index, 0);
        assert_eq!(rt.dispatch_and_wait(desc).unwrap(), 1);
        assert_eq!(rt.stats().consumed, 2);

        // Each encode rang the doorbell with its own packet index.
        let records = sim.drain_records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.doorbell == r.index as i64));
    }

    #[test]
    fn sub_second_timeout_is_kept() {
        let sim = SimPlatform::builder()
            .kernel("quick", |_| std::thread::sleep(Duration::from_millis(5)))
            .build();
        let rt = DispatchRuntimeBuilder::new()
            .with_timeout(Duration::from_millis(900))
            .with_wait_slice(Duration::from_micros(500))
            .build(Arc::new(sim))
            .unwrap();
        assert_eq!(rt.config().default_timeout(), Duration::from_millis(900));
        assert_eq!(rt.config().wait_slice(), Duration::from_millis(1));

        let program = rt
            .load_program(&SimCodeObject::new(["quick"]).to_bytes(), "quick")
            .unwrap();
        let desc = DispatchDescriptor::new(program.kernel_object());
        assert_eq!(rt.dispatch_and_wait(desc).unwrap(), 0);
    }

    #[test]
    fn slow_kernel_times_out() {
        let sim = SimPlatform::builder()
            .kernel("slow", |_| std::thread::sleep(Duration::from_millis(200)))
            .build();
        let rt = DispatchRuntimeBuilder::new().build(Arc::new(sim)).unwrap();
        let program = rt
            .load_program(&SimCodeObject::new(["slow"]).to_bytes(), "slow")
            .unwrap();

        let desc = DispatchDescriptor::new(program.kernel_object());
        let res = rt.dispatch_and_wait_timeout(desc, Duration::from_millis(20));
        assert!(matches!(res, Err(DispatchError::Timeout(_))));
    }
}
