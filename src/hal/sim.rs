/// Simulated Accelerator - "The Stand-In"
///
/// An in-process `Platform`: one host agent, one or more accelerator agents
/// with synthetic memory regions, a tiny code-object container, signals
/// backed by an atomic counter and a condvar, and a consumer thread per
/// queue that plays the packet processor.
///
/// Kernels are host closures registered by name. A code object only names
/// the kernels it exports; loading it binds those names to kernel objects.

use super::{HardwareQueue, Platform, PlatformResult};
use crate::error::{PlatformError, PlatformStatus};
use crate::packet::{
    packet_type, KernelDispatchPacket, INVALID_HEADER, PACKET_SIZE, PACKET_TYPE_INVALID,
    PACKET_TYPE_KERNEL_DISPATCH,
};
use crate::types::{
    AgentHandle, AgentInfo, CodeObjectHandle, DeviceType, Dim3, ExecutableHandle, KernelObject,
    RegionClass, RegionFlags, RegionHandle, RegionInfo, RegionSegment, SignalHandle, SymbolHandle,
};
use bytemuck::{Pod, Zeroable};
use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DEFAULT_QUEUE_MAX_SIZE: u32 = 4096;
const DEFAULT_REGION_SIZE: usize = 256 * 1024 * 1024;
const ALLOCATION_ALIGN: usize = 256;
/// Upper bound on a consumer sleep between doorbells
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// A kernel body run by the simulated packet processor
pub type SimKernel = Arc<dyn Fn(&KernelInvocation) + Send + Sync>;

/// What a kernel body sees of its dispatch
#[derive(Debug, Clone)]
pub struct KernelInvocation {
    pub kernel: String,
    pub packet_index: u64,
    pub grid: Dim3<u32>,
    pub workgroup: Dim3<u16>,
    pub kernarg_address: u64,
}

impl KernelInvocation {
    /// Total work-items in the grid
    pub fn work_items(&self) -> u64 {
        self.grid.x as u64 * self.grid.y as u64 * self.grid.z as u64
    }

    /// Read the kernel arguments as `T`.
    ///
    /// # Safety
    /// `kernarg_address` must point to at least `size_of::<T>()` readable bytes.
    pub unsafe fn kernargs<T: Pod>(&self) -> T {
        std::ptr::read_unaligned(self.kernarg_address as *const T)
    }
}

/// One packet retired by a simulated queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub queue_id: u64,
    pub index: u64,
    /// Control word as observed by the consumer
    pub control: u32,
    pub kernel_object: KernelObject,
    pub grid: Dim3<u32>,
    pub workgroup: Dim3<u16>,
    pub kernarg_address: u64,
    pub completion_signal: SignalHandle,
    /// Highest packet index rung on the doorbell when the packet was taken
    pub doorbell: i64,
    /// Set when the packet could not be executed
    pub fault: Option<PlatformStatus>,
}

impl PacketRecord {
    pub fn dimensions(&self) -> u16 {
        ((self.control >> 16) & 0x3) as u16
    }
}

/// Code-object container understood by the simulated loader.
///
/// Layout: magic `RSCO`, `u16` version, `u16` kernel count, then per kernel
/// a `u16` name length followed by the UTF-8 name. Little endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCodeObject {
    kernels: Vec<String>,
}

impl SimCodeObject {
    pub const MAGIC: [u8; 4] = *b"RSCO";
    pub const VERSION: u16 = 1;

    pub fn new<I, S>(kernels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kernels: kernels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kernels(&self) -> &[String] {
        &self.kernels
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.kernels.iter().map(|k| k.len() + 2).sum::<usize>());
        out.extend_from_slice(&Self::MAGIC);
        out.extend_from_slice(&Self::VERSION.to_le_bytes());
        out.extend_from_slice(&(self.kernels.len() as u16).to_le_bytes());
        for name in &self.kernels {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        out
    }

    /// Parse a serialized container; `None` on any malformation
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut cursor = bytes;
        if split(&mut cursor, 4)? != Self::MAGIC {
            return None;
        }
        if read_u16(&mut cursor)? != Self::VERSION {
            return None;
        }
        let count = read_u16(&mut cursor)?;
        let mut kernels = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = read_u16(&mut cursor)? as usize;
            let name = std::str::from_utf8(split(&mut cursor, len)?).ok()?;
            if name.is_empty() {
                return None;
            }
            kernels.push(name.to_string());
        }
        cursor.is_empty().then_some(Self { kernels })
    }
}

fn split<'a>(cursor: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if cursor.len() < n {
        return None;
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Some(head)
}

fn read_u16(cursor: &mut &[u8]) -> Option<u16> {
    split(cursor, 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Builder for [`SimPlatform`]
pub struct SimPlatformBuilder {
    accelerators: Vec<String>,
    queue_max_size: u32,
    region_size: usize,
    without: HashSet<RegionClass>,
    failures: HashSet<&'static str>,
    kernels: HashMap<String, SimKernel>,
}

impl SimPlatformBuilder {
    /// Add an accelerator agent; the first call replaces the default one
    pub fn accelerator(mut self, name: impl Into<String>) -> Self {
        self.accelerators.push(name.into());
        self
    }

    /// Maximum queue size reported for every accelerator
    pub fn queue_max_size(mut self, size: u32) -> Self {
        self.queue_max_size = size;
        self
    }

    /// Capacity of each synthetic region in bytes
    pub fn region_size(mut self, size: usize) -> Self {
        self.region_size = size;
        self
    }

    /// Leave out the region backing `class` on every accelerator
    pub fn without_region(mut self, class: RegionClass) -> Self {
        self.without.insert(class);
        self
    }

    /// Make the named `Platform` entry point fail with a generic error
    pub fn fail_on(mut self, op: &'static str) -> Self {
        self.failures.insert(op);
        self
    }

    /// Register a kernel body under its symbol name
    pub fn kernel<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&KernelInvocation) + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(body));
        self
    }

    pub fn build(self) -> SimPlatform {
        let next_handle = AtomicU64::new(0x100);
        let handle = || next_handle.fetch_add(1, Ordering::Relaxed);

        let mut agents = vec![AgentInfo {
            handle: AgentHandle(handle()),
            device: DeviceType::Cpu,
            name: "RayOS Sim Host".to_string(),
        }];
        let names = if self.accelerators.is_empty() {
            vec!["rayos-sim-gfx0".to_string()]
        } else {
            self.accelerators
        };
        for name in names {
            agents.push(AgentInfo {
                handle: AgentHandle(handle()),
                device: DeviceType::Gpu,
                name,
            });
        }

        let mut regions = Vec::new();
        for agent in &agents {
            let layouts: Vec<(Option<RegionClass>, RegionSegment, RegionFlags)> = match agent.device {
                DeviceType::Gpu => vec![
                    (
                        Some(RegionClass::System),
                        RegionSegment::Global,
                        RegionFlags::FINE_GRAINED.union(RegionFlags::HOST_ACCESSIBLE),
                    ),
                    (
                        Some(RegionClass::Kernarg),
                        RegionSegment::Global,
                        RegionFlags::KERNARG.union(RegionFlags::HOST_ACCESSIBLE),
                    ),
                    (
                        Some(RegionClass::HostVisibleLocal),
                        RegionSegment::Global,
                        RegionFlags::COARSE_GRAINED.union(RegionFlags::HOST_ACCESSIBLE),
                    ),
                    (
                        Some(RegionClass::DeviceLocal),
                        RegionSegment::Global,
                        RegionFlags::COARSE_GRAINED,
                    ),
                    (None, RegionSegment::Group, RegionFlags::empty()),
                ],
                _ => vec![(
                    Some(RegionClass::System),
                    RegionSegment::Global,
                    RegionFlags::FINE_GRAINED.union(RegionFlags::HOST_ACCESSIBLE),
                )],
            };
            for (class, segment, flags) in layouts {
                if class.is_some_and(|c| agent.device == DeviceType::Gpu && self.without.contains(&c)) {
                    continue;
                }
                regions.push(SimRegion {
                    owner: agent.handle,
                    info: RegionInfo {
                        handle: RegionHandle(handle()),
                        segment,
                        flags,
                        size: self.region_size,
                    },
                });
            }
        }

        SimPlatform {
            state: Arc::new(SimState {
                agents,
                regions,
                queue_max_size: self.queue_max_size,
                failures: self.failures,
                init_refs: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                next_handle,
                next_queue_id: AtomicU64::new(1),
                allocations: Mutex::new(HashMap::new()),
                code_objects: Mutex::new(HashMap::new()),
                executables: Mutex::new(HashMap::new()),
                symbols: RwLock::new(HashMap::new()),
                kernel_objects: RwLock::new(HashMap::new()),
                kernels: RwLock::new(self.kernels),
                signals: RwLock::new(HashMap::new()),
                records: SegQueue::new(),
            }),
        }
    }
}

struct SimRegion {
    owner: AgentHandle,
    info: RegionInfo,
}

struct SimAllocation {
    layout: Layout,
    region: RegionHandle,
    owner: AgentHandle,
}

struct SimExecutable {
    frozen: bool,
    symbols: Vec<SymbolHandle>,
}

struct SimSymbol {
    name: String,
    agent: AgentHandle,
    executable: ExecutableHandle,
    kernel_object: KernelObject,
}

struct SimSignal {
    value: AtomicI64,
    lock: Mutex<()>,
    changed: Condvar,
}

impl SimSignal {
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }
}

struct SimState {
    agents: Vec<AgentInfo>,
    regions: Vec<SimRegion>,
    queue_max_size: u32,
    failures: HashSet<&'static str>,
    /// `init` calls not yet matched by `shut_down`
    init_refs: AtomicUsize,
    shutdowns: AtomicUsize,
    next_handle: AtomicU64,
    next_queue_id: AtomicU64,
    allocations: Mutex<HashMap<usize, SimAllocation>>,
    code_objects: Mutex<HashMap<CodeObjectHandle, SimCodeObject>>,
    executables: Mutex<HashMap<ExecutableHandle, SimExecutable>>,
    symbols: RwLock<HashMap<SymbolHandle, SimSymbol>>,
    kernel_objects: RwLock<HashMap<KernelObject, String>>,
    kernels: RwLock<HashMap<String, SimKernel>>,
    signals: RwLock<HashMap<SignalHandle, Arc<SimSignal>>>,
    records: SegQueue<PacketRecord>,
}

impl SimState {
    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Gate every entry point on initialization and injected failures
    fn enter(&self, op: &'static str) -> PlatformResult<()> {
        if self.init_refs.load(Ordering::Acquire) == 0 {
            return Err(PlatformError::new(op, PlatformStatus::NotInitialized));
        }
        if self.failures.contains(op) {
            return Err(PlatformError::new(op, PlatformStatus::Error));
        }
        Ok(())
    }

    fn agent(&self, handle: AgentHandle) -> Option<&AgentInfo> {
        self.agents.iter().find(|a| a.handle == handle)
    }

    fn is_accelerator(&self, handle: AgentHandle) -> bool {
        self.agent(handle).is_some_and(|a| a.device == DeviceType::Gpu)
    }

    fn signal(&self, handle: SignalHandle) -> Option<Arc<SimSignal>> {
        self.signals.read().get(&handle).cloned()
    }

    fn signal_add(&self, handle: SignalHandle, delta: i64) {
        match self.signal(handle) {
            Some(signal) => {
                signal.value.fetch_add(delta, Ordering::AcqRel);
                signal.notify();
            }
            None => log::error!("Completion signal {handle} does not exist"),
        }
    }

    /// Whether `[ptr, ptr + size)` lies inside one live allocation
    fn covers(allocations: &HashMap<usize, SimAllocation>, ptr: NonNull<u8>, size: usize) -> bool {
        let start = ptr.as_ptr() as usize;
        allocations.iter().any(|(base, a)| {
            start >= *base && start.saturating_add(size) <= base + a.layout.size()
        })
    }

    /// Run one dispatch packet; returns the fault, if any
    fn execute(&self, packet: &KernelDispatchPacket, index: u64) -> Option<PlatformStatus> {
        if packet.packet_type() != PACKET_TYPE_KERNEL_DISPATCH {
            log::error!("Sim packet {index}: unsupported packet type {}", packet.packet_type());
            return Some(PlatformStatus::InvalidArgument);
        }
        if !(1..=3).contains(&packet.dimensions()) {
            log::error!("Sim packet {index}: bad dimension count {}", packet.dimensions());
            return Some(PlatformStatus::InvalidArgument);
        }

        let kernel_object = KernelObject(packet.kernel_object);
        let name = match self.kernel_objects.read().get(&kernel_object) {
            Some(name) => name.clone(),
            None => {
                log::error!("Sim packet {index}: unknown kernel object {kernel_object}");
                return Some(PlatformStatus::InvalidCodeObject);
            }
        };

        let invocation = KernelInvocation {
            kernel: name,
            packet_index: index,
            grid: Dim3::new(packet.grid_size_x, packet.grid_size_y, packet.grid_size_z),
            workgroup: Dim3::new(
                packet.workgroup_size_x,
                packet.workgroup_size_y,
                packet.workgroup_size_z,
            ),
            kernarg_address: packet.kernarg_address,
        };

        let body = self.kernels.read().get(&invocation.kernel).cloned();
        match body {
            Some(body) => match catch_unwind(AssertUnwindSafe(|| body(&invocation))) {
                Ok(()) => None,
                Err(_) => {
                    log::error!("Sim packet {index}: kernel {} panicked", invocation.kernel);
                    Some(PlatformStatus::Error)
                }
            },
            None => {
                log::debug!("Sim packet {index}: no body for {}, completing empty", invocation.kernel);
                None
            }
        }
    }
}

impl Drop for SimState {
    fn drop(&mut self) {
        for (base, allocation) in self.allocations.get_mut().drain() {
            // SAFETY: every entry was produced by `alloc_zeroed` with this layout.
            unsafe { std::alloc::dealloc(base as *mut u8, allocation.layout) };
        }
    }
}

/// The simulated platform
pub struct SimPlatform {
    state: Arc<SimState>,
}

impl SimPlatform {
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder {
            accelerators: Vec::new(),
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            region_size: DEFAULT_REGION_SIZE,
            without: HashSet::new(),
            failures: HashSet::new(),
            kernels: HashMap::new(),
        }
    }

    /// Initialization is reference counted like the HSA runtime
    pub fn is_initialized(&self) -> bool {
        self.state.init_refs.load(Ordering::Acquire) > 0
    }

    /// Number of successful `shut_down` calls
    pub fn shutdown_count(&self) -> usize {
        self.state.shutdowns.load(Ordering::Acquire)
    }

    /// Register or replace a kernel body after construction
    pub fn register_kernel<F>(&self, name: impl Into<String>, body: F)
    where
        F: Fn(&KernelInvocation) + Send + Sync + 'static,
    {
        self.state.kernels.write().insert(name.into(), Arc::new(body));
    }

    /// Take every packet record retired so far, in retirement order
    pub fn drain_records(&self) -> Vec<PacketRecord> {
        std::iter::from_fn(|| self.state.records.pop()).collect()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.allocations.lock().len()
    }

    pub fn live_signals(&self) -> usize {
        self.state.signals.read().len()
    }

    /// Agent that currently owns an allocation
    pub fn owner_of(&self, ptr: NonNull<u8>) -> Option<AgentHandle> {
        self.state
            .allocations
            .lock()
            .get(&(ptr.as_ptr() as usize))
            .map(|a| a.owner)
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &str {
        "sim"
    }

    fn init(&self) -> PlatformResult<()> {
        if self.state.failures.contains("init") {
            return Err(PlatformError::new("init", PlatformStatus::Error));
        }
        self.state.init_refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn shut_down(&self) -> PlatformResult<()> {
        self.state.enter("shut_down")?;
        self.state.init_refs.fetch_sub(1, Ordering::AcqRel);
        self.state.shutdowns.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn agents(&self) -> PlatformResult<Vec<AgentInfo>> {
        self.state.enter("agents")?;
        Ok(self.state.agents.clone())
    }

    fn regions(&self, agent: AgentHandle) -> PlatformResult<Vec<RegionInfo>> {
        self.state.enter("regions")?;
        if self.state.agent(agent).is_none() {
            return Err(PlatformError::new("regions", PlatformStatus::InvalidAgent));
        }
        Ok(self
            .state
            .regions
            .iter()
            .filter(|r| r.owner == agent)
            .map(|r| r.info.clone())
            .collect())
    }

    fn queue_max_size(&self, agent: AgentHandle) -> PlatformResult<u32> {
        self.state.enter("queue_max_size")?;
        if !self.state.is_accelerator(agent) {
            return Err(PlatformError::new("queue_max_size", PlatformStatus::InvalidAgent));
        }
        Ok(self.state.queue_max_size)
    }

    fn create_queue(&self, agent: AgentHandle, size: u32) -> PlatformResult<Arc<dyn HardwareQueue>> {
        const OP: &str = "create_queue";
        self.state.enter(OP)?;
        if !self.state.is_accelerator(agent) {
            return Err(PlatformError::new(OP, PlatformStatus::InvalidAgent));
        }
        if size == 0 || !size.is_power_of_two() || size > self.state.queue_max_size {
            return Err(PlatformError::new(OP, PlatformStatus::InvalidQueueCreation));
        }
        let id = self.state.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let queue = SimQueue::spawn(id, size, self.state.clone())
            .ok_or(PlatformError::new(OP, PlatformStatus::OutOfResources))?;
        Ok(Arc::new(queue))
    }

    fn allocate(&self, region: RegionHandle, size: usize) -> PlatformResult<NonNull<u8>> {
        const OP: &str = "allocate";
        self.state.enter(OP)?;
        let info = match self.state.regions.iter().find(|r| r.info.handle == region) {
            Some(r) if r.info.segment == RegionSegment::Global => r,
            _ => return Err(PlatformError::new(OP, PlatformStatus::InvalidRegion)),
        };
        if size == 0 {
            return Err(PlatformError::new(OP, PlatformStatus::InvalidAllocation));
        }

        let mut allocations = self.state.allocations.lock();
        let used: usize = allocations
            .values()
            .filter(|a| a.region == region)
            .map(|a| a.layout.size())
            .sum();
        if used.saturating_add(size) > info.info.size {
            return Err(PlatformError::new(OP, PlatformStatus::OutOfResources));
        }

        let layout = Layout::from_size_align(size, ALLOCATION_ALIGN)
            .map_err(|_| PlatformError::new(OP, PlatformStatus::InvalidAllocation))?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(PlatformError::new(OP, PlatformStatus::OutOfResources))?;
        allocations.insert(
            ptr.as_ptr() as usize,
            SimAllocation {
                layout,
                region,
                owner: info.owner,
            },
        );
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) -> PlatformResult<()> {
        self.state.enter("free")?;
        let allocation = self
            .state
            .allocations
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or(PlatformError::new("free", PlatformStatus::InvalidAllocation))?;
        // SAFETY: the pointer came from `alloc_zeroed` with this layout and was live.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), allocation.layout) };
        Ok(())
    }

    fn memory_copy(&self, dst: NonNull<u8>, src: NonNull<u8>, size: usize) -> PlatformResult<()> {
        self.state.enter("memory_copy")?;
        let allocations = self.state.allocations.lock();
        if !SimState::covers(&allocations, dst, size) || !SimState::covers(&allocations, src, size) {
            return Err(PlatformError::new("memory_copy", PlatformStatus::InvalidArgument));
        }
        // SAFETY: both ranges lie inside live allocations; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src.as_ptr(), dst.as_ptr(), size) };
        Ok(())
    }

    fn assign_agent(&self, ptr: NonNull<u8>, agent: AgentHandle) -> PlatformResult<()> {
        self.state.enter("assign_agent")?;
        if self.state.agent(agent).is_none() {
            return Err(PlatformError::new("assign_agent", PlatformStatus::InvalidAgent));
        }
        let mut allocations = self.state.allocations.lock();
        let allocation = allocations
            .get_mut(&(ptr.as_ptr() as usize))
            .ok_or(PlatformError::new("assign_agent", PlatformStatus::InvalidAllocation))?;
        allocation.owner = agent;
        Ok(())
    }

    fn deserialize_code_object(&self, blob: &[u8]) -> PlatformResult<CodeObjectHandle> {
        const OP: &str = "deserialize_code_object";
        self.state.enter(OP)?;
        let code_object =
            SimCodeObject::parse(blob).ok_or(PlatformError::new(OP, PlatformStatus::InvalidCodeObject))?;
        let handle = CodeObjectHandle(self.state.handle());
        self.state.code_objects.lock().insert(handle, code_object);
        Ok(handle)
    }

    fn destroy_code_object(&self, code_object: CodeObjectHandle) -> PlatformResult<()> {
        self.state.enter("destroy_code_object")?;
        self.state
            .code_objects
            .lock()
            .remove(&code_object)
            .map(|_| ())
            .ok_or(PlatformError::new("destroy_code_object", PlatformStatus::InvalidCodeObject))
    }

    fn create_executable(&self) -> PlatformResult<ExecutableHandle> {
        self.state.enter("create_executable")?;
        let handle = ExecutableHandle(self.state.handle());
        self.state.executables.lock().insert(
            handle,
            SimExecutable {
                frozen: false,
                symbols: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        agent: AgentHandle,
        code_object: CodeObjectHandle,
    ) -> PlatformResult<()> {
        const OP: &str = "load_code_object";
        self.state.enter(OP)?;
        if !self.state.is_accelerator(agent) {
            return Err(PlatformError::new(OP, PlatformStatus::InvalidAgent));
        }
        let kernels = self
            .state
            .code_objects
            .lock()
            .get(&code_object)
            .map(|c| c.kernels.clone())
            .ok_or(PlatformError::new(OP, PlatformStatus::InvalidCodeObject))?;

        let mut executables = self.state.executables.lock();
        let exe = executables
            .get_mut(&executable)
            .ok_or(PlatformError::new(OP, PlatformStatus::InvalidExecutable))?;
        if exe.frozen {
            return Err(PlatformError::new(OP, PlatformStatus::FrozenExecutable));
        }

        let mut symbols = self.state.symbols.write();
        let mut kernel_objects = self.state.kernel_objects.write();
        for name in kernels {
            let symbol = SymbolHandle(self.state.handle());
            let kernel_object = KernelObject(self.state.handle());
            kernel_objects.insert(kernel_object, name.clone());
            symbols.insert(
                symbol,
                SimSymbol {
                    name,
                    agent,
                    executable,
                    kernel_object,
                },
            );
            exe.symbols.push(symbol);
        }
        Ok(())
    }

    fn freeze_executable(&self, executable: ExecutableHandle) -> PlatformResult<()> {
        const OP: &str = "freeze_executable";
        self.state.enter(OP)?;
        let mut executables = self.state.executables.lock();
        let exe = executables
            .get_mut(&executable)
            .ok_or(PlatformError::new(OP, PlatformStatus::InvalidExecutable))?;
        if exe.frozen {
            return Err(PlatformError::new(OP, PlatformStatus::FrozenExecutable));
        }
        exe.frozen = true;
        Ok(())
    }

    fn destroy_executable(&self, executable: ExecutableHandle) -> PlatformResult<()> {
        const OP: &str = "destroy_executable";
        self.state.enter(OP)?;
        let exe = self
            .state
            .executables
            .lock()
            .remove(&executable)
            .ok_or(PlatformError::new(OP, PlatformStatus::InvalidExecutable))?;
        let mut symbols = self.state.symbols.write();
        let mut kernel_objects = self.state.kernel_objects.write();
        for symbol in exe.symbols {
            if let Some(s) = symbols.remove(&symbol) {
                kernel_objects.remove(&s.kernel_object);
            }
        }
        Ok(())
    }

    fn get_symbol(
        &self,
        executable: ExecutableHandle,
        name: &str,
        agent: AgentHandle,
    ) -> PlatformResult<SymbolHandle> {
        const OP: &str = "get_symbol";
        self.state.enter(OP)?;
        if !self.state.executables.lock().contains_key(&executable) {
            return Err(PlatformError::new(OP, PlatformStatus::InvalidExecutable));
        }
        self.state
            .symbols
            .read()
            .iter()
            .find(|(_, s)| s.executable == executable && s.agent == agent && s.name == name)
            .map(|(handle, _)| *handle)
            .ok_or(PlatformError::new(OP, PlatformStatus::InvalidSymbolName))
    }

    fn kernel_object(&self, symbol: SymbolHandle) -> PlatformResult<KernelObject> {
        self.state.enter("kernel_object")?;
        self.state
            .symbols
            .read()
            .get(&symbol)
            .map(|s| s.kernel_object)
            .ok_or(PlatformError::new("kernel_object", PlatformStatus::InvalidArgument))
    }

    fn signal_create(&self, initial: i64) -> PlatformResult<SignalHandle> {
        self.state.enter("signal_create")?;
        let handle = SignalHandle(self.state.handle());
        self.state.signals.write().insert(
            handle,
            Arc::new(SimSignal {
                value: AtomicI64::new(initial),
                lock: Mutex::new(()),
                changed: Condvar::new(),
            }),
        );
        Ok(handle)
    }

    fn signal_destroy(&self, signal: SignalHandle) -> PlatformResult<()> {
        self.state.enter("signal_destroy")?;
        self.state
            .signals
            .write()
            .remove(&signal)
            .map(|_| ())
            .ok_or(PlatformError::new("signal_destroy", PlatformStatus::InvalidSignal))
    }

    fn signal_load(&self, signal: SignalHandle) -> i64 {
        match self.state.signal(signal) {
            Some(s) => s.value.load(Ordering::Acquire),
            None => {
                log::error!("Signal {signal} does not exist");
                i64::MIN
            }
        }
    }

    fn signal_store(&self, signal: SignalHandle, value: i64) {
        match self.state.signal(signal) {
            Some(s) => {
                s.value.store(value, Ordering::Relaxed);
                s.notify();
            }
            None => log::error!("Signal {signal} does not exist"),
        }
    }

    fn signal_wait_eq(&self, signal: SignalHandle, value: i64, timeout: Duration) -> i64 {
        let Some(s) = self.state.signal(signal) else {
            log::error!("Signal {signal} does not exist");
            return i64::MIN;
        };
        let deadline = Instant::now() + timeout;
        let mut guard = s.lock.lock();
        loop {
            let current = s.value.load(Ordering::Acquire);
            if current == value {
                return current;
            }
            if s.changed.wait_until(&mut guard, deadline).timed_out() {
                return s.value.load(Ordering::Acquire);
            }
        }
    }
}

/// Ring memory and indices shared between producers and the consumer thread
struct Ring {
    id: u64,
    base: NonNull<u8>,
    layout: Layout,
    capacity: u32,
    write_index: AtomicU64,
    read_index: AtomicU64,
    /// Highest index rung so far, -1 before the first ring
    doorbell: AtomicI64,
    bell: Mutex<()>,
    rung: Condvar,
    stop: AtomicBool,
}

// The ring is plain shared memory; every cross-thread access goes through
// the atomic indices and slot headers.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    fn new(id: u64, capacity: u32) -> Option<Self> {
        let layout = Layout::from_size_align(capacity as usize * PACKET_SIZE, PACKET_SIZE).ok()?;
        // SAFETY: capacity is non-zero, so the layout is too.
        let base = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        let ring = Self {
            id,
            base,
            layout,
            capacity,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            doorbell: AtomicI64::new(-1),
            bell: Mutex::new(()),
            rung: Condvar::new(),
            stop: AtomicBool::new(false),
        };
        for index in 0..capacity as u64 {
            ring.header(index).store(INVALID_HEADER, Ordering::Relaxed);
        }
        Some(ring)
    }

    /// Whether the producer side has announced `index`
    fn rung_for(&self, index: u64) -> bool {
        self.doorbell.load(Ordering::Acquire) >= index as i64
    }

    fn slot(&self, index: u64) -> *mut u8 {
        let position = (index & (self.capacity as u64 - 1)) as usize;
        // SAFETY: position < capacity, so the slot is inside the ring.
        unsafe { self.base.as_ptr().add(position * PACKET_SIZE) }
    }

    /// The slot's control word
    fn header(&self, index: u64) -> &AtomicU32 {
        // SAFETY: slots are 64-byte aligned and live as long as the ring.
        unsafe { &*(self.slot(index) as *const AtomicU32) }
    }

    /// Copy the packet body (everything past the control word)
    fn read_body(&self, index: u64, control: u32) -> KernelDispatchPacket {
        let mut packet = KernelDispatchPacket::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut packet);
        // SAFETY: the acquire load of `control` orders these reads after the
        // producer's writes; the slot is not reused before the read index moves.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot(index).add(4), bytes[4..].as_mut_ptr(), PACKET_SIZE - 4)
        };
        packet.header = control as u16;
        packet.setup = (control >> 16) as u16;
        packet
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // SAFETY: allocated in `Ring::new` with this layout.
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// A simulated hardware queue with its packet-processor thread
struct SimQueue {
    ring: Arc<Ring>,
    worker: Option<JoinHandle<()>>,
}

impl SimQueue {
    fn spawn(id: u64, capacity: u32, state: Arc<SimState>) -> Option<Self> {
        let ring = Arc::new(Ring::new(id, capacity)?);
        let consumer = ring.clone();
        let worker = std::thread::Builder::new()
            .name(format!("sim-queue-{id}"))
            .spawn(move || consume(&consumer, &state))
            .ok()?;
        log::debug!("Sim queue {id} started with {capacity} slots");
        Some(Self {
            ring,
            worker: Some(worker),
        })
    }
}

impl HardwareQueue for SimQueue {
    fn id(&self) -> u64 {
        self.ring.id
    }

    fn base_address(&self) -> NonNull<u8> {
        self.ring.base
    }

    fn capacity(&self) -> u32 {
        self.ring.capacity
    }

    fn add_write_index(&self, count: u64) -> u64 {
        self.ring.write_index.fetch_add(count, Ordering::Relaxed)
    }

    fn load_write_index(&self) -> u64 {
        self.ring.write_index.load(Ordering::Relaxed)
    }

    fn load_read_index(&self) -> u64 {
        self.ring.read_index.load(Ordering::Acquire)
    }

    fn ring_doorbell(&self, index: u64) {
        // Producers ring out of order; the register only moves forward.
        self.ring.doorbell.fetch_max(index as i64, Ordering::Release);
        let _guard = self.ring.bell.lock();
        self.ring.rung.notify_one();
    }
}

impl Drop for SimQueue {
    fn drop(&mut self) {
        {
            let _guard = self.ring.bell.lock();
            self.ring.stop.store(true, Ordering::Release);
            self.ring.rung.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Sim queue {} consumer panicked", self.ring.id);
            }
        }
        log::debug!("Sim queue {} stopped", self.ring.id);
    }
}

/// Packet-processor loop: retire packets strictly in index order
fn consume(ring: &Ring, state: &SimState) {
    loop {
        // Only this thread writes the read index.
        let index = ring.read_index.load(Ordering::Relaxed);
        let header = ring.header(index);
        let ready = |control: u32| ring.rung_for(index) && packet_type(control) != PACKET_TYPE_INVALID;
        let control = header.load(Ordering::Acquire);

        // Nothing is taken before the doorbell announces it, whatever the header says.
        if !ready(control) {
            let mut guard = ring.bell.lock();
            if ring.stop.load(Ordering::Acquire) {
                break;
            }
            if !ready(header.load(Ordering::Acquire)) {
                ring.rung.wait_for(&mut guard, IDLE_WAIT);
            }
            continue;
        }

        let doorbell = ring.doorbell.load(Ordering::Acquire);
        let packet = ring.read_body(index, control);
        log::trace!("Sim queue {}: packet {} (doorbell {})", ring.id, index, doorbell);
        let fault = state.execute(&packet, index);

        header.store(INVALID_HEADER, Ordering::Release);
        ring.read_index.store(index + 1, Ordering::Release);

        let completion_signal = SignalHandle(packet.completion_signal);
        state.records.push(PacketRecord {
            queue_id: ring.id,
            index,
            control,
            kernel_object: KernelObject(packet.kernel_object),
            grid: Dim3::new(packet.grid_size_x, packet.grid_size_y, packet.grid_size_z),
            workgroup: Dim3::new(
                packet.workgroup_size_x,
                packet.workgroup_size_y,
                packet.workgroup_size_z,
            ),
            kernarg_address: packet.kernarg_address,
            completion_signal,
            doorbell,
            fault,
        });

        // Completion is the last observable effect of a packet.
        if completion_signal.is_valid() {
            state.signal_add(completion_signal, -1);
        }
    }
}
