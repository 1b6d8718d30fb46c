/// HSA Backend - "The Real Thing"
///
/// Loads `libhsa-runtime64` at runtime and forwards every platform call to
/// it. Only the AMD GPU driver is required, not a ROCm toolkit.

use super::{HardwareQueue, Platform, PlatformResult};
use crate::error::{PlatformError, PlatformStatus};
use crate::types::{
    AgentHandle, AgentInfo, CodeObjectHandle, DeviceType, ExecutableHandle, KernelObject,
    RegionFlags, RegionHandle, RegionInfo, RegionSegment, SignalHandle, SymbolHandle,
};
use bytemuck::Zeroable;
use libloading::Library;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Status = u32;
const STATUS_SUCCESS: Status = 0;

const AGENT_INFO_NAME: u32 = 0;
const AGENT_INFO_QUEUE_MAX_SIZE: u32 = 14;
const AGENT_INFO_DEVICE: u32 = 17;

const DEVICE_TYPE_CPU: u32 = 0;
const DEVICE_TYPE_GPU: u32 = 1;

const REGION_INFO_SEGMENT: u32 = 0;
const REGION_INFO_GLOBAL_FLAGS: u32 = 1;
const REGION_INFO_SIZE: u32 = 2;
const AMD_REGION_INFO_HOST_ACCESSIBLE: u32 = 0xA001;

const REGION_GLOBAL_FLAG_KERNARG: u32 = 1;
const REGION_GLOBAL_FLAG_FINE_GRAINED: u32 = 2;
const REGION_GLOBAL_FLAG_COARSE_GRAINED: u32 = 4;

const SYSTEM_INFO_TIMESTAMP_FREQUENCY: u32 = 3;

const SIGNAL_CONDITION_EQ: u32 = 0;
const WAIT_STATE_BLOCKED: u32 = 0;

const QUEUE_TYPE_MULTI: u32 = 0;
const PROFILE_FULL: u32 = 1;
const EXECUTABLE_STATE_UNFROZEN: u32 = 0;
const EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT: u32 = 22;
const ACCESS_PERMISSION_RW: u32 = 3;

const LIBRARY_NAMES: &[&str] = &[
    "libhsa-runtime64.so",
    "libhsa-runtime64.so.1",
    "/opt/rocm/lib/libhsa-runtime64.so",
    "/opt/rocm/lib64/libhsa-runtime64.so",
];

/// `hsa_queue_t`
#[allow(dead_code)]
#[repr(C)]
struct RawQueue {
    queue_type: u32,
    features: u32,
    base_address: *mut c_void,
    doorbell_signal: u64,
    size: u32,
    reserved1: u32,
    id: u64,
}

type IterateCallback = unsafe extern "C" fn(u64, *mut c_void) -> Status;

macro_rules! hsa_functions {
    ($($name:ident: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        struct HsaFns {
            $($name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl HsaFns {
            /// # Safety
            /// The symbols must have the declared signatures.
            unsafe fn load(lib: &Library) -> Result<Self, libloading::Error> {
                Ok(Self {
                    $($name: *lib.get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                        concat!(stringify!($name), "\0").as_bytes(),
                    )?,)*
                })
            }
        }
    };
}

hsa_functions! {
    hsa_init: fn() -> Status;
    hsa_shut_down: fn() -> Status;
    hsa_system_get_info: fn(u32, *mut c_void) -> Status;
    hsa_iterate_agents: fn(IterateCallback, *mut c_void) -> Status;
    hsa_agent_get_info: fn(u64, u32, *mut c_void) -> Status;
    hsa_agent_iterate_regions: fn(u64, IterateCallback, *mut c_void) -> Status;
    hsa_region_get_info: fn(u64, u32, *mut c_void) -> Status;
    hsa_queue_create: fn(u64, u32, u32, *mut c_void, *mut c_void, u32, u32, *mut *mut RawQueue) -> Status;
    hsa_queue_destroy: fn(*mut RawQueue) -> Status;
    hsa_queue_add_write_index_relaxed: fn(*const RawQueue, u64) -> u64;
    hsa_queue_load_write_index_relaxed: fn(*const RawQueue) -> u64;
    hsa_queue_load_read_index_scacquire: fn(*const RawQueue) -> u64;
    hsa_signal_create: fn(i64, u32, *const u64, *mut u64) -> Status;
    hsa_signal_destroy: fn(u64) -> Status;
    hsa_signal_load_scacquire: fn(u64) -> i64;
    hsa_signal_store_relaxed: fn(u64, i64);
    hsa_signal_wait_scacquire: fn(u64, u32, i64, u64, u32) -> i64;
    hsa_memory_allocate: fn(u64, usize, *mut *mut c_void) -> Status;
    hsa_memory_free: fn(*mut c_void) -> Status;
    hsa_memory_copy: fn(*mut c_void, *const c_void, usize) -> Status;
    hsa_memory_assign_agent: fn(*mut c_void, u64, u32) -> Status;
    hsa_code_object_deserialize: fn(*mut c_void, usize, *const c_char, *mut u64) -> Status;
    hsa_code_object_destroy: fn(u64) -> Status;
    hsa_executable_create: fn(u32, u32, *const c_char, *mut u64) -> Status;
    hsa_executable_load_code_object: fn(u64, u64, u64, *const c_char) -> Status;
    hsa_executable_freeze: fn(u64, *const c_char) -> Status;
    hsa_executable_destroy: fn(u64) -> Status;
    hsa_executable_get_symbol: fn(u64, *const c_char, *const c_char, u64, i32, *mut u64) -> Status;
    hsa_executable_symbol_get_info: fn(u64, u32, *mut c_void) -> Status;
    hsa_status_string: fn(Status, *mut *const c_char) -> Status;
}

struct HsaLib {
    fns: HsaFns,
    _lib: Library,
}

impl HsaLib {
    fn check(&self, op: &'static str, status: Status) -> PlatformResult<()> {
        if status == STATUS_SUCCESS {
            return Ok(());
        }
        let mut text: *const c_char = ptr::null();
        // SAFETY: hsa_status_string writes a static string or leaves the pointer null.
        unsafe { (self.fns.hsa_status_string)(status, &mut text) };
        if !text.is_null() {
            // SAFETY: non-null results are NUL-terminated static strings.
            let text = unsafe { CStr::from_ptr(text) };
            log::error!("{op}: {}", text.to_string_lossy());
        }
        Err(PlatformError::new(op, PlatformStatus::from_code(status)))
    }
}

/// The HSA runtime behind the `Platform` trait
pub struct HsaPlatform {
    lib: Arc<HsaLib>,
    /// System timestamp ticks per second, read at `init`
    timestamp_hz: AtomicU64,
}

impl HsaPlatform {
    /// Find and load the HSA runtime library
    pub fn load() -> PlatformResult<Self> {
        let lib = LIBRARY_NAMES
            .iter()
            // SAFETY: loading the HSA runtime runs no untrusted initializers.
            .find_map(|name| unsafe { Library::new(name).ok() })
            .ok_or_else(|| {
                log::error!("Failed to load the HSA runtime (libhsa-runtime64.so)");
                PlatformError::new("load_library", PlatformStatus::NotInitialized)
            })?;
        // SAFETY: the declared signatures follow hsa.h.
        let fns = unsafe { HsaFns::load(&lib) }.map_err(|e| {
            log::error!("HSA runtime is missing a symbol: {e}");
            PlatformError::new("load_library", PlatformStatus::NotInitialized)
        })?;
        log::info!("✓ HSA runtime library loaded");
        Ok(Self {
            lib: Arc::new(HsaLib { fns, _lib: lib }),
            timestamp_hz: AtomicU64::new(0),
        })
    }

    fn fns(&self) -> &HsaFns {
        &self.lib.fns
    }

    fn check(&self, op: &'static str, status: Status) -> PlatformResult<()> {
        self.lib.check(op, status)
    }

    fn iterate(
        &self,
        op: &'static str,
        iterate: impl FnOnce(IterateCallback, *mut c_void) -> Status,
    ) -> PlatformResult<Vec<u64>> {
        unsafe extern "C" fn collect(handle: u64, data: *mut c_void) -> Status {
            // SAFETY: `data` is the Vec passed below, alive for the iteration.
            let handles = unsafe { &mut *(data as *mut Vec<u64>) };
            handles.push(handle);
            STATUS_SUCCESS
        }
        let mut handles: Vec<u64> = Vec::new();
        let status = iterate(collect, &mut handles as *mut Vec<u64> as *mut c_void);
        self.check(op, status)?;
        Ok(handles)
    }

    fn agent_info<T: Zeroable>(&self, agent: u64, attribute: u32) -> PlatformResult<T> {
        let mut value = T::zeroed();
        // SAFETY: `T` matches the attribute's documented type at every call site.
        let status = unsafe { (self.fns().hsa_agent_get_info)(agent, attribute, &mut value as *mut T as *mut c_void) };
        self.check("hsa_agent_get_info", status)?;
        Ok(value)
    }

    fn region_info<T: Zeroable>(&self, region: u64, attribute: u32) -> PlatformResult<T> {
        let mut value = T::zeroed();
        // SAFETY: as for `agent_info`.
        let status = unsafe { (self.fns().hsa_region_get_info)(region, attribute, &mut value as *mut T as *mut c_void) };
        self.check("hsa_region_get_info", status)?;
        Ok(value)
    }
}

impl Platform for HsaPlatform {
    fn name(&self) -> &str {
        "hsa"
    }

    fn init(&self) -> PlatformResult<()> {
        // SAFETY: plain FFI call without arguments.
        self.check("hsa_init", unsafe { (self.fns().hsa_init)() })?;

        let mut hz: u64 = 0;
        // SAFETY: the attribute is a `uint64_t`.
        let status = unsafe {
            (self.fns().hsa_system_get_info)(SYSTEM_INFO_TIMESTAMP_FREQUENCY, &mut hz as *mut u64 as *mut c_void)
        };
        self.check("hsa_system_get_info", status)?;
        log::debug!("HSA timestamp frequency: {hz} Hz");
        self.timestamp_hz.store(hz, Ordering::Relaxed);
        Ok(())
    }

    fn shut_down(&self) -> PlatformResult<()> {
        // SAFETY: as above.
        self.check("hsa_shut_down", unsafe { (self.fns().hsa_shut_down)() })
    }

    fn agents(&self) -> PlatformResult<Vec<AgentInfo>> {
        let iterate = self.fns().hsa_iterate_agents;
        // SAFETY: callback and data follow the iteration contract.
        let handles = self.iterate("hsa_iterate_agents", |cb, data| unsafe { iterate(cb, data) })?;
        handles
            .into_iter()
            .map(|handle| {
                let device = match self.agent_info::<u32>(handle, AGENT_INFO_DEVICE)? {
                    DEVICE_TYPE_CPU => DeviceType::Cpu,
                    DEVICE_TYPE_GPU => DeviceType::Gpu,
                    other => DeviceType::Other(other),
                };
                let name: [u8; 64] = self.agent_info(handle, AGENT_INFO_NAME)?;
                let name = CStr::from_bytes_until_nul(&name)
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(AgentInfo {
                    handle: AgentHandle(handle),
                    device,
                    name,
                })
            })
            .collect()
    }

    fn regions(&self, agent: AgentHandle) -> PlatformResult<Vec<RegionInfo>> {
        let iterate = self.fns().hsa_agent_iterate_regions;
        // SAFETY: as in `agents`.
        let handles = self.iterate("hsa_agent_iterate_regions", |cb, data| unsafe {
            iterate(agent.0, cb, data)
        })?;
        handles
            .into_iter()
            .map(|handle| {
                let segment = match self.region_info::<u32>(handle, REGION_INFO_SEGMENT)? {
                    0 => RegionSegment::Global,
                    1 => RegionSegment::ReadOnly,
                    2 => RegionSegment::Private,
                    3 => RegionSegment::Group,
                    _ => RegionSegment::Kernarg,
                };
                let mut flags = RegionFlags::empty();
                if segment == RegionSegment::Global {
                    let global: u32 = self.region_info(handle, REGION_INFO_GLOBAL_FLAGS)?;
                    flags.set(RegionFlags::KERNARG, global & REGION_GLOBAL_FLAG_KERNARG != 0);
                    flags.set(RegionFlags::FINE_GRAINED, global & REGION_GLOBAL_FLAG_FINE_GRAINED != 0);
                    flags.set(RegionFlags::COARSE_GRAINED, global & REGION_GLOBAL_FLAG_COARSE_GRAINED != 0);
                    let host: bool = self.region_info(handle, AMD_REGION_INFO_HOST_ACCESSIBLE)?;
                    flags.set(RegionFlags::HOST_ACCESSIBLE, host);
                }
                Ok(RegionInfo {
                    handle: RegionHandle(handle),
                    segment,
                    flags,
                    size: self.region_info(handle, REGION_INFO_SIZE)?,
                })
            })
            .collect()
    }

    fn queue_max_size(&self, agent: AgentHandle) -> PlatformResult<u32> {
        self.agent_info(agent.0, AGENT_INFO_QUEUE_MAX_SIZE)
    }

    fn create_queue(&self, agent: AgentHandle, size: u32) -> PlatformResult<Arc<dyn HardwareQueue>> {
        let mut raw: *mut RawQueue = ptr::null_mut();
        // SAFETY: no error callback; the runtime fills `raw` on success.
        let status = unsafe {
            (self.fns().hsa_queue_create)(
                agent.0,
                size,
                QUEUE_TYPE_MULTI,
                ptr::null_mut(),
                ptr::null_mut(),
                u32::MAX,
                u32::MAX,
                &mut raw,
            )
        };
        self.check("hsa_queue_create", status)?;
        let raw = NonNull::new(raw).ok_or(PlatformError::new("hsa_queue_create", PlatformStatus::InvalidQueue))?;
        Ok(Arc::new(HsaQueue {
            raw,
            lib: self.lib.clone(),
        }))
    }

    fn allocate(&self, region: RegionHandle, size: usize) -> PlatformResult<NonNull<u8>> {
        let mut out: *mut c_void = ptr::null_mut();
        // SAFETY: the runtime writes the allocation address into `out`.
        let status = unsafe { (self.fns().hsa_memory_allocate)(region.0, size, &mut out) };
        self.check("hsa_memory_allocate", status)?;
        NonNull::new(out as *mut u8).ok_or(PlatformError::new("hsa_memory_allocate", PlatformStatus::OutOfResources))
    }

    fn free(&self, ptr: NonNull<u8>) -> PlatformResult<()> {
        // SAFETY: `ptr` came from `hsa_memory_allocate`.
        self.check("hsa_memory_free", unsafe { (self.fns().hsa_memory_free)(ptr.as_ptr() as *mut c_void) })
    }

    fn memory_copy(&self, dst: NonNull<u8>, src: NonNull<u8>, size: usize) -> PlatformResult<()> {
        // SAFETY: both pointers are runtime allocations of at least `size` bytes.
        let status = unsafe {
            (self.fns().hsa_memory_copy)(dst.as_ptr() as *mut c_void, src.as_ptr() as *const c_void, size)
        };
        self.check("hsa_memory_copy", status)
    }

    fn assign_agent(&self, ptr: NonNull<u8>, agent: AgentHandle) -> PlatformResult<()> {
        // SAFETY: `ptr` is a runtime allocation.
        let status = unsafe {
            (self.fns().hsa_memory_assign_agent)(ptr.as_ptr() as *mut c_void, agent.0, ACCESS_PERMISSION_RW)
        };
        self.check("hsa_memory_assign_agent", status)
    }

    fn deserialize_code_object(&self, blob: &[u8]) -> PlatformResult<CodeObjectHandle> {
        let mut handle = 0u64;
        // SAFETY: the runtime only reads `blob`.
        let status = unsafe {
            (self.fns().hsa_code_object_deserialize)(blob.as_ptr() as *mut c_void, blob.len(), ptr::null(), &mut handle)
        };
        self.check("hsa_code_object_deserialize", status)?;
        Ok(CodeObjectHandle(handle))
    }

    fn destroy_code_object(&self, code_object: CodeObjectHandle) -> PlatformResult<()> {
        // SAFETY: plain handle argument.
        self.check("hsa_code_object_destroy", unsafe { (self.fns().hsa_code_object_destroy)(code_object.0) })
    }

    fn create_executable(&self) -> PlatformResult<ExecutableHandle> {
        let mut handle = 0u64;
        // SAFETY: no options string.
        let status = unsafe {
            (self.fns().hsa_executable_create)(PROFILE_FULL, EXECUTABLE_STATE_UNFROZEN, ptr::null(), &mut handle)
        };
        self.check("hsa_executable_create", status)?;
        Ok(ExecutableHandle(handle))
    }

    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        agent: AgentHandle,
        code_object: CodeObjectHandle,
    ) -> PlatformResult<()> {
        // SAFETY: plain handle arguments.
        let status = unsafe {
            (self.fns().hsa_executable_load_code_object)(executable.0, agent.0, code_object.0, ptr::null())
        };
        self.check("hsa_executable_load_code_object", status)
    }

    fn freeze_executable(&self, executable: ExecutableHandle) -> PlatformResult<()> {
        // SAFETY: plain handle argument.
        self.check("hsa_executable_freeze", unsafe {
            (self.fns().hsa_executable_freeze)(executable.0, ptr::null())
        })
    }

    fn destroy_executable(&self, executable: ExecutableHandle) -> PlatformResult<()> {
        // SAFETY: plain handle argument.
        self.check("hsa_executable_destroy", unsafe { (self.fns().hsa_executable_destroy)(executable.0) })
    }

    fn get_symbol(
        &self,
        executable: ExecutableHandle,
        name: &str,
        agent: AgentHandle,
    ) -> PlatformResult<SymbolHandle> {
        let name = CString::new(name)
            .map_err(|_| PlatformError::new("hsa_executable_get_symbol", PlatformStatus::InvalidSymbolName))?;
        let mut symbol = 0u64;
        // SAFETY: `name` is NUL-terminated and outlives the call.
        let status = unsafe {
            (self.fns().hsa_executable_get_symbol)(executable.0, ptr::null(), name.as_ptr(), agent.0, 0, &mut symbol)
        };
        self.check("hsa_executable_get_symbol", status)?;
        Ok(SymbolHandle(symbol))
    }

    fn kernel_object(&self, symbol: SymbolHandle) -> PlatformResult<KernelObject> {
        let mut object = 0u64;
        // SAFETY: KERNEL_OBJECT is a u64 attribute.
        let status = unsafe {
            (self.fns().hsa_executable_symbol_get_info)(
                symbol.0,
                EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT,
                &mut object as *mut u64 as *mut c_void,
            )
        };
        self.check("hsa_executable_symbol_get_info", status)?;
        Ok(KernelObject(object))
    }

    fn signal_create(&self, initial: i64) -> PlatformResult<SignalHandle> {
        let mut signal = 0u64;
        // SAFETY: zero consumers, so the consumer list may be null.
        let status = unsafe { (self.fns().hsa_signal_create)(initial, 0, ptr::null(), &mut signal) };
        self.check("hsa_signal_create", status)?;
        Ok(SignalHandle(signal))
    }

    fn signal_destroy(&self, signal: SignalHandle) -> PlatformResult<()> {
        // SAFETY: plain handle argument.
        self.check("hsa_signal_destroy", unsafe { (self.fns().hsa_signal_destroy)(signal.0) })
    }

    fn signal_load(&self, signal: SignalHandle) -> i64 {
        // SAFETY: plain handle argument.
        unsafe { (self.fns().hsa_signal_load_scacquire)(signal.0) }
    }

    fn signal_store(&self, signal: SignalHandle, value: i64) {
        // SAFETY: plain handle argument.
        unsafe { (self.fns().hsa_signal_store_relaxed)(signal.0, value) }
    }

    fn signal_wait_eq(&self, signal: SignalHandle, value: i64, timeout: Duration) -> i64 {
        let hint = timeout_ticks(timeout, self.timestamp_hz.load(Ordering::Relaxed));
        // SAFETY: plain handle argument; the timeout is only a hint.
        unsafe {
            (self.fns().hsa_signal_wait_scacquire)(signal.0, SIGNAL_CONDITION_EQ, value, hint, WAIT_STATE_BLOCKED)
        }
    }
}

/// Convert a timeout to system timestamp ticks, the unit of
/// `hsa_signal_wait_*` hints. An unknown frequency falls back to nanoseconds.
fn timeout_ticks(timeout: Duration, timestamp_hz: u64) -> u64 {
    let ticks = match timestamp_hz {
        0 => timeout.as_nanos(),
        hz => timeout.as_nanos() * hz as u128 / 1_000_000_000,
    };
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// A runtime-owned AQL queue
struct HsaQueue {
    raw: NonNull<RawQueue>,
    lib: Arc<HsaLib>,
}

// The queue struct is owned by the runtime and safe to use from any thread.
unsafe impl Send for HsaQueue {}
unsafe impl Sync for HsaQueue {}

impl HsaQueue {
    fn raw(&self) -> &RawQueue {
        // SAFETY: valid until `hsa_queue_destroy` in Drop.
        unsafe { self.raw.as_ref() }
    }
}

impl HardwareQueue for HsaQueue {
    fn id(&self) -> u64 {
        self.raw().id
    }

    fn base_address(&self) -> NonNull<u8> {
        // The runtime never hands out a queue without a ring.
        NonNull::new(self.raw().base_address as *mut u8).unwrap_or(NonNull::dangling())
    }

    fn capacity(&self) -> u32 {
        self.raw().size
    }

    fn add_write_index(&self, count: u64) -> u64 {
        // SAFETY: live queue.
        unsafe { (self.lib.fns.hsa_queue_add_write_index_relaxed)(self.raw.as_ptr(), count) }
    }

    fn load_write_index(&self) -> u64 {
        // SAFETY: live queue.
        unsafe { (self.lib.fns.hsa_queue_load_write_index_relaxed)(self.raw.as_ptr()) }
    }

    fn load_read_index(&self) -> u64 {
        // SAFETY: live queue.
        unsafe { (self.lib.fns.hsa_queue_load_read_index_scacquire)(self.raw.as_ptr()) }
    }

    fn ring_doorbell(&self, index: u64) {
        // SAFETY: the doorbell is a signal owned by the queue.
        unsafe { (self.lib.fns.hsa_signal_store_relaxed)(self.raw().doorbell_signal, index as i64) }
    }
}

impl Drop for HsaQueue {
    fn drop(&mut self) {
        // SAFETY: destroyed exactly once.
        let status = unsafe { (self.lib.fns.hsa_queue_destroy)(self.raw.as_ptr()) };
        if let Err(e) = self.lib.check("hsa_queue_destroy", status) {
            log::error!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_hint_uses_timestamp_ticks() {
        // 100 MHz timestamp counter, as on current AMD GPUs.
        assert_eq!(timeout_ticks(Duration::from_millis(10), 100_000_000), 1_000_000);
        assert_eq!(timeout_ticks(Duration::from_secs(1), 1_000_000_000), 1_000_000_000);
        assert_eq!(timeout_ticks(Duration::from_micros(3), 0), 3_000);
        assert_eq!(timeout_ticks(Duration::MAX, 100_000_000), u64::MAX);
    }
}
