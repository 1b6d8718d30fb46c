/// Region Allocator - "The Shared Memory"
///
/// Raw region-backed allocations on the accelerator. Each buffer remembers
/// the class it came from so host-side access to device-local memory is
/// refused instead of faulting.

use super::agent::Agent;
use super::Runtime;
use crate::error::{DispatchError, Result};
use crate::types::{AgentHandle, RegionClass};
use bytemuck::Pod;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct AllocationRecord {
    class: RegionClass,
    size: usize,
}

type LiveMap = Arc<RwLock<HashMap<usize, AllocationRecord>>>;

/// Allocates buffers from an agent's classified regions
pub struct RegionAllocator {
    runtime: Runtime,
    agent: Agent,
    live: LiveMap,
}

impl RegionAllocator {
    pub fn new(runtime: Runtime, agent: &Agent) -> Self {
        log::info!("Initializing region allocator for {}", agent.name);
        Self {
            runtime,
            agent: agent.clone(),
            live: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Allocate `size` bytes from the region of `class`
    pub fn allocate(&self, class: RegionClass, size: usize) -> Result<RegionBuffer> {
        let region = self.agent.region(class).map_err(|e| {
            log::error!("Cannot allocate {size} bytes: {e}");
            e
        })?;

        let ptr = self.runtime.platform().allocate(region, size).map_err(|e| {
            log::error!("{e}");
            DispatchError::from(e)
        })?;

        self.live
            .write()
            .insert(ptr.as_ptr() as usize, AllocationRecord { class, size });
        log::debug!("Allocated {size} bytes in {class} at {:p}", ptr.as_ptr());

        Ok(RegionBuffer {
            ptr,
            size,
            class,
            runtime: self.runtime.clone(),
            live: self.live.clone(),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The agent whose regions back this allocator
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Total live bytes across all classes
    pub fn total_allocated(&self) -> usize {
        self.live.read().values().map(|r| r.size).sum()
    }

    /// Live bytes in one class
    pub fn allocated_in(&self, class: RegionClass) -> usize {
        self.live
            .read()
            .values()
            .filter(|r| r.class == class)
            .map(|r| r.size)
            .sum()
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.live.read().len()
    }
}

/// A live region-backed allocation, freed on drop
pub struct RegionBuffer {
    ptr: NonNull<u8>,
    size: usize,
    class: RegionClass,
    runtime: Runtime,
    live: LiveMap,
}

// The pointer refers to platform memory shared with the accelerator; the
// buffer itself carries no thread affinity.
unsafe impl Send for RegionBuffer {}
unsafe impl Sync for RegionBuffer {}

impl RegionBuffer {
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Address as seen by the accelerator, for kernargs and packets
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn class(&self) -> RegionClass {
        self.class
    }

    fn check_host_access(&self, offset: usize, len: usize) -> Result<()> {
        if !self.class.is_host_accessible() {
            return Err(DispatchError::NotHostAccessible(self.class));
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(DispatchError::OutOfBounds {
                offset,
                size: len,
                buffer_size: self.size,
            });
        }
        Ok(())
    }

    pub fn write_pod<T: Pod>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.copy_from_slice(offset, bytemuck::bytes_of(value))
    }

    pub fn read_pod<T: Pod>(&self, offset: usize) -> Result<T> {
        self.check_host_access(offset, std::mem::size_of::<T>())?;
        // SAFETY: bounds checked above; Pod accepts any bit pattern.
        Ok(unsafe { std::ptr::read_unaligned(self.ptr.as_ptr().add(offset) as *const T) })
    }

    pub fn copy_from_slice(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_host_access(offset, bytes.len())?;
        // SAFETY: bounds checked above; `bytes` cannot alias platform memory
        // we hold exclusively through `&mut self`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Borrow the whole buffer as host bytes
    pub fn as_bytes(&self) -> Result<&[u8]> {
        self.check_host_access(0, self.size)?;
        // SAFETY: the allocation is `size` bytes, host accessible and lives
        // as long as `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) })
    }

    /// Host copy of the whole buffer
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.as_bytes().map(<[u8]>::to_vec)
    }

    /// Read the buffer as a sequence of `T`
    pub fn to_pod_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let bytes = self.to_vec()?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Platform copy into `dst`; works for device-local memory on either side
    pub fn copy_to(&self, dst: &mut RegionBuffer) -> Result<()> {
        if dst.size < self.size {
            return Err(DispatchError::OutOfBounds {
                offset: 0,
                size: self.size,
                buffer_size: dst.size,
            });
        }
        self.runtime
            .platform()
            .memory_copy(dst.ptr, self.ptr, self.size)?;
        Ok(())
    }

    /// Hand ownership of the memory to `agent`
    pub fn assign_agent(&self, agent: AgentHandle) -> Result<()> {
        self.runtime.platform().assign_agent(self.ptr, agent)?;
        Ok(())
    }
}

impl std::fmt::Debug for RegionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionBuffer")
            .field("address", &format_args!("0x{:x}", self.address()))
            .field("size", &self.size)
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for RegionBuffer {
    fn drop(&mut self) {
        self.live.write().remove(&(self.ptr.as_ptr() as usize));
        if let Err(e) = self.runtime.platform().free(self.ptr) {
            log::error!("{e}");
        } else {
            log::debug!("Freed {} bytes at {:p}", self.size, self.ptr.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::agent::discover_agents;
    use crate::hal::sim::SimPlatform;
    use crate::types::SelectionPolicy;

    fn setup(sim: SimPlatform) -> (RegionAllocator, Agent) {
        let rt = Runtime::new(Arc::new(sim)).unwrap();
        let topo = discover_agents(&rt, &SelectionPolicy::Last, &SelectionPolicy::Last).unwrap();
        (RegionAllocator::new(rt, &topo.accelerator), topo.host)
    }

    #[test]
    fn allocate_write_read_free() {
        let (alloc, _) = setup(SimPlatform::builder().build());
        let mut buf = alloc.allocate(RegionClass::Kernarg, 64).unwrap();
        buf.write_pod(8, &0xdead_beef_u64).unwrap();
        assert_eq!(buf.read_pod::<u64>(8).unwrap(), 0xdead_beef);
        assert_eq!(alloc.allocation_count(), 1);
        assert_eq!(alloc.allocated_in(RegionClass::Kernarg), 64);

        assert!(matches!(
            buf.write_pod(60, &1u64),
            Err(DispatchError::OutOfBounds { .. })
        ));

        drop(buf);
        assert_eq!(alloc.total_allocated(), 0);
    }

    #[test]
    fn device_local_needs_platform_copy() {
        let (alloc, host) = setup(SimPlatform::builder().build());
        let mut dev = alloc.allocate(RegionClass::DeviceLocal, 16).unwrap();
        assert!(matches!(dev.to_vec(), Err(DispatchError::NotHostAccessible(_))));

        let mut staging = alloc.allocate(RegionClass::HostVisibleLocal, 16).unwrap();
        staging.copy_from_slice(0, &[7u8; 16]).unwrap();
        staging.copy_to(&mut dev).unwrap();

        let mut back = alloc.allocate(RegionClass::HostVisibleLocal, 16).unwrap();
        dev.assign_agent(host.handle).unwrap();
        dev.copy_to(&mut back).unwrap();
        assert_eq!(back.to_vec().unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn missing_class_fails_at_allocation() {
        let sim = SimPlatform::builder().without_region(RegionClass::DeviceLocal).build();
        let (alloc, _) = setup(sim);
        assert!(matches!(
            alloc.allocate(RegionClass::DeviceLocal, 16),
            Err(DispatchError::RegionUnavailable(RegionClass::DeviceLocal))
        ));
        assert!(alloc.allocate(RegionClass::System, 16).is_ok());
    }
}
