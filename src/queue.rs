use crate::error::{DispatchError, Result};
use crate::hal::agent::Agent;
use crate::hal::{HardwareQueue, Runtime};
use crate::packet::{KernelDispatchPacket, PACKET_SIZE};
use crate::types::OverflowPolicy;
use crossbeam::utils::Backoff;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Ring position of `packet_index` in a ring of `capacity` slots.
///
/// `capacity` is a power of two, so masking is the modulo.
pub fn ring_position(packet_index: u64, capacity: u32) -> u64 {
    packet_index & (capacity as u64 - 1)
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: u32,
    /// Slots handed out to producers so far (the write index)
    pub reserved: u64,
    /// Packets the consumer has retired (the read index)
    pub consumed: u64,
    pub published: u64,
}

impl QueueStats {
    pub fn in_flight(&self) -> u64 {
        self.reserved.saturating_sub(self.consumed)
    }
}

/// A multi-producer command queue over a hardware ring.
///
/// Producers reserve slots with an atomic increment of the write index,
/// so concurrent submitters each get a distinct, increasing index without
/// a lock. The accelerator is the only consumer.
pub struct CommandQueue {
    hw: Arc<dyn HardwareQueue>,
    overflow: OverflowPolicy,
    published: AtomicU64,
    _runtime: Runtime,
}

/// A reserved ring slot; must be filled and published by its owner.
///
/// A slot dropped without `commit` keeps an INVALID header and stalls the
/// in-order consumer at its index.
#[must_use = "an acquired slot must be committed"]
pub(crate) struct Slot<'q> {
    queue: &'q CommandQueue,
    packet: NonNull<KernelDispatchPacket>,
    index: u64,
}

impl CommandQueue {
    /// Create a queue on `agent` sized to its maximum depth, or to
    /// `requested` when given
    pub fn create(
        runtime: &Runtime,
        agent: &Agent,
        requested: Option<u32>,
        overflow: OverflowPolicy,
    ) -> Result<Self> {
        let platform = runtime.platform();
        let max = platform.queue_max_size(agent.handle)?;
        let size = requested.unwrap_or(max);
        if size == 0 || !size.is_power_of_two() || size > max {
            return Err(DispatchError::InvalidQueueSize { requested: size, max });
        }

        let hw = platform.create_queue(agent.handle, size).map_err(|e| {
            log::error!("{e}");
            e
        })?;
        let capacity = hw.capacity();
        debug_assert!(capacity.is_power_of_two());
        log::info!(
            "Created queue {} on {} with {} slots ({:?})",
            hw.id(),
            agent.name,
            capacity,
            overflow
        );

        Ok(Self {
            hw,
            overflow,
            published: AtomicU64::new(0),
            _runtime: runtime.clone(),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.hw.capacity()
    }

    pub fn id(&self) -> u64 {
        self.hw.id()
    }

    /// Ring position of a packet index
    pub fn slot_index(&self, packet_index: u64) -> u64 {
        ring_position(packet_index, self.capacity())
    }

    /// Reserve the next slot.
    ///
    /// The slot's control word is left untouched (still INVALID to the
    /// consumer) and the rest of the packet is zeroed. Under
    /// `Backpressure`, waits until the consumer has retired the packet
    /// that previously occupied the slot.
    ///
    /// The caller must `commit` the slot; `dispatch::encode` is the only
    /// producer path and validates before reserving.
    pub(crate) fn acquire_slot(&self) -> Slot<'_> {
        let index = self.hw.add_write_index(1);

        if self.overflow == OverflowPolicy::Backpressure {
            let capacity = self.capacity() as u64;
            let backoff = Backoff::new();
            while index.wrapping_sub(self.hw.load_read_index()) >= capacity {
                backoff.snooze();
            }
        }

        let offset = self.slot_index(index) as usize * PACKET_SIZE;
        // SAFETY: the ring is `capacity * PACKET_SIZE` bytes and the offset is masked.
        let packet = unsafe { self.hw.base_address().as_ptr().add(offset) } as *mut KernelDispatchPacket;
        let slot = Slot {
            queue: self,
            // SAFETY: derived from a NonNull base plus an in-bounds offset.
            packet: unsafe { NonNull::new_unchecked(packet) },
            index,
        };
        slot.zero_body();
        log::debug!("Queue {}: acquired packet {} (slot {})", self.id(), index, self.slot_index(index));
        slot
    }

    /// Notify the consumer that `packet_index` is ready
    pub fn publish(&self, packet_index: u64) {
        self.hw.ring_doorbell(packet_index);
        self.published.fetch_add(1, Ordering::Relaxed);
        log::trace!("Queue {}: doorbell rung for packet {}", self.id(), packet_index);
    }

    pub fn stats(&self) -> QueueStats {
        let consumed = self.hw.load_read_index();
        let reserved = self.hw.load_write_index();
        QueueStats {
            capacity: self.capacity(),
            reserved,
            consumed,
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("overflow", &self.overflow)
            .finish()
    }
}

impl Slot<'_> {
    pub fn index(&self) -> u64 {
        self.index
    }

    fn bytes(&self) -> *mut u8 {
        self.packet.as_ptr() as *mut u8
    }

    fn zero_body(&self) {
        // SAFETY: the slot is owned by this producer until the header is
        // released; bytes 4..64 are never read by the consumer before that.
        unsafe { std::ptr::write_bytes(self.bytes().add(4), 0, PACKET_SIZE - 4) };
    }

    /// Write every field except the control word
    pub fn write_body(&mut self, packet: &KernelDispatchPacket) {
        let src = bytemuck::bytes_of(packet);
        // SAFETY: see `zero_body`.
        unsafe { std::ptr::copy_nonoverlapping(src[4..].as_ptr(), self.bytes().add(4), PACKET_SIZE - 4) };
    }

    /// Release-store the control word, handing the slot to the consumer.
    ///
    /// Every earlier write to the slot happens-before any consumer read
    /// that observes this header.
    pub fn commit(self, control: u32) -> u64 {
        // SAFETY: the slot is 64-byte aligned, so the first word is aligned
        // for an atomic u32 and the consumer only accesses it atomically.
        let header = unsafe { &*(self.packet.as_ptr() as *const AtomicU32) };
        header.store(control, Ordering::Release);
        let index = self.index;
        self.queue.publish(index);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::agent::discover_agents;
    use crate::hal::sim::SimPlatform;
    use crate::types::SelectionPolicy;
    use proptest::prelude::*;

    fn queue_with(sim: SimPlatform, size: Option<u32>, overflow: OverflowPolicy) -> Result<CommandQueue> {
        let rt = Runtime::new(Arc::new(sim)).unwrap();
        let topo = discover_agents(&rt, &SelectionPolicy::Last, &SelectionPolicy::Last).unwrap();
        CommandQueue::create(&rt, &topo.accelerator, size, overflow)
    }

    #[test]
    fn defaults_to_agent_maximum() {
        let q = queue_with(SimPlatform::builder().queue_max_size(1024).build(), None, OverflowPolicy::Backpressure)
            .unwrap();
        assert_eq!(q.capacity(), 1024);
    }

    #[test]
    fn rejects_bad_sizes() {
        for size in [0, 3, 100, 2048] {
            let res = queue_with(SimPlatform::builder().queue_max_size(1024).build(), Some(size), OverflowPolicy::Overwrite);
            assert!(matches!(res, Err(DispatchError::InvalidQueueSize { .. })), "size {size}");
        }
    }

    #[test]
    fn indices_are_unique_across_producers() {
        let q = queue_with(SimPlatform::builder().build(), Some(512), OverflowPolicy::Overwrite).unwrap();
        let mut seen: Vec<u64> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..50).map(|_| q.acquire_slot().index()).collect::<Vec<_>>()))
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&399));
    }

    proptest! {
        #[test]
        fn ring_position_is_modulo(shift in 0u32..32, index in any::<u64>()) {
            let capacity = 1u32 << shift;
            prop_assert_eq!(ring_position(index, capacity), index % capacity as u64);
        }

        #[test]
        fn ring_position_past_u32_wraparound(shift in 0u32..32, offset in 0u64..1_000_000) {
            let capacity = 1u32 << shift;
            let index = u32::MAX as u64 + offset;
            prop_assert_eq!(ring_position(index, capacity), index % capacity as u64);
        }
    }
}
