/// Kernel dispatch packet layout
///
/// The 64-byte architected packet written into each ring slot, and the
/// control-word encoding that makes it visible to the packet processor.

use bytemuck::{Pod, Zeroable};

/// Size of one ring slot in bytes
pub const PACKET_SIZE: usize = 64;

pub const PACKET_TYPE_VENDOR_SPECIFIC: u16 = 0;
/// Slot holds no packet; the consumer waits on it
pub const PACKET_TYPE_INVALID: u16 = 1;
pub const PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;

// Bit offsets inside the 16-bit header
pub const HEADER_TYPE: u16 = 0;
pub const HEADER_BARRIER: u16 = 8;
pub const HEADER_ACQUIRE_FENCE_SCOPE: u16 = 9;
pub const HEADER_RELEASE_FENCE_SCOPE: u16 = 11;

pub const HEADER_TYPE_WIDTH: u16 = 8;
pub const FENCE_SCOPE_WIDTH: u16 = 2;

pub const FENCE_SCOPE_NONE: u16 = 0;
pub const FENCE_SCOPE_AGENT: u16 = 1;
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

/// Bit offset of the dimension count in the setup half
pub const SETUP_DIMENSIONS: u16 = 0;

/// Control word of an empty slot
pub const INVALID_HEADER: u32 = (PACKET_TYPE_INVALID as u32) << HEADER_TYPE;

/// Kernel dispatch packet, byte-for-byte as the packet processor reads it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: u64,
}

const _: () = assert!(std::mem::size_of::<KernelDispatchPacket>() == PACKET_SIZE);

impl KernelDispatchPacket {
    /// The first 32 bits: header in the low half, setup in the high half
    pub fn control_word(&self) -> u32 {
        self.header as u32 | ((self.setup as u32) << 16)
    }

    pub fn packet_type(&self) -> u16 {
        packet_type(self.control_word())
    }

    /// Dimension count encoded in the setup half
    pub fn dimensions(&self) -> u16 {
        (self.setup >> SETUP_DIMENSIONS) & 0x3
    }
}

/// Packet type bits of a control word
pub fn packet_type(control: u32) -> u16 {
    ((control as u16) >> HEADER_TYPE) & ((1 << HEADER_TYPE_WIDTH) - 1)
}

/// Barrier bit of a control word
pub fn has_barrier(control: u32) -> bool {
    (control >> HEADER_BARRIER) & 1 == 1
}

pub fn acquire_fence_scope(control: u32) -> u16 {
    ((control as u16) >> HEADER_ACQUIRE_FENCE_SCOPE) & ((1 << FENCE_SCOPE_WIDTH) - 1)
}

pub fn release_fence_scope(control: u32) -> u16 {
    ((control as u16) >> HEADER_RELEASE_FENCE_SCOPE) & ((1 << FENCE_SCOPE_WIDTH) - 1)
}

/// Grid dimensionality: 3 if z > 1, else 2 if y > 1, else 1
pub fn infer_dimensions(grid: [u32; 3]) -> u16 {
    if grid[2] > 1 {
        3
    } else if grid[1] > 1 {
        2
    } else {
        1
    }
}

/// 16-bit header of a kernel dispatch: barrier set, system-scope fences
pub fn dispatch_header() -> u16 {
    (PACKET_TYPE_KERNEL_DISPATCH << HEADER_TYPE)
        | (1 << HEADER_BARRIER)
        | (FENCE_SCOPE_SYSTEM << HEADER_ACQUIRE_FENCE_SCOPE)
        | (FENCE_SCOPE_SYSTEM << HEADER_RELEASE_FENCE_SCOPE)
}

/// Full control word for a kernel dispatch of `dims` dimensions
pub fn dispatch_control_word(dims: u16) -> u32 {
    let setup = dims << SETUP_DIMENSIONS;
    dispatch_header() as u32 | ((setup as u32) << 16)
}
