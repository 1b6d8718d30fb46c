/// Dispatch Encoder
///
/// Turns a logical kernel launch into a kernel dispatch packet in a queue
/// slot. Fields are written first; the control word is released last and
/// only then is the doorbell rung.

use crate::error::{DispatchError, Result};
use crate::packet::{dispatch_control_word, infer_dimensions, KernelDispatchPacket};
use crate::queue::CommandQueue;
use crate::signal::CompletionSignal;
use crate::types::{Dim3, KernelObject, SignalHandle};
use bytemuck::Zeroable;

/// One kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDescriptor {
    pub workgroup: Dim3<u16>,
    pub grid: Dim3<u32>,
    pub kernel_object: KernelObject,
    /// Address of the kernarg buffer, 0 for none
    pub kernarg_address: u64,
    pub completion_signal: SignalHandle,
}

impl DispatchDescriptor {
    /// A 1x1x1 launch of `kernel_object` with no arguments and no signal
    pub fn new(kernel_object: KernelObject) -> Self {
        Self {
            workgroup: Dim3::new(1, 1, 1),
            grid: Dim3::new(1, 1, 1),
            kernel_object,
            kernarg_address: 0,
            completion_signal: SignalHandle::NULL,
        }
    }

    pub fn workgroup(mut self, x: u16, y: u16, z: u16) -> Self {
        self.workgroup = Dim3::new(x, y, z);
        self
    }

    /// Grid size in work-items
    pub fn grid(mut self, x: u32, y: u32, z: u32) -> Self {
        self.grid = Dim3::new(x, y, z);
        self
    }

    pub fn kernarg(mut self, address: u64) -> Self {
        self.kernarg_address = address;
        self
    }

    pub fn completion_signal(mut self, signal: &CompletionSignal) -> Self {
        self.completion_signal = signal.handle();
        self
    }

    pub fn dimensions(&self) -> u16 {
        infer_dimensions(self.grid.to_array())
    }

    fn validate(&self) -> Result<()> {
        let wg = self.workgroup.to_array();
        let grid = self.grid.to_array();
        if wg.contains(&0) || grid.contains(&0) {
            return Err(DispatchError::InvalidGeometry { workgroup: wg, grid });
        }
        Ok(())
    }

    /// The packet as it will sit in the slot once published
    pub fn to_packet(&self) -> KernelDispatchPacket {
        let control = dispatch_control_word(self.dimensions());
        KernelDispatchPacket {
            header: control as u16,
            setup: (control >> 16) as u16,
            workgroup_size_x: self.workgroup.x,
            workgroup_size_y: self.workgroup.y,
            workgroup_size_z: self.workgroup.z,
            grid_size_x: self.grid.x,
            grid_size_y: self.grid.y,
            grid_size_z: self.grid.z,
            group_segment_size: 0,
            private_segment_size: 0,
            kernel_object: self.kernel_object.0,
            kernarg_address: self.kernarg_address,
            completion_signal: self.completion_signal.0,
            ..KernelDispatchPacket::zeroed()
        }
    }
}

/// Encode `desc` into the next slot of `queue` and ring the doorbell.
///
/// Returns the packet index. Geometry is checked before a slot is taken,
/// so every acquired slot is published.
pub fn encode(queue: &CommandQueue, desc: &DispatchDescriptor) -> Result<u64> {
    desc.validate()?;
    let packet = desc.to_packet();

    let mut slot = queue.acquire_slot();
    slot.write_body(&packet);
    let index = slot.commit(packet.control_word());

    log::debug!(
        "Dispatched kernel {} as packet {}: grid {:?}, workgroup {:?}, dim {}",
        desc.kernel_object,
        index,
        desc.grid.to_array(),
        desc.workgroup.to_array(),
        desc.dimensions()
    );
    Ok(index)
}
