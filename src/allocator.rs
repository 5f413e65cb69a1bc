//! Shared memory allocation for the three job buffers.
//!
//! One allocation backs input A, input B and the output.  The buffers are
//! created first so their memory requirements can drive the layout; the
//! region is then sized for all three, allocated once and each buffer is
//! bound to its slot.

use ash::vk;
use log::{debug, info};

use crate::buffer::GpuBuffer;
use crate::device::DeviceCandidate;
use crate::error::{stage, ComputeError, Result};
use crate::memory::{MemoryDevice, MemoryRegion, RegionLayout, SlotId};

pub const INPUT_A: SlotId = SlotId(0);
pub const INPUT_B: SlotId = SlotId(1);
pub const OUTPUT: SlotId = SlotId(2);

/// First memory type allowed by `type_bits` that has every flag in
/// `required` and whose heap is larger than `min_size` bytes.
pub fn find_memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    min_size: vk::DeviceSize,
    required: vk::MemoryPropertyFlags,
    type_bits: u32,
) -> Result<u32> {
    let count = (props.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    props.memory_types[..count]
        .iter()
        .enumerate()
        .find(|&(i, ty)| {
            let heap = &props.memory_heaps[ty.heap_index as usize];
            type_bits & (1u32 << i) != 0
                && ty.property_flags.contains(required)
                && heap.size > min_size
        })
        .map(|(i, _)| i as u32)
        .ok_or(ComputeError::NoMatchingMemoryType {
            flags: required,
            min_size,
        })
}

/// Create one exclusive buffer object owned by `queue_family_index`.
pub fn create_storage_buffer(
    device: &ash::Device,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    queue_family_index: u32,
) -> Result<vk::Buffer> {
    let queue_families = [queue_family_index];
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .queue_family_indices(&queue_families);
    unsafe { device.create_buffer(&info, None) }.map_err(ComputeError::init(stage::BUFFER))
}

/// Allocate `layout.size()` bytes of memory type `memory_type_index`.
pub fn allocate_region(
    device: &ash::Device,
    layout: RegionLayout,
    memory_type_index: u32,
    coherent: bool,
    atom_size: vk::DeviceSize,
) -> Result<MemoryRegion> {
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(layout.size())
        .memory_type_index(memory_type_index);
    let memory = unsafe { device.allocate_memory(&info, None) }
        .map_err(ComputeError::init(stage::MEMORY))?;
    debug!(
        "allocated {} bytes from memory type {memory_type_index}",
        layout.size()
    );
    Ok(MemoryRegion::new(memory, layout, coherent, atom_size))
}

/// The job's three storage buffers and the region they share.
///
/// The region is owned here; the buffers refer to it by slot.
#[derive(Debug)]
pub struct ComputeBuffers {
    pub region: MemoryRegion,
    pub input_a: GpuBuffer<f32>,
    pub input_b: GpuBuffer<f32>,
    pub output: GpuBuffer<f32>,
}

impl ComputeBuffers {
    /// Create, allocate and bind the three buffers of `element_count`
    /// floats each.  On failure nothing is left allocated.
    pub fn create(
        device: &ash::Device,
        candidate: &DeviceCandidate,
        queue_family_index: u32,
        element_count: u32,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let len = element_count as usize;
        let size = (len * std::mem::size_of::<f32>()) as vk::DeviceSize;
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;

        let mut handles = Vec::with_capacity(3);
        for _ in 0..3 {
            match create_storage_buffer(device, size, usage, queue_family_index) {
                Ok(buffer) => handles.push(buffer),
                Err(err) => {
                    release_buffers(device, &handles);
                    return Err(err);
                }
            }
        }

        let (region, memory_type_index) =
            match Self::allocate_for(device, candidate, &handles, memory_flags) {
                Ok(allocated) => allocated,
                Err(err) => {
                    release_buffers(device, &handles);
                    return Err(err);
                }
            };

        let mut buffers = Self {
            region,
            input_a: GpuBuffer::new(handles[0], INPUT_A, len),
            input_b: GpuBuffer::new(handles[1], INPUT_B, len),
            output: GpuBuffer::new(handles[2], OUTPUT, len),
        };
        if let Err(err) = buffers.bind_all(device) {
            buffers.destroy(device);
            return Err(err);
        }
        info!(
            "created 3 buffers of {size} bytes in one {}-byte region (memory type {memory_type_index}, coherent: {})",
            buffers.region.size(),
            buffers.region.is_coherent()
        );
        Ok(buffers)
    }

    fn allocate_for(
        device: &ash::Device,
        candidate: &DeviceCandidate,
        handles: &[vk::Buffer],
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<(MemoryRegion, u32)> {
        let requirements: Vec<vk::MemoryRequirements> = handles
            .iter()
            .map(|&b| unsafe { device.get_buffer_memory_requirements(b) })
            .collect();
        let slot_size = requirements.iter().map(|r| r.size).max().unwrap_or(0);
        let alignment = requirements.iter().map(|r| r.alignment).max().unwrap_or(1);
        let type_bits = requirements
            .iter()
            .fold(u32::MAX, |bits, r| bits & r.memory_type_bits);

        let layout = RegionLayout::packed(slot_size, handles.len(), alignment)?;
        let props = &candidate.memory_properties;
        let memory_type_index =
            find_memory_type_index(props, layout.size(), memory_flags, type_bits)?;
        let coherent = props.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        let region = allocate_region(
            device,
            layout,
            memory_type_index,
            coherent,
            candidate.limits.non_coherent_atom_size,
        )?;
        Ok((region, memory_type_index))
    }

    fn bind_all<D: MemoryDevice>(&mut self, device: &D) -> Result<()> {
        for buffer in [&mut self.input_a, &mut self.input_b, &mut self.output] {
            buffer.bind(&self.region, device)?;
            buffer.setup_descriptor(Some(buffer.size_bytes()), 0);
        }
        Ok(())
    }

    pub fn descriptors(&self) -> [vk::DescriptorBufferInfo; 3] {
        [
            self.input_a.descriptor,
            self.input_b.descriptor,
            self.output.descriptor,
        ]
    }

    /// Overwrite both inputs and leave the region unmapped.
    pub fn write_inputs<D: MemoryDevice>(&mut self, device: &D, a: &[f32], b: &[f32]) -> Result<()> {
        self.input_a.mapped(&mut self.region, device)?;
        self.input_a.copy_to(&mut self.region, a);
        self.input_b.copy_to(&mut self.region, b);
        let flushed = self
            .input_a
            .flush(&self.region, device)
            .and_then(|()| self.input_b.flush(&self.region, device));
        self.region.unmap(device);
        flushed
    }

    pub fn read_inputs<D: MemoryDevice>(&mut self, device: &D) -> Result<(Vec<f32>, Vec<f32>)> {
        self.input_a.mapped(&mut self.region, device)?;
        let read = self
            .input_a
            .invalidate(&self.region, device)
            .and_then(|()| self.input_b.invalidate(&self.region, device))
            .map(|()| (self.input_a.read(&self.region), self.input_b.read(&self.region)));
        self.region.unmap(device);
        read
    }

    pub fn read_output<D: MemoryDevice>(&mut self, device: &D) -> Result<Vec<f32>> {
        self.output.mapped(&mut self.region, device)?;
        let read = self
            .output
            .invalidate(&self.region, device)
            .map(|()| self.output.read(&self.region));
        self.region.unmap(device);
        read
    }

    /// Destroy the buffer objects, then free the shared region through the
    /// output buffer.
    pub fn destroy<D: MemoryDevice>(&mut self, device: &D) {
        self.input_a.destroy(&mut self.region, device, false);
        self.input_b.destroy(&mut self.region, device, false);
        self.output.destroy(&mut self.region, device, true);
    }
}

fn release_buffers(device: &ash::Device, handles: &[vk::Buffer]) {
    for &buffer in handles {
        unsafe { device.destroy_buffer(buffer, None) };
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::memory::fake::{region, FakeDevice};

    const VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    fn props(
        types: &[(vk::MemoryPropertyFlags, u32)],
        heaps: &[u64],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &(flags, heap)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: heap,
            };
        }
        props.memory_heap_count = heaps.len() as u32;
        for (i, &size) in heaps.iter().enumerate() {
            props.memory_heaps[i] = vk::MemoryHeap {
                size,
                flags: vk::MemoryHeapFlags::empty(),
            };
        }
        props
    }

    #[test]
    fn picks_first_type_with_all_required_flags() {
        let p = props(
            &[(LOCAL, 0), (VISIBLE, 1), (VISIBLE | COHERENT, 1), (VISIBLE | COHERENT | LOCAL, 1)],
            &[1 << 30, 1 << 30],
        );
        assert_eq!(find_memory_type_index(&p, 1024, VISIBLE | COHERENT, u32::MAX).unwrap(), 2);
        assert_eq!(find_memory_type_index(&p, 1024, VISIBLE, u32::MAX).unwrap(), 1);
        assert_eq!(find_memory_type_index(&p, 1024, LOCAL, u32::MAX).unwrap(), 0);
    }

    #[test]
    fn heap_must_be_strictly_larger_than_request() {
        let p = props(&[(VISIBLE | COHERENT, 0), (VISIBLE | COHERENT, 1)], &[4096, 8192]);
        assert_eq!(find_memory_type_index(&p, 4096, VISIBLE | COHERENT, u32::MAX).unwrap(), 1);
        assert!(matches!(
            find_memory_type_index(&p, 8192, VISIBLE | COHERENT, u32::MAX),
            Err(ComputeError::NoMatchingMemoryType { min_size: 8192, .. })
        ));
    }

    #[test]
    fn type_bits_filter_candidates() {
        let p = props(&[(VISIBLE | COHERENT, 0), (VISIBLE | COHERENT, 0)], &[1 << 20]);
        assert_eq!(find_memory_type_index(&p, 16, VISIBLE, 0b10).unwrap(), 1);
        assert!(find_memory_type_index(&p, 16, VISIBLE, 0b100).is_err());
    }

    #[test]
    fn empty_properties_have_no_match() {
        let p = vk::PhysicalDeviceMemoryProperties::default();
        assert!(find_memory_type_index(&p, 0, VISIBLE, u32::MAX).is_err());
    }

    fn carved(len: usize, coherent: bool, atom_size: u64) -> ComputeBuffers {
        let slot_size = (len * std::mem::size_of::<f32>()) as u64;
        let [input_a, input_b, output] = [INPUT_A, INPUT_B, OUTPUT].map(|slot| {
            GpuBuffer::new(vk::Buffer::from_raw(0x200 + slot.0 as u64), slot, len)
        });
        ComputeBuffers {
            region: region(slot_size, coherent, atom_size),
            input_a,
            input_b,
            output,
        }
    }

    #[test]
    fn inputs_and_output_live_in_their_own_slots() {
        let device = FakeDevice::new(48);
        let mut buffers = carved(4, true, 1);
        buffers.bind_all(&device).unwrap();
        let offsets: Vec<u64> = device.bound.borrow().iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, vec![0, 16, 32]);
        assert!(buffers.descriptors().iter().all(|d| d.range == 16 && d.offset == 0));

        buffers
            .write_inputs(&device, &[1.0, 2.0, 3.0, 4.0], &[10.0, 20.0, 30.0, 40.0])
            .unwrap();
        assert!(!buffers.region.is_mapped());

        // What the kernel would leave in slot 2.
        buffers.output.mapped(&mut buffers.region, &device).unwrap();
        buffers.output.copy_to(&mut buffers.region, &[11.0, 22.0, 33.0, 44.0]);
        buffers.region.unmap(&device);

        let expected: [f32; 12] = [
            1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0, 11.0, 22.0, 33.0, 44.0,
        ];
        let raw = unsafe { std::slice::from_raw_parts(device.base(), 48) };
        assert_eq!(raw, bytemuck::cast_slice::<f32, u8>(&expected));

        assert_eq!(buffers.read_output(&device).unwrap(), vec![11.0, 22.0, 33.0, 44.0]);
        let (a, b) = buffers.read_inputs(&device).unwrap();
        assert_eq!(a, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(b, vec![10.0, 20.0, 30.0, 40.0]);
        assert!(!buffers.region.is_mapped());
        assert_eq!(device.maps.get(), device.unmaps.get());
        buffers.destroy(&device);
    }

    #[test]
    fn non_coherent_writes_flush_inputs_and_reads_invalidate_output() {
        let device = FakeDevice::new(3 * 256);
        let mut buffers = carved(64, false, 64);
        buffers.bind_all(&device).unwrap();
        buffers.write_inputs(&device, &[1.0; 64], &[2.0; 64]).unwrap();
        assert_eq!(device.flushed.borrow().as_slice(), &[(0, 256), (256, 256)]);

        buffers.read_output(&device).unwrap();
        assert_eq!(device.invalidated.borrow().as_slice(), &[(512, vk::WHOLE_SIZE)]);
        buffers.destroy(&device);
    }

    #[test]
    fn failed_map_is_reported_and_leaves_region_unmapped() {
        let mut device = FakeDevice::new(48);
        device.fail_map = true;
        let mut buffers = carved(4, true, 1);
        let err = buffers.write_inputs(&device, &[0.0; 4], &[0.0; 4]).unwrap_err();
        assert!(matches!(err, ComputeError::MapFailure(_)));
        assert!(matches!(buffers.read_output(&device), Err(ComputeError::MapFailure(_))));
        assert!(!buffers.region.is_mapped());
        buffers.destroy(&device);
    }

    #[test]
    fn destroy_releases_every_buffer_and_frees_region_once() {
        let device = FakeDevice::new(48);
        let mut buffers = carved(4, true, 1);
        buffers.bind_all(&device).unwrap();
        buffers.write_inputs(&device, &[1.0; 4], &[1.0; 4]).unwrap();

        buffers.destroy(&device);
        let released: Vec<u64> = device.released.borrow().iter().map(|b| b.as_raw()).collect();
        assert_eq!(released, vec![0x200, 0x201, 0x202]);
        assert_eq!(device.frees.get(), 1);
        assert!(!buffers.region.is_alive());
        assert!(matches!(buffers.read_output(&device), Err(ComputeError::RegionFreed)));

        buffers.destroy(&device);
        assert_eq!(device.released.borrow().len(), 3);
        assert_eq!(device.frees.get(), 1);
    }
}
