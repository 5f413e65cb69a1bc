//! Device memory regions carved into fixed slots.
//!
//! A compute job makes exactly one device allocation and places all of its
//! buffers inside it.  [`RegionLayout`] describes where each buffer lives
//! and is validated once, when it is built: every [`Slot`] lies inside the
//! region and no two slots overlap.  [`MemoryRegion`] owns the allocation,
//! tracks its host mapping and hands out byte views of individual slots,
//! so callers never do pointer arithmetic themselves.
//!
//! Device calls go through the [`MemoryDevice`] trait.  It is implemented
//! for [`ash::Device`]; the unit tests drive the same code with a host
//! memory fake.

use std::ffi::c_void;
use std::ptr::NonNull;

use ash::prelude::VkResult;
use ash::vk;
use log::{debug, warn};

use crate::error::{ComputeError, Result};

/// Round `value` up to the next multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Round `value` down to a multiple of `alignment`.
pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value - value % alignment
    }
}

/// A byte range inside a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl Slot {
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }

    fn overlaps(&self, other: &Slot) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Index of a slot within a [`RegionLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) usize);

/// Validated partition of a region into slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    size: vk::DeviceSize,
    slots: Vec<Slot>,
}

impl RegionLayout {
    /// Lay out `count` slots of `slot_size` bytes back to back, each one
    /// starting on a multiple of `alignment`.
    ///
    /// When `slot_size` is already a multiple of `alignment` the slots are
    /// contiguous and the region is exactly `count * slot_size` bytes.
    pub fn packed(
        slot_size: vk::DeviceSize,
        count: usize,
        alignment: vk::DeviceSize,
    ) -> Result<Self> {
        if slot_size == 0 || count == 0 {
            return Err(ComputeError::Layout(format!(
                "cannot pack {count} slots of {slot_size} bytes"
            )));
        }
        let stride = align_up(slot_size, alignment);
        let overflow = || ComputeError::Layout("region size overflows u64".into());
        let size = stride
            .checked_mul(count as u64 - 1)
            .and_then(|s| s.checked_add(slot_size))
            .ok_or_else(overflow)?;
        let slots = (0..count as u64)
            .map(|i| Slot {
                offset: i * stride,
                size: slot_size,
            })
            .collect();
        Self::from_slots(size, slots)
    }

    /// Build a layout from explicit slots, rejecting empty, out-of-bounds
    /// or overlapping ones.
    pub fn from_slots(size: vk::DeviceSize, slots: Vec<Slot>) -> Result<Self> {
        for (i, slot) in slots.iter().enumerate() {
            if slot.size == 0 {
                return Err(ComputeError::Layout(format!("slot {i} is empty")));
            }
            match slot.offset.checked_add(slot.size) {
                Some(end) if end <= size => {}
                _ => {
                    return Err(ComputeError::Layout(format!(
                        "slot {i} [{}, +{}) exceeds region of {size} bytes",
                        slot.offset, slot.size
                    )))
                }
            }
        }
        let mut sorted: Vec<(usize, &Slot)> = slots.iter().enumerate().collect();
        sorted.sort_by_key(|(_, s)| s.offset);
        for pair in sorted.windows(2) {
            let ((a, first), (b, second)) = (pair[0], pair[1]);
            if first.overlaps(second) {
                return Err(ComputeError::Layout(format!("slots {a} and {b} overlap")));
            }
        }
        Ok(Self { size, slots })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Panics if `id` does not come from this layout.
    pub fn slot(&self, id: SlotId) -> Slot {
        self.slots[id.0]
    }
}

/// Device operations needed to manage a region and the buffers bound to it.
///
/// Every handle passed in must have been created from the implementing
/// device.
pub trait MemoryDevice {
    /// Map `size` bytes of `memory` starting at offset 0.
    fn map(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        flags: vk::MemoryMapFlags,
    ) -> VkResult<*mut c_void>;
    fn unmap(&self, memory: vk::DeviceMemory);
    fn free(&self, memory: vk::DeviceMemory);
    fn flush(&self, ranges: &[vk::MappedMemoryRange<'_>]) -> VkResult<()>;
    fn invalidate(&self, ranges: &[vk::MappedMemoryRange<'_>]) -> VkResult<()>;
    fn bind_buffer(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    fn release_buffer(&self, buffer: vk::Buffer);
}

impl MemoryDevice for ash::Device {
    fn map(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        flags: vk::MemoryMapFlags,
    ) -> VkResult<*mut c_void> {
        unsafe { self.map_memory(memory, 0, size, flags) }
    }

    fn unmap(&self, memory: vk::DeviceMemory) {
        unsafe { self.unmap_memory(memory) }
    }

    fn free(&self, memory: vk::DeviceMemory) {
        unsafe { self.free_memory(memory, None) }
    }

    fn flush(&self, ranges: &[vk::MappedMemoryRange<'_>]) -> VkResult<()> {
        unsafe { self.flush_mapped_memory_ranges(ranges) }
    }

    fn invalidate(&self, ranges: &[vk::MappedMemoryRange<'_>]) -> VkResult<()> {
        unsafe { self.invalidate_mapped_memory_ranges(ranges) }
    }

    fn bind_buffer(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        unsafe { self.bind_buffer_memory(buffer, memory, offset) }
    }

    fn release_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.destroy_buffer(buffer, None) }
    }
}

/// One device allocation shared by several buffers.
///
/// The region is mapped as a whole; there is never more than one live
/// mapping.  Once freed it stays dead: further `free` calls do nothing and
/// `map` fails with [`ComputeError::RegionFreed`].
#[derive(Debug)]
pub struct MemoryRegion {
    memory: vk::DeviceMemory,
    layout: RegionLayout,
    mapped: Option<NonNull<u8>>,
    alive: bool,
    coherent: bool,
    atom_size: vk::DeviceSize,
}

impl MemoryRegion {
    /// Wrap a fresh allocation of `layout.size()` bytes.
    ///
    /// `coherent` records whether the memory type is `HOST_COHERENT`; if
    /// not, flushes and invalidations are widened to `atom_size`
    /// (`nonCoherentAtomSize`).
    pub fn new(
        memory: vk::DeviceMemory,
        layout: RegionLayout,
        coherent: bool,
        atom_size: vk::DeviceSize,
    ) -> Self {
        Self {
            memory,
            layout,
            mapped: None,
            alive: true,
            coherent,
            atom_size,
        }
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.layout.size()
    }

    pub fn slot(&self, id: SlotId) -> Slot {
        self.layout.slot(id)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Map the whole region, or return the existing mapping.
    pub fn map<D: MemoryDevice>(
        &mut self,
        device: &D,
        flags: vk::MemoryMapFlags,
    ) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }
        if !self.alive {
            return Err(ComputeError::RegionFreed);
        }
        let raw = device
            .map(self.memory, self.size(), flags)
            .map_err(ComputeError::MapFailure)?;
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or(ComputeError::MapFailure(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap<D: MemoryDevice>(&mut self, device: &D) {
        if self.mapped.take().is_some() {
            device.unmap(self.memory);
        }
    }

    /// Release the allocation.  Unmaps first if needed; a second call is a
    /// no-op.
    pub fn free<D: MemoryDevice>(&mut self, device: &D) {
        if !self.alive {
            return;
        }
        self.unmap(device);
        device.free(self.memory);
        self.alive = false;
        debug!("freed memory region of {} bytes", self.size());
    }

    /// Bytes of one slot, or `None` while the region is unmapped.
    pub fn slot_bytes(&self, id: SlotId) -> Option<&[u8]> {
        let slot = self.slot(id);
        let base = self.mapped?;
        // The mapping covers the whole region and the layout keeps every
        // slot inside it.
        Some(unsafe {
            std::slice::from_raw_parts(base.as_ptr().add(slot.offset as usize), slot.size as usize)
        })
    }

    /// Mutable bytes of one slot, or `None` while the region is unmapped.
    pub fn slot_bytes_mut(&mut self, id: SlotId) -> Option<&mut [u8]> {
        let slot = self.slot(id);
        let base = self.mapped?;
        Some(unsafe {
            std::slice::from_raw_parts_mut(
                base.as_ptr().add(slot.offset as usize),
                slot.size as usize,
            )
        })
    }

    /// Make host writes to one slot visible to the device.  Skipped for
    /// coherent memory.
    pub fn flush_slot<D: MemoryDevice>(&self, device: &D, id: SlotId) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        assert!(self.is_mapped(), "flushing an unmapped memory region");
        device.flush(&[self.mapped_range(id)])?;
        Ok(())
    }

    /// Make device writes to one slot visible to the host.  Skipped for
    /// coherent memory.
    pub fn invalidate_slot<D: MemoryDevice>(&self, device: &D, id: SlotId) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        assert!(self.is_mapped(), "invalidating an unmapped memory region");
        device.invalidate(&[self.mapped_range(id)])?;
        Ok(())
    }

    /// Slot range widened to the non-coherent atom size.  A range that
    /// would run past the allocation uses `WHOLE_SIZE` instead.
    pub(crate) fn mapped_range(&self, id: SlotId) -> vk::MappedMemoryRange<'static> {
        let slot = self.slot(id);
        let start = align_down(slot.offset, self.atom_size);
        let end = align_up(slot.end(), self.atom_size);
        let size = if end >= self.size() {
            vk::WHOLE_SIZE
        } else {
            end - start
        };
        vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(start)
            .size(size)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if self.alive {
            warn!("memory region of {} bytes dropped without being freed", self.size());
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::cell::{Cell, RefCell};

    use super::*;

    /// Host-memory stand-in for a Vulkan device.
    pub(crate) struct FakeDevice {
        backing: NonNull<u8>,
        len: usize,
        pub fail_map: bool,
        pub maps: Cell<u32>,
        pub unmaps: Cell<u32>,
        pub frees: Cell<u32>,
        pub flushed: RefCell<Vec<(vk::DeviceSize, vk::DeviceSize)>>,
        pub invalidated: RefCell<Vec<(vk::DeviceSize, vk::DeviceSize)>>,
        pub bound: RefCell<Vec<(vk::Buffer, vk::DeviceSize)>>,
        pub released: RefCell<Vec<vk::Buffer>>,
    }

    impl FakeDevice {
        pub fn new(len: usize) -> Self {
            let raw = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
            Self {
                backing: NonNull::new(raw).expect("box pointer is never null"),
                len,
                fail_map: false,
                maps: Cell::new(0),
                unmaps: Cell::new(0),
                frees: Cell::new(0),
                flushed: RefCell::new(Vec::new()),
                invalidated: RefCell::new(Vec::new()),
                bound: RefCell::new(Vec::new()),
                released: RefCell::new(Vec::new()),
            }
        }

        pub fn base(&self) -> *mut u8 {
            self.backing.as_ptr()
        }
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            let slice = std::ptr::slice_from_raw_parts_mut(self.backing.as_ptr(), self.len);
            drop(unsafe { Box::from_raw(slice) });
        }
    }

    impl MemoryDevice for FakeDevice {
        fn map(
            &self,
            _memory: vk::DeviceMemory,
            size: vk::DeviceSize,
            _flags: vk::MemoryMapFlags,
        ) -> VkResult<*mut c_void> {
            if self.fail_map {
                return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
            }
            assert!(size as usize <= self.len);
            self.maps.set(self.maps.get() + 1);
            Ok(self.base().cast())
        }

        fn unmap(&self, _memory: vk::DeviceMemory) {
            self.unmaps.set(self.unmaps.get() + 1);
        }

        fn free(&self, _memory: vk::DeviceMemory) {
            self.frees.set(self.frees.get() + 1);
        }

        fn flush(&self, ranges: &[vk::MappedMemoryRange<'_>]) -> VkResult<()> {
            let mut flushed = self.flushed.borrow_mut();
            flushed.extend(ranges.iter().map(|r| (r.offset, r.size)));
            Ok(())
        }

        fn invalidate(&self, ranges: &[vk::MappedMemoryRange<'_>]) -> VkResult<()> {
            let mut invalidated = self.invalidated.borrow_mut();
            invalidated.extend(ranges.iter().map(|r| (r.offset, r.size)));
            Ok(())
        }

        fn bind_buffer(
            &self,
            buffer: vk::Buffer,
            _memory: vk::DeviceMemory,
            offset: vk::DeviceSize,
        ) -> VkResult<()> {
            self.bound.borrow_mut().push((buffer, offset));
            Ok(())
        }

        fn release_buffer(&self, buffer: vk::Buffer) {
            self.released.borrow_mut().push(buffer);
        }
    }

    /// A live region over a three-slot layout.
    pub(crate) fn region(slot_size: u64, coherent: bool, atom_size: u64) -> MemoryRegion {
        use ash::vk::Handle;
        let layout = RegionLayout::packed(slot_size, 3, 4).expect("valid layout");
        MemoryRegion::new(vk::DeviceMemory::from_raw(0x10), layout, coherent, atom_size)
    }
}
