//! Typed storage buffers placed inside a shared memory region.
//!
//! This module defines a [`GpuBuffer`] wrapper around a `vk::Buffer` that
//! tracks the number of typed elements it holds and the [`SlotId`] it
//! occupies in a [`MemoryRegion`].  The buffer never owns the region: the
//! region is passed in by reference to every operation that touches
//! memory, and only the caller that owns the region decides when it is
//! freed.

use std::marker::PhantomData;

use ash::vk;
use bytemuck::Pod;
use log::debug;

use crate::error::{ComputeError, Result};
use crate::memory::{MemoryDevice, MemoryRegion, SlotId};

/// A typed device buffer bound to one slot of a shared region.
///
/// The buffer's byte size is `len * size_of::<T>()`.  The descriptor
/// handed to the binding layer covers exactly that many bytes once
/// [`GpuBuffer::setup_descriptor`] has been called with the buffer size.
#[derive(Debug)]
pub struct GpuBuffer<T: Pod> {
    pub buffer: vk::Buffer,
    pub descriptor: vk::DescriptorBufferInfo,
    pub len: usize,
    slot: SlotId,
    bound: bool,
    _marker: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Wrap an unbound buffer object that will live in `slot`.
    pub fn new(buffer: vk::Buffer, slot: SlotId, len: usize) -> Self {
        Self {
            buffer,
            descriptor: vk::DescriptorBufferInfo::default().buffer(buffer),
            len,
            slot,
            bound: false,
            _marker: PhantomData,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Size of the buffer contents in bytes.
    pub fn size_bytes(&self) -> vk::DeviceSize {
        (self.len * std::mem::size_of::<T>()) as vk::DeviceSize
    }

    /// Describe the byte range shaders see.  `size` of `None` means the
    /// rest of the buffer (`VK_WHOLE_SIZE`); `offset` is relative to the
    /// start of the buffer, not the region.
    pub fn setup_descriptor(&mut self, size: Option<vk::DeviceSize>, offset: vk::DeviceSize) {
        self.descriptor = vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(offset)
            .range(size.unwrap_or(vk::WHOLE_SIZE));
    }

    /// Bind the buffer object to its slot.  Must happen exactly once, before
    /// the buffer is used.
    pub fn bind<D: MemoryDevice>(&mut self, region: &MemoryRegion, device: &D) -> Result<()> {
        assert!(!self.bound, "buffer is already bound to its memory");
        let slot = region.slot(self.slot);
        assert!(
            self.size_bytes() <= slot.size,
            "buffer of {} bytes does not fit its {}-byte slot",
            self.size_bytes(),
            slot.size
        );
        device.bind_buffer(self.buffer, region.memory(), slot.offset)?;
        self.bound = true;
        debug!(
            "bound buffer {:?} at offset {} ({} bytes)",
            self.buffer,
            slot.offset,
            self.size_bytes()
        );
        Ok(())
    }

    /// Map the region if needed and return this buffer's bytes.
    pub fn mapped<'r, D: MemoryDevice>(
        &self,
        region: &'r mut MemoryRegion,
        device: &D,
    ) -> Result<&'r mut [u8]> {
        region.map(device, vk::MemoryMapFlags::empty())?;
        let size = self.size_bytes() as usize;
        let bytes = region
            .slot_bytes_mut(self.slot)
            .ok_or(ComputeError::MapFailure(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        Ok(&mut bytes[..size])
    }

    /// Copy `data` to the start of the buffer.
    ///
    /// The region must already be mapped and `data` must fit the buffer;
    /// anything else is a programmer error and panics.
    pub fn copy_to(&self, region: &mut MemoryRegion, data: &[T]) {
        assert!(
            data.len() <= self.len,
            "copying {} elements into a buffer of {}",
            data.len(),
            self.len
        );
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let dst = region
            .slot_bytes_mut(self.slot)
            .expect("copy_to called on an unmapped memory region");
        dst[..bytes.len()].copy_from_slice(bytes);
    }

    /// Copy the buffer contents out.  The region must already be mapped.
    pub fn read(&self, region: &MemoryRegion) -> Vec<T> {
        let src = region
            .slot_bytes(self.slot)
            .expect("read called on an unmapped memory region");
        // Slot offsets are only aligned to the buffer alignment, so copy
        // rather than cast in place.
        let mut out = vec![T::zeroed(); self.len];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&src[..self.size_bytes() as usize]);
        out
    }

    pub fn flush<D: MemoryDevice>(&self, region: &MemoryRegion, device: &D) -> Result<()> {
        region.flush_slot(device, self.slot)
    }

    pub fn invalidate<D: MemoryDevice>(&self, region: &MemoryRegion, device: &D) -> Result<()> {
        region.invalidate_slot(device, self.slot)
    }

    /// Unmap the region, destroy the buffer object and, when `free_memory`
    /// is set, free the region as well.  Only one buffer per region should
    /// pass `true`.
    pub fn destroy<D: MemoryDevice>(
        &mut self,
        region: &mut MemoryRegion,
        device: &D,
        free_memory: bool,
    ) {
        region.unmap(device);
        if self.buffer != vk::Buffer::null() {
            device.release_buffer(self.buffer);
            self.buffer = vk::Buffer::null();
            self.descriptor.buffer = vk::Buffer::null();
        }
        if free_memory {
            region.free(device);
        }
    }
}
