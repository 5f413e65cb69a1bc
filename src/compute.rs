//! Recording and submitting the compute dispatch.
//!
//! The command buffer is recorded once, during job initialization, and can
//! be submitted any number of times afterwards.  A submission blocks the
//! calling thread until the queue is idle, so once [`RecordedDispatch::submit`]
//! returns the output buffer holds the kernel's results.

use ash::vk;
use log::{debug, trace};

use crate::allocator::ComputeBuffers;
use crate::error::{stage, ComputeError, Result};
use crate::pipeline::{ComputePipeline, PushConstants, BINDING_COUNT};

/// Calculate an (x, y) workgroup grid that covers `total_groups`
/// workgroups without exceeding the per-dimension limit.
pub fn split_workgroups(total_groups: u32, limit: u32) -> (u32, u32) {
    if total_groups <= limit {
        (total_groups, 1)
    } else {
        let x = limit;
        let y = total_groups.div_ceil(limit);
        (x, y)
    }
}

/// Number of workgroups needed for `element_count` elements when each
/// group handles `stride` of them.
///
/// Panics unless `element_count` is a positive multiple of `stride`; job
/// configuration is validated before this is reached.
pub fn workgroup_count(element_count: u32, stride: u32) -> u32 {
    assert!(stride > 0, "workgroup stride must be positive");
    assert!(
        element_count > 0 && element_count % stride == 0,
        "{element_count} elements cannot be split evenly into groups of {stride}"
    );
    element_count / stride
}

/// Descriptor set and command buffer for one pipeline and buffer set.
#[derive(Debug)]
pub struct RecordedDispatch {
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub groups: (u32, u32),
}

impl RecordedDispatch {
    /// Allocate and write the descriptor set, then record
    /// bind pipeline / bind set / push constants / dispatch into a fresh
    /// primary command buffer.
    pub fn record(
        device: &ash::Device,
        queue_family_index: u32,
        pipeline: &ComputePipeline,
        buffers: &ComputeBuffers,
        push: PushConstants,
        groups: (u32, u32),
    ) -> Result<Self> {
        let mut dispatch = Self {
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            groups,
        };
        if let Err(err) = dispatch.build(device, queue_family_index, pipeline, buffers, push) {
            dispatch.destroy(device);
            return Err(err);
        }
        debug!(
            "recorded dispatch of {}x{} workgroups for {} elements",
            groups.0, groups.1, push.element_count
        );
        Ok(dispatch)
    }

    fn build(
        &mut self,
        device: &ash::Device,
        queue_family_index: u32,
        pipeline: &ComputePipeline,
        buffers: &ComputeBuffers,
        push: PushConstants,
    ) -> Result<()> {
        self.descriptor_pool = create_descriptor_pool(device)?;
        self.descriptor_set =
            allocate_descriptor_set(device, self.descriptor_pool, pipeline.descriptor_set_layout)?;
        write_descriptor_set(device, self.descriptor_set, &buffers.descriptors());

        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family_index);
        self.command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(ComputeError::init(stage::COMMAND_POOL))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(ComputeError::init(stage::COMMAND_BUFFER))?[0];

        // Recorded without ONE_TIME_SUBMIT so it can be submitted again.
        let begin_info = vk::CommandBufferBeginInfo::default();
        let cb = self.command_buffer;
        unsafe {
            device.begin_command_buffer(cb, &begin_info)?;
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                cb,
                pipeline.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );
            device.cmd_dispatch(cb, self.groups.0, self.groups.1, 1);
            // Output writes become visible to host reads once the queue drains.
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[host_read_barrier()],
                &[],
                &[],
            );
            device.end_command_buffer(cb)?;
        }
        Ok(())
    }

    /// Submit the recorded command buffer and wait for the queue to drain.
    pub fn submit(&self, device: &ash::Device, queue: vk::Queue) -> Result<()> {
        let command_buffers = [self.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        trace!("submitting {:?}", self.command_buffer);
        unsafe {
            device.queue_submit(queue, &[submit], vk::Fence::null())?;
            device.queue_wait_idle(queue)?;
        }
        Ok(())
    }

    /// Free the command buffer and destroy both pools.  Null handles are
    /// skipped, so this is safe after a partial `record`.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.command_buffer != vk::CommandBuffer::null() {
                device.free_command_buffers(self.command_pool, &[self.command_buffer]);
            }
            if self.command_pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.command_pool, None);
            }
            // Destroying the pool releases the descriptor set with it.
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
        }
        self.command_buffer = vk::CommandBuffer::null();
        self.command_pool = vk::CommandPool::null();
        self.descriptor_set = vk::DescriptorSet::null();
        self.descriptor_pool = vk::DescriptorPool::null();
    }
}

/// Makes compute-shader writes visible to host reads.
pub fn host_read_barrier() -> vk::MemoryBarrier<'static> {
    vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ)
}

fn create_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool> {
    let sizes = [vk::DescriptorPoolSize::default()
        .ty(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(BINDING_COUNT)];
    let info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&sizes);
    unsafe { device.create_descriptor_pool(&info, None) }
        .map_err(ComputeError::init(stage::DESCRIPTOR_POOL))
}

fn allocate_descriptor_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> Result<vk::DescriptorSet> {
    let layouts = [layout];
    let info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let sets = unsafe { device.allocate_descriptor_sets(&info) }
        .map_err(ComputeError::init(stage::DESCRIPTOR_SET))?;
    Ok(sets[0])
}

fn write_descriptor_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    infos: &[vk::DescriptorBufferInfo; BINDING_COUNT as usize],
) {
    let writes: Vec<vk::WriteDescriptorSet> = infos
        .iter()
        .enumerate()
        .map(|(binding, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding as u32)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(std::slice::from_ref(info))
        })
        .collect();
    unsafe { device.update_descriptor_sets(&writes, &[]) };
}
