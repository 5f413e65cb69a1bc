//! A small framework for running a single compute kernel on a Vulkan
//! device.  The goal of this crate is to take the boilerplate out of
//! sending two input vectors to the GPU, executing a SPIR-V compute shader
//! on them and reading the result back to the CPU.
//!
//! All three buffers share one host-visible device allocation, carved into
//! equal slots.  The command buffer is recorded once at initialization and
//! resubmitted by every run.  The API is synchronous and blocking: a run
//! returns only after the queue is idle.
//!
//! Most users only need [`ComputeJob`] and [`JobConfig`]; the lower-level
//! modules are public for callers who want to assemble the stages
//! themselves.

pub mod allocator;
pub mod buffer;
pub mod compute;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod job;
pub mod memory;
pub mod pipeline;

// Re-export the most common types at the crate root so that users can
// simply `use vulkan_compute_framework::*;`.
pub use allocator::{find_memory_type_index, ComputeBuffers};
pub use buffer::GpuBuffer;
pub use compute::{split_workgroups, workgroup_count, RecordedDispatch};
pub use config::{JobConfig, ShaderSource};
pub use context::{GpuContext, VulkanInstance};
pub use device::{find_queue_family_index, is_device_suitable, select_device, DeviceCandidate};
pub use error::{ComputeError, Result};
pub use job::{ComputeJob, JobState};
pub use memory::{MemoryRegion, RegionLayout, Slot, SlotId};
pub use pipeline::{load_spirv, ComputePipeline, PushConstants};
