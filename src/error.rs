//! Error type shared by every stage of a compute job.
//!
//! Initialization is a fail-fast chain: the first error aborts it and is
//! returned unchanged to the caller.  Nothing in this crate retries a
//! failed Vulkan call.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::job::JobState;

/// Stage names reported by [`ComputeError::Initialization`].
pub mod stage {
    pub const INSTANCE: &str = "instance";
    pub const DEVICE: &str = "logical device";
    pub const BUFFER: &str = "storage buffer";
    pub const MEMORY: &str = "memory allocation";
    pub const SHADER_MODULE: &str = "shader module";
    pub const DESCRIPTOR_SET_LAYOUT: &str = "descriptor set layout";
    pub const PIPELINE_LAYOUT: &str = "pipeline layout";
    pub const PIPELINE: &str = "compute pipeline";
    pub const DESCRIPTOR_POOL: &str = "descriptor pool";
    pub const DESCRIPTOR_SET: &str = "descriptor set";
    pub const COMMAND_POOL: &str = "command pool";
    pub const COMMAND_BUFFER: &str = "command buffer";
}

#[derive(Debug, Error)]
pub enum ComputeError {
    /// The Vulkan loader library is missing or could not be opened.
    #[error("failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    /// A Vulkan object could not be created.
    #[error("failed to create {stage}: {result}")]
    Initialization {
        stage: &'static str,
        result: vk::Result,
    },

    #[error("no physical device offers a compute queue and the required extensions")]
    NoSuitableDevice,

    #[error("no queue family supports compute")]
    NoComputeQueue,

    #[error("no memory type has flags {flags:?} and a heap larger than {min_size} bytes")]
    NoMatchingMemoryType {
        flags: vk::MemoryPropertyFlags,
        min_size: vk::DeviceSize,
    },

    /// The device rejected a host mapping.
    #[error("failed to map device memory: {0}")]
    MapFailure(vk::Result),

    #[error("memory region has already been freed")]
    RegionFreed,

    #[error("failed to load SPIR-V from {}: {source}", path.display())]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid job configuration: {0}")]
    Precondition(String),

    #[error("invalid region layout: {0}")]
    Layout(String),

    #[error("compute job is not ready (state: {0:?})")]
    NotReady(JobState),

    #[error("Vulkan call failed: {0}")]
    Vk(#[from] vk::Result),
}

impl ComputeError {
    /// Helper for `map_err` on Vulkan create calls.
    pub(crate) fn init(stage: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| ComputeError::Initialization { stage, result }
    }

    /// True when the failure means "there is no usable Vulkan device here"
    /// rather than a bug in the job itself.
    pub fn is_device_unavailable(&self) -> bool {
        match self {
            ComputeError::Loader(_)
            | ComputeError::NoSuitableDevice
            | ComputeError::NoComputeQueue => true,
            ComputeError::Initialization { stage: failed, .. } => *failed == stage::INSTANCE,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;
