//! Job configuration.

use std::path::PathBuf;

use ash::vk;

use crate::error::{ComputeError, Result};

/// Where the compute kernel's SPIR-V comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    /// A `.spv` file on disk.
    Path(PathBuf),
    /// SPIR-V words already in memory.
    Words(Vec<u32>),
}

/// Everything a [`crate::ComputeJob`] needs to know before `init`.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Number of `f32` elements in each of the three buffers.
    pub element_count: u32,
    /// Elements handled per work-group (the shader's `local_size_x`).
    /// `element_count` must be a multiple of it.
    pub workgroup_size: u32,
    /// Device extensions that a physical device must support; they are
    /// also enabled on the logical device.
    pub required_extensions: Vec<String>,
    /// Enable `VK_LAYER_KHRONOS_validation` when it is installed.
    pub enable_validation: bool,
    pub shader: ShaderSource,
    /// Property flags the shared memory type must have.
    pub memory_flags: vk::MemoryPropertyFlags,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            element_count: 1024 * 1024,
            workgroup_size: 1,
            required_extensions: Vec::new(),
            enable_validation: cfg!(debug_assertions),
            shader: ShaderSource::Path(PathBuf::from("shaders/comp.spv")),
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }
}

impl JobConfig {
    pub fn with_element_count(mut self, element_count: u32) -> Self {
        self.element_count = element_count;
        self
    }

    pub fn with_workgroup_size(mut self, workgroup_size: u32) -> Self {
        self.workgroup_size = workgroup_size;
        self
    }

    pub fn with_shader(mut self, shader: ShaderSource) -> Self {
        self.shader = shader;
        self
    }

    pub fn with_required_extension(mut self, name: impl Into<String>) -> Self {
        self.required_extensions.push(name.into());
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    pub fn with_memory_flags(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.memory_flags = flags;
        self
    }

    /// Bytes in one of the three buffers.
    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.element_count as vk::DeviceSize * std::mem::size_of::<f32>() as vk::DeviceSize
    }

    /// Reject sizes the dispatch cannot cover exactly.  Runs before any
    /// Vulkan object is created.
    pub fn validate(&self) -> Result<()> {
        if self.element_count == 0 {
            return Err(ComputeError::Precondition("element count must be positive".into()));
        }
        if self.workgroup_size == 0 {
            return Err(ComputeError::Precondition("workgroup size must be positive".into()));
        }
        if self.element_count % self.workgroup_size != 0 {
            return Err(ComputeError::Precondition(format!(
                "element count {} is not a multiple of the workgroup size {}",
                self.element_count, self.workgroup_size
            )));
        }
        if !self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(ComputeError::Precondition(
                "the shared memory type must be HOST_VISIBLE".into(),
            ));
        }
        Ok(())
    }
}
