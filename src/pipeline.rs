//! Compute pipeline construction.
//!
//! The pipeline has a fixed interface: one descriptor set with three
//! storage buffers (input A, input B, output at bindings 0, 1, 2) and a
//! 16-byte push-constant block whose first field is the element count.
//! The kernel itself is an opaque SPIR-V blob with an entry point called
//! `main`.

use std::io::Cursor;
use std::path::Path;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::{debug, error};

use crate::config::ShaderSource;
use crate::error::{stage, ComputeError, Result};

/// Number of storage-buffer bindings in the descriptor set.
pub const BINDING_COUNT: u32 = 3;

/// Push constants handed to every dispatch.
///
/// Only `element_count` is read by current kernels; the reserved fields
/// keep the block at 16 bytes and are always zero.
///
/// The count is pushed as a `u32`, not as an `f32` in a `vec4`. A kernel
/// that declares its push block as `vec4<f32>` reads the bit pattern of
/// the integer and gets a denormal, so kernels must declare a `u32` first.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
pub struct PushConstants {
    pub element_count: u32,
    pub reserved: [u32; 3],
}

impl PushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(element_count: u32) -> Self {
        Self {
            element_count,
            reserved: [0; 3],
        }
    }
}

/// Read SPIR-V words from a file.  `ash::util::read_spv` checks that the
/// length is a multiple of four and fixes the endianness from the magic
/// number.
pub fn load_spirv_file(path: &Path) -> Result<Vec<u32>> {
    let shader_error = |source| ComputeError::Shader {
        path: path.to_path_buf(),
        source,
    };
    let bytes = std::fs::read(path).map_err(shader_error)?;
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(shader_error)
}

pub fn load_spirv(source: &ShaderSource) -> Result<Vec<u32>> {
    match source {
        ShaderSource::Path(path) => load_spirv_file(path),
        ShaderSource::Words(words) => Ok(words.clone()),
    }
}

/// Descriptor-set layout, pipeline layout and pipeline for one kernel.
#[derive(Debug)]
pub struct ComputePipeline {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl ComputePipeline {
    /// Build the pipeline from SPIR-V `code`.  If a later step fails the
    /// objects created by earlier steps are destroyed before returning.
    pub fn new(device: &ash::Device, code: &[u32]) -> Result<Self> {
        let descriptor_set_layout = create_descriptor_set_layout(device)?;

        let pipeline_layout = match create_pipeline_layout(device, descriptor_set_layout) {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(descriptor_set_layout, None) };
                return Err(err);
            }
        };

        let pipeline = match create_pipeline(device, pipeline_layout, code) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                error!("compute pipeline creation failed: {err}");
                unsafe {
                    device.destroy_pipeline_layout(pipeline_layout, None);
                    device.destroy_descriptor_set_layout(descriptor_set_layout, None);
                }
                return Err(err);
            }
        };

        debug!("compute pipeline ready ({} SPIR-V words)", code.len());
        Ok(Self {
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
        })
    }

    /// Destroy pipeline, pipeline layout and set layout, in that order.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        self.pipeline = vk::Pipeline::null();
        self.pipeline_layout = vk::PipelineLayout::null();
        self.descriptor_set_layout = vk::DescriptorSetLayout::null();
    }
}

/// Bindings 0, 1 and 2: storage buffers visible to the compute stage.
pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; BINDING_COUNT as usize] {
    [0, 1, 2].map(|binding| {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
    })
}

pub fn push_constant_range() -> vk::PushConstantRange {
    vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .offset(0)
        .size(PushConstants::SIZE)
}

fn create_descriptor_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = layout_bindings();
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&info, None) }
        .map_err(ComputeError::init(stage::DESCRIPTOR_SET_LAYOUT))
}

fn create_pipeline_layout(
    device: &ash::Device,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    let set_layouts = [set_layout];
    let ranges = [push_constant_range()];
    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&ranges);
    unsafe { device.create_pipeline_layout(&info, None) }
        .map_err(ComputeError::init(stage::PIPELINE_LAYOUT))
}

fn create_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    code: &[u32],
) -> Result<vk::Pipeline> {
    let module_info = vk::ShaderModuleCreateInfo::default().code(code);
    let module = unsafe { device.create_shader_module(&module_info, None) }
        .map_err(ComputeError::init(stage::SHADER_MODULE))?;

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout);
    let created = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
    };
    // The module is only needed while the pipeline is being created.
    unsafe { device.destroy_shader_module(module, None) };

    let pipelines = created.map_err(|(_, result)| ComputeError::Initialization {
        stage: stage::PIPELINE,
        result,
    })?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn push_constants_are_sixteen_bytes_with_count_first() {
        assert_eq!(PushConstants::SIZE, 16);
        let pc = PushConstants::new(0x0102_0304);
        let bytes = bytemuck::bytes_of(&pc);
        assert_eq!(&bytes[..4], &0x0102_0304u32.to_ne_bytes());
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn bindings_match_buffer_order() {
        let bindings = layout_bindings();
        for (i, b) in bindings.iter().enumerate() {
            assert_eq!(b.binding, i as u32);
            assert_eq!(b.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
            assert_eq!(b.descriptor_count, 1);
            assert_eq!(b.stage_flags, vk::ShaderStageFlags::COMPUTE);
        }
        let range = push_constant_range();
        assert_eq!((range.offset, range.size), (0, 16));
    }

    #[test]
    fn spirv_file_must_be_word_aligned() {
        let dir = std::env::temp_dir().join(format!("vkcompute-spv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.spv");
        let words = [0x0723_0203u32, 0x0001_0000, 0, 1, 0];
        std::fs::File::create(&good)
            .unwrap()
            .write_all(bytemuck::cast_slice(&words))
            .unwrap();
        assert_eq!(load_spirv_file(&good).unwrap(), words);

        let bad = dir.join("bad.spv");
        std::fs::write(&bad, [0x03, 0x02, 0x23]).unwrap();
        assert!(matches!(load_spirv_file(&bad), Err(ComputeError::Shader { .. })));

        let missing = dir.join("missing.spv");
        assert!(matches!(load_spirv_file(&missing), Err(ComputeError::Shader { .. })));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn in_memory_words_pass_through() {
        let words = vec![0x0723_0203, 1, 2];
        assert_eq!(load_spirv(&ShaderSource::Words(words.clone())).unwrap(), words);
    }
}
