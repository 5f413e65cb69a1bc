//! WGSL to SPIR-V for the vector-add kernel.
//!
//! Shared by the integration tests, the bench and the demo; the latter two
//! pull it in with `#[path]`.

const VECTOR_ADD_WGSL: &str = include_str!("../../shaders/vector_add.wgsl");

/// Compile the vector-add kernel for `workgroup_size` invocations per group.
pub fn vector_add_spirv(workgroup_size: u32) -> Vec<u32> {
    let source = VECTOR_ADD_WGSL.replace("WORKGROUP_SIZE", &workgroup_size.to_string());
    let module = naga::front::wgsl::parse_str(&source).expect("vector_add.wgsl parses");
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::PUSH_CONSTANT,
    )
    .validate(&module)
    .expect("vector_add.wgsl validates");
    let pipeline = naga::back::spv::PipelineOptions {
        shader_stage: naga::ShaderStage::Compute,
        entry_point: "main".into(),
    };
    naga::back::spv::write_vec(
        &module,
        &info,
        &naga::back::spv::Options::default(),
        Some(&pipeline),
    )
    .expect("SPIR-V generation succeeds")
}
