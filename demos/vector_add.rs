//! Element-wise vector addition on the GPU.
//!
//! Run this demo with:
//!
//! ```sh
//! RUST_LOG=info cargo run --example vector_add
//! ```
//!
//! The kernel lives in `shaders/vector_add.wgsl` and is compiled to
//! SPIR-V at startup with naga, so no offline shader compiler is needed.

use vulkan_compute_framework::{ComputeJob, JobConfig, ShaderSource};

#[path = "../tests/common/spirv.rs"]
mod spirv;

fn main() {
    env_logger::init();

    let a: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
    let b: Vec<f32> = vec![5.0, 6.0, 7.0, 8.0];

    let config = JobConfig::default()
        .with_element_count(a.len() as u32)
        .with_shader(ShaderSource::Words(spirv::vector_add_spirv(1)));
    let mut job = ComputeJob::new(config);
    job.init().expect("failed to initialise the compute job");
    job.run_with(&a, &b).expect("dispatch failed");
    println!("Result: {:?}", job.result());
}
