//! Shared helpers for the integration tests.

use vulkan_compute_framework::{ComputeError, ComputeJob, JobConfig, ShaderSource};

mod spirv;

pub use spirv::vector_add_spirv;

pub fn config(element_count: u32, workgroup_size: u32) -> JobConfig {
    JobConfig::default()
        .with_element_count(element_count)
        .with_workgroup_size(workgroup_size)
        .with_shader(ShaderSource::Words(vector_add_spirv(workgroup_size)))
        .with_validation(false)
}

/// Initialize a job, or return `None` when this machine has no usable
/// Vulkan device.
pub fn ready_job(config: JobConfig) -> Option<ComputeJob> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut job = ComputeJob::new(config);
    match job.init() {
        Ok(()) => Some(job),
        Err(err) if err.is_device_unavailable() => {
            eprintln!("skipping: no Vulkan device available ({err})");
            None
        }
        Err(ComputeError::NoMatchingMemoryType { flags, .. }) => {
            eprintln!("skipping: device has no {flags:?} memory large enough");
            None
        }
        Err(err) => panic!("job initialization failed: {err}"),
    }
}
