//! The compute job: one shader, three buffers, one device.
//!
//! ```no_run
//! use vulkan_compute_framework::{ComputeJob, JobConfig, ShaderSource};
//!
//! let config = JobConfig::default()
//!     .with_element_count(4)
//!     .with_shader(ShaderSource::Path("shaders/comp.spv".into()));
//! let mut job = ComputeJob::new(config);
//! job.init()?;
//! job.run_with(&[1.0, 2.0, 3.0, 4.0], &[10.0, 20.0, 30.0, 40.0])?;
//! assert_eq!(job.result(), vec![11.0, 22.0, 33.0, 44.0]);
//! # Ok::<(), vulkan_compute_framework::ComputeError>(())
//! ```

use ash::vk;
use log::{debug, error, info, warn};
use rand::distributions::Uniform;
use rand::Rng;

use crate::allocator::ComputeBuffers;
use crate::compute::{split_workgroups, workgroup_count, RecordedDispatch};
use crate::config::JobConfig;
use crate::context::{GpuContext, VulkanInstance};
use crate::error::{ComputeError, Result};
use crate::pipeline::{load_spirv, ComputePipeline, PushConstants};

/// Lifecycle of a [`ComputeJob`].
///
/// `init` walks the states from `Uninitialized` to `Ready`; a failure
/// leaves the job in the last state it reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Uninitialized,
    InstanceCreated,
    DeviceCreated,
    BuffersCreated,
    PipelineReady,
    CommandRecorded,
    Ready,
    Running,
    Idle,
    Destroyed,
}

impl JobState {
    /// Whether the job can be run and its result read.
    pub fn is_ready(self) -> bool {
        matches!(self, JobState::Ready | JobState::Idle)
    }
}

pub struct ComputeJob {
    config: JobConfig,
    state: JobState,
    dispatch: Option<RecordedDispatch>,
    pipeline: Option<ComputePipeline>,
    buffers: Option<ComputeBuffers>,
    context: Option<GpuContext>,
}

impl ComputeJob {
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            state: JobState::Uninitialized,
            dispatch: None,
            pipeline: None,
            buffers: None,
            context: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// The selected device, once `init` has got that far.
    pub fn context(&self) -> Option<&GpuContext> {
        self.context.as_ref()
    }

    /// Create every Vulkan object the job needs and record the dispatch.
    ///
    /// The configuration and the shader are checked before any Vulkan call.
    /// The first failing stage aborts initialization; whatever was created
    /// before it is released by [`ComputeJob::destroy`] or on drop.
    pub fn init(&mut self) -> Result<()> {
        if self.state != JobState::Uninitialized {
            return Err(ComputeError::Precondition(format!(
                "init called on a job in state {:?}",
                self.state
            )));
        }
        let outcome = self.init_stages();
        match &outcome {
            Ok(()) => info!(
                "compute job ready: {} elements, workgroup size {}",
                self.config.element_count, self.config.workgroup_size
            ),
            Err(err) => error!("initialization stopped after {:?}: {err}", self.state),
        }
        outcome
    }

    fn init_stages(&mut self) -> Result<()> {
        self.config.validate()?;
        let code = load_spirv(&self.config.shader)?;

        let instance = VulkanInstance::new(&self.config)?;
        self.state = JobState::InstanceCreated;

        let context = self.context.insert(GpuContext::new(instance, &self.config)?);
        self.state = JobState::DeviceCreated;
        let groups = dispatch_grid(&self.config, &context.candidate.limits)?;

        let buffers = self.buffers.insert(ComputeBuffers::create(
            &context.device,
            &context.candidate,
            context.queue_family_index,
            self.config.element_count,
            self.config.memory_flags,
        )?);
        self.state = JobState::BuffersCreated;

        let pipeline = self.pipeline.insert(ComputePipeline::new(&context.device, &code)?);
        self.state = JobState::PipelineReady;

        self.dispatch = Some(RecordedDispatch::record(
            &context.device,
            context.queue_family_index,
            pipeline,
            buffers,
            PushConstants::new(self.config.element_count),
            groups,
        )?);
        self.state = JobState::CommandRecorded;

        self.state = JobState::Ready;
        Ok(())
    }

    /// Run the kernel on `a` and `b`, blocking until the device is idle.
    pub fn run_with(&mut self, a: &[f32], b: &[f32]) -> Result<()> {
        if !self.state.is_ready() {
            warn!("refusing to run a compute job in state {:?}", self.state);
            return Err(ComputeError::NotReady(self.state));
        }
        let n = self.config.element_count as usize;
        if a.len() != n || b.len() != n {
            return Err(ComputeError::Precondition(format!(
                "inputs have {} and {} elements, expected {n}",
                a.len(),
                b.len()
            )));
        }
        let (Some(context), Some(buffers), Some(dispatch)) =
            (self.context.as_ref(), self.buffers.as_mut(), self.dispatch.as_ref())
        else {
            return Err(ComputeError::NotReady(self.state));
        };

        self.state = JobState::Running;
        let outcome = buffers
            .write_inputs(&context.device, a, b)
            .and_then(|()| dispatch.submit(&context.device, context.queue));
        self.state = JobState::Idle;
        debug!("dispatch finished: {}", if outcome.is_ok() { "ok" } else { "failed" });
        outcome
    }

    /// Fill both inputs with uniform random values in `[1, 10)` and run.
    pub fn run(&mut self) -> Result<()> {
        if !self.state.is_ready() {
            warn!("refusing to run a compute job in state {:?}", self.state);
            return Err(ComputeError::NotReady(self.state));
        }
        let n = self.config.element_count as usize;
        let dist = Uniform::new(1.0f32, 10.0);
        let mut rng = rand::thread_rng();
        let a: Vec<f32> = (&mut rng).sample_iter(&dist).take(n).collect();
        let b: Vec<f32> = (&mut rng).sample_iter(&dist).take(n).collect();
        self.run_with(&a, &b)
    }

    /// The output buffer, or an empty vector if the job is not ready or
    /// the read fails.
    pub fn result(&mut self) -> Vec<f32> {
        match self.try_result() {
            Ok(values) => values,
            Err(err) => {
                warn!("no result available: {err}");
                Vec::new()
            }
        }
    }

    pub fn try_result(&mut self) -> Result<Vec<f32>> {
        if !self.state.is_ready() {
            return Err(ComputeError::NotReady(self.state));
        }
        match (self.context.as_ref(), self.buffers.as_mut()) {
            (Some(context), Some(buffers)) => buffers.read_output(&context.device),
            _ => Err(ComputeError::NotReady(self.state)),
        }
    }

    /// Current contents of input A and input B.
    pub fn inputs(&mut self) -> Result<(Vec<f32>, Vec<f32>)> {
        if !self.state.is_ready() {
            return Err(ComputeError::NotReady(self.state));
        }
        match (self.context.as_ref(), self.buffers.as_mut()) {
            (Some(context), Some(buffers)) => buffers.read_inputs(&context.device),
            _ => Err(ComputeError::NotReady(self.state)),
        }
    }

    /// Release every Vulkan object the job owns, newest first.  Safe to
    /// call on a partially initialized job and more than once.
    pub fn destroy(&mut self) {
        if self.state == JobState::Destroyed {
            return;
        }
        if let Some(context) = self.context.as_ref() {
            if let Err(err) = context.wait_idle() {
                warn!("device did not go idle before teardown: {err}");
            }
            let device = &context.device;
            if let Some(mut dispatch) = self.dispatch.take() {
                dispatch.destroy(device);
            }
            if let Some(mut pipeline) = self.pipeline.take() {
                pipeline.destroy(device);
            }
            if let Some(mut buffers) = self.buffers.take() {
                buffers.destroy(device);
            }
        }
        // Drops the device, then the debug messenger and the instance.
        self.context = None;
        self.state = JobState::Destroyed;
        debug!("compute job destroyed");
    }
}

/// Workgroup grid for `config` on a device with `limits`.  Buffers larger
/// than `maxStorageBufferRange` and grids beyond the Y dimension limit are
/// rejected before anything is allocated.
fn dispatch_grid(config: &JobConfig, limits: &vk::PhysicalDeviceLimits) -> Result<(u32, u32)> {
    let size = config.buffer_size();
    if size > vk::DeviceSize::from(limits.max_storage_buffer_range) {
        return Err(ComputeError::Precondition(format!(
            "buffers of {size} bytes exceed the device's storage buffer range of {} bytes",
            limits.max_storage_buffer_range
        )));
    }
    let total = workgroup_count(config.element_count, config.workgroup_size);
    let groups = split_workgroups(total, limits.max_compute_work_group_count[0]);
    if groups.1 > limits.max_compute_work_group_count[1] {
        return Err(ComputeError::Precondition(format!(
            "{total} workgroups exceed the device's dispatch limits"
        )));
    }
    Ok(groups)
}

impl Drop for ComputeJob {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShaderSource;

    fn job(element_count: u32) -> ComputeJob {
        ComputeJob::new(JobConfig::default().with_element_count(element_count))
    }

    #[test]
    fn result_before_init_is_empty() {
        let mut job = job(4);
        assert!(job.result().is_empty());
        assert!(matches!(
            job.try_result(),
            Err(ComputeError::NotReady(JobState::Uninitialized))
        ));
    }

    #[test]
    fn run_before_init_is_refused() {
        let mut job = job(4);
        assert!(matches!(job.run(), Err(ComputeError::NotReady(JobState::Uninitialized))));
        let a = [1.0; 4];
        assert!(matches!(job.run_with(&a, &a), Err(ComputeError::NotReady(_))));
        assert!(job.inputs().is_err());
        assert_eq!(job.state(), JobState::Uninitialized);
    }

    #[test]
    fn zero_elements_fail_before_any_vulkan_call() {
        let mut job = job(0);
        let err = job.init().unwrap_err();
        assert!(matches!(err, ComputeError::Precondition(_)));
        assert!(!err.is_device_unavailable());
        assert_eq!(job.state(), JobState::Uninitialized);
        assert!(job.context().is_none());
    }

    #[test]
    fn missing_shader_fails_before_any_vulkan_call() {
        let config = JobConfig::default()
            .with_element_count(4)
            .with_shader(ShaderSource::Path("does/not/exist.spv".into()));
        let mut job = ComputeJob::new(config);
        assert!(matches!(job.init(), Err(ComputeError::Shader { .. })));
        assert_eq!(job.state(), JobState::Uninitialized);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut job = job(4);
        job.destroy();
        assert_eq!(job.state(), JobState::Destroyed);
        job.destroy();
        assert_eq!(job.state(), JobState::Destroyed);
        assert!(job.result().is_empty());
        assert!(matches!(job.init(), Err(ComputeError::Precondition(_))));
    }

    fn limits(storage_range: u32, groups: [u32; 3]) -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            max_storage_buffer_range: storage_range,
            max_compute_work_group_count: groups,
            ..Default::default()
        }
    }

    #[test]
    fn oversize_buffers_are_rejected_before_allocation() {
        let base = limits(128 << 20, [65_535; 3]);
        let fits = JobConfig::default().with_element_count(32 << 20);
        assert_eq!(dispatch_grid(&fits, &base).unwrap(), (65_535, 513));

        let too_big = JobConfig::default().with_element_count((32 << 20) + 1);
        let err = dispatch_grid(&too_big, &base).unwrap_err();
        assert!(matches!(err, ComputeError::Precondition(ref m) if m.contains("storage buffer range")));
    }

    #[test]
    fn grid_must_fit_both_dimensions() {
        let config = JobConfig::default().with_element_count(1 << 20);
        assert_eq!(dispatch_grid(&config, &limits(u32::MAX, [65_535; 3])).unwrap(), (65_535, 17));
        assert_eq!(
            dispatch_grid(&config.clone().with_workgroup_size(64), &limits(u32::MAX, [65_535; 3]))
                .unwrap(),
            (16_384, 1)
        );
        assert!(dispatch_grid(&config, &limits(u32::MAX, [1024, 16, 1])).is_err());
    }

    #[test]
    fn ready_states() {
        assert!(JobState::Ready.is_ready());
        assert!(JobState::Idle.is_ready());
        assert!(!JobState::Running.is_ready());
        assert!(!JobState::CommandRecorded.is_ready());
        assert!(!JobState::Destroyed.is_ready());
    }
}
