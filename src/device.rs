//! Physical device discovery and selection.
//!
//! Selection is first-fit: the first device in enumeration order that has a
//! compute-capable queue family and supports every required extension wins.
//! Devices are not ranked by type, speed or memory size.

use std::collections::BTreeSet;

use ash::vk;
use log::debug;

use crate::error::{ComputeError, Result};

/// Everything selection and allocation need to know about one physical
/// device, gathered once up front.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub extensions: Vec<String>,
    pub limits: vk::PhysicalDeviceLimits,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceCandidate {
    /// Query `physical_device` through `instance`.
    pub fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let (properties, queue_families, extension_properties, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_queue_family_properties(physical_device),
                instance.enumerate_device_extension_properties(physical_device)?,
                instance.get_physical_device_memory_properties(physical_device),
            )
        };
        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed device>".to_string());
        let extensions = extension_properties
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        Ok(Self {
            handle: physical_device,
            name,
            device_type: properties.device_type,
            queue_families,
            extensions,
            limits: properties.limits,
            memory_properties,
        })
    }
}

/// All physical devices known to `instance`, in enumeration order.
pub fn enumerate_candidates(instance: &ash::Instance) -> Result<Vec<DeviceCandidate>> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    devices
        .into_iter()
        .map(|pd| DeviceCandidate::query(instance, pd))
        .collect()
}

/// Index of the first queue family with at least one queue that supports
/// compute.
pub fn find_queue_family_index(families: &[vk::QueueFamilyProperties]) -> Result<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
        .ok_or(ComputeError::NoComputeQueue)
}

/// Required extensions the candidate does not support.
pub fn missing_extensions<'a>(candidate: &DeviceCandidate, required: &'a [String]) -> Vec<&'a str> {
    let available: BTreeSet<&str> = candidate.extensions.iter().map(String::as_str).collect();
    required
        .iter()
        .map(String::as_str)
        .filter(|name| !available.contains(name))
        .collect()
}

pub fn is_device_suitable(candidate: &DeviceCandidate, required: &[String]) -> bool {
    find_queue_family_index(&candidate.queue_families).is_ok()
        && missing_extensions(candidate, required).is_empty()
}

/// First suitable candidate in enumeration order.
pub fn select_device<'a>(
    candidates: &'a [DeviceCandidate],
    required: &[String],
) -> Result<&'a DeviceCandidate> {
    for candidate in candidates {
        if is_device_suitable(candidate, required) {
            return Ok(candidate);
        }
        debug!(
            "skipping {} ({:?}): compute queue {}, missing extensions {:?}",
            candidate.name,
            candidate.device_type,
            find_queue_family_index(&candidate.queue_families).is_ok(),
            missing_extensions(candidate, required)
        );
    }
    Err(ComputeError::NoSuitableDevice)
}
