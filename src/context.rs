//! Vulkan instance and device initialization.
//!
//! [`VulkanInstance`] loads the Vulkan library at runtime, creates the
//! instance and, when asked, enables the Khronos validation layer with a
//! debug messenger that forwards messages to the `log` crate.
//! [`GpuContext`] picks a physical device and creates the logical device
//! with a single compute queue.
//!
//! Teardown runs in reverse: the logical device is destroyed before the
//! messenger, and the messenger before the instance.

use std::borrow::Cow;
use std::ffi::{c_void, CStr, CString};

use ash::{ext::debug_utils, vk, Entry};
use log::{debug, error, info, trace, warn};

use crate::config::JobConfig;
use crate::device::{enumerate_candidates, find_queue_family_index, select_device, DeviceCandidate};
use crate::error::{stage, ComputeError, Result};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[{message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[{message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => debug!("[{message_type:?}] {message}"),
        _ => trace!("[{message_type:?}] {message}"),
    }
    vk::FALSE
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// The loaded Vulkan library and an instance created from it.
pub struct VulkanInstance {
    // Keeps the loader library open for as long as the instance lives.
    pub entry: Entry,
    pub instance: ash::Instance,
    debug: Option<DebugMessenger>,
}

impl VulkanInstance {
    /// Load Vulkan and create an API 1.1 instance.
    ///
    /// If validation is requested but the layer or the debug-utils
    /// extension is not installed, a warning is logged and the instance is
    /// created without them.
    pub fn new(config: &JobConfig) -> Result<Self> {
        let entry = unsafe { Entry::load()? };

        let validation = config.enable_validation && validation_available(&entry);
        let layers: Vec<*const std::ffi::c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };
        let extensions: Vec<*const std::ffi::c_char> = if validation {
            vec![debug_utils::NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"vulkan-compute")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(ComputeError::init(stage::INSTANCE))?;
        info!("created Vulkan instance (validation: {validation})");

        let debug = if validation {
            match create_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    warn!("could not create debug messenger: {err}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug,
        })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug) = self.debug.take() {
                debug.loader.destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("destroyed Vulkan instance");
    }
}

fn validation_available(entry: &Entry) -> bool {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let has_layer = layers
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));
    if !has_layer {
        warn!("{VALIDATION_LAYER:?} is not installed; continuing without validation");
        return false;
    }
    let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
        .unwrap_or_default();
    let has_debug_utils = extensions
        .iter()
        .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == debug_utils::NAME));
    if !has_debug_utils {
        warn!("{:?} is not available; continuing without validation", debug_utils::NAME);
    }
    has_debug_utils
}

fn create_messenger(entry: &Entry, instance: &ash::Instance) -> Result<DebugMessenger> {
    let loader = debug_utils::Instance::new(entry, instance);
    let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = unsafe { loader.create_debug_utils_messenger(&info, None)? };
    Ok(DebugMessenger { loader, messenger })
}

/// Instance, selected physical device, logical device and compute queue.
pub struct GpuContext {
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub candidate: DeviceCandidate,
    // Dropped after the device (see `Drop` below).
    pub instance: VulkanInstance,
}

impl GpuContext {
    /// Select the first suitable physical device and create a logical
    /// device with one compute queue and `config.required_extensions`
    /// enabled.
    pub fn new(instance: VulkanInstance, config: &JobConfig) -> Result<Self> {
        let candidates = enumerate_candidates(&instance.instance)?;
        debug!("found {} physical device(s)", candidates.len());
        let candidate = select_device(&candidates, &config.required_extensions)?.clone();
        let queue_family_index = find_queue_family_index(&candidate.queue_families)?;
        info!(
            "selected {} ({:?}), compute queue family {queue_family_index}",
            candidate.name, candidate.device_type
        );

        let extension_names = config
            .required_extensions
            .iter()
            .map(|name| {
                CString::new(name.as_str()).map_err(|_| {
                    ComputeError::Precondition(format!("extension name {name:?} contains NUL"))
                })
            })
            .collect::<Result<Vec<CString>>>()?;
        let extension_ptrs: Vec<*const std::ffi::c_char> =
            extension_names.iter().map(|n| n.as_ptr()).collect();

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities)];
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);
        let device = unsafe {
            instance
                .instance
                .create_device(candidate.handle, &device_info, None)
        }
        .map_err(ComputeError::init(stage::DEVICE))?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        Ok(Self {
            device,
            queue,
            queue_family_index,
            candidate,
            instance,
        })
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };
        debug!("destroyed logical device on {}", self.candidate.name);
    }
}
