//! Vulkan instance creation
//!
//! Owns the entry point, the instance and, when validation is enabled, the
//! debug messenger that forwards validation output to `log`.

use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::{Entry, Instance};
use std::ffi::{c_char, CStr, CString};

use crate::core::config::RendererConfig;
use crate::render::error::{resource, RenderError, RenderResult};
use crate::render::window::GlfwWindow;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const PORTABILITY_ENUMERATION: &CStr = c"VK_KHR_portability_enumeration";

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance with the extensions the window needs
    pub fn new(window: &GlfwWindow, config: &RendererConfig) -> RenderResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| RenderError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| RenderError::InitializationFailed("Application name contains NUL".to_string()))?;
        let (major, minor, patch) = config.application_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(c"FrameEngine")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let window_extensions = window
            .required_instance_extensions()?
            .into_iter()
            .map(|ext| {
                CString::new(ext).map_err(|_| {
                    RenderError::InitializationFailed("Extension name contains NUL".to_string())
                })
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let available = entry
            .enumerate_instance_extension_properties(None)
            .map_err(resource("enumerate instance extensions"))?;
        let is_available = |name: &CStr| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };

        let mut extensions: Vec<*const c_char> = window_extensions.iter().map(|ext| ext.as_ptr()).collect();
        if config.enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        if config.driver_compat_shims {
            if is_available(PORTABILITY_ENUMERATION) {
                extensions.push(PORTABILITY_ENUMERATION.as_ptr());
                flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
                log::info!("Portability enumeration enabled");
            } else {
                log::warn!("Driver compatibility shims requested but portability enumeration is unavailable");
            }
        }

        let layers: Vec<*const c_char> = if config.enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(resource("create instance"))?
        };

        let debug = if config.enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err);
                }
            }
        } else {
            None
        };

        log::debug!(
            "Created Vulkan instance (validation: {}, extensions: {})",
            config.enable_validation,
            extensions.len()
        );

        Ok(Self {
            entry,
            instance,
            debug,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> RenderResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(resource("create debug messenger"))
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = &self.debug {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Forwards validation messages to `log` at the matching level
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        log::info!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::trace!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}
