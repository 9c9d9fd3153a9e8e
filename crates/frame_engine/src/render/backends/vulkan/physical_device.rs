//! Physical device selection

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use ash::Instance;
use std::ffi::CStr;

use crate::render::error::{resource, RenderError, RenderResult};

const PORTABILITY_SUBSET: &CStr = c"VK_KHR_portability_subset";

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
    /// Whether the device requires the portability subset extension
    pub portability_subset: bool,
    /// Whether anisotropic sampling is supported
    pub sampler_anisotropy: bool,
}

impl PhysicalDeviceInfo {
    /// Select the first device with graphics, present and swapchain support
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> RenderResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(resource("enumerate physical devices"))?
        };

        for device in devices {
            match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => {
                    log::info!("Selected GPU: {}", info.name());
                    return Ok(info);
                }
                Err(err) => log::debug!("Skipping physical device: {}", err),
            }
        }

        Err(RenderError::InitializationFailed("No suitable GPU found".to_string()))
    }

    /// Human readable device name
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> RenderResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in (0u32..).zip(queue_families.iter()) {
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(resource("query surface support"))?
            };

            if present_support && present_family.is_none() {
                present_family = Some(index);
            }

            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family.ok_or_else(|| {
            RenderError::InitializationFailed("No graphics queue family found".to_string())
        })?;
        let present_family = present_family.ok_or_else(|| {
            RenderError::InitializationFailed("No present queue family found".to_string())
        })?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(resource("enumerate device extensions"))?
        };
        let has_extension = |name: &CStr| {
            extensions
                .iter()
                .any(|available| unsafe { CStr::from_ptr(available.extension_name.as_ptr()) } == name)
        };

        if !has_extension(SwapchainLoader::name()) {
            return Err(RenderError::InitializationFailed(
                "Swapchain extension not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            memory_properties,
            graphics_family,
            present_family,
            portability_subset: has_extension(PORTABILITY_SUBSET),
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
        })
    }

    /// Device extensions to enable on the logical device
    pub fn required_extensions(&self) -> Vec<&'static CStr> {
        let mut extensions = vec![SwapchainLoader::name()];
        if self.portability_subset {
            extensions.push(PORTABILITY_SUBSET);
        }
        extensions
    }
}
