//! Vulkan backend built on `ash`

pub mod device;
pub mod instance;
pub mod physical_device;
pub mod pipeline;

pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use physical_device::PhysicalDeviceInfo;
pub use pipeline::{GraphicsPipeline, PipelineConfig, ShaderModule};
