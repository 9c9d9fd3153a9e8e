//! Device backends
//!
//! - [`vulkan`]: the `ash` implementation used by applications
//! - [`headless`]: recording device for tests and tooling

pub mod headless;
pub mod vulkan;

pub use headless::HeadlessDevice;
pub use vulkan::VulkanDevice;
