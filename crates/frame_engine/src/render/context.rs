//! Device context
//!
//! Root owner of the device and the transient command pool. Every other
//! resource holds its own [`DeviceRef`], so the device itself is released
//! only once the last of them is gone.

use ash::vk;
use std::rc::Rc;

use crate::core::config::RendererConfig;
use crate::render::backends::vulkan::VulkanDevice;
use crate::render::binding::BindingManager;
use crate::render::commands::{CommandRecorder, TransientExecutor};
use crate::render::device::DeviceRef;
use crate::render::error::{RenderError, RenderResult};
use crate::render::window::GlfwWindow;

/// Device, transient executor and frame slot count
pub struct DeviceContext {
    transient: TransientExecutor,
    frames_in_flight: usize,
    device: DeviceRef,
}

impl DeviceContext {
    /// Wrap an existing device
    pub fn new(device: DeviceRef, frames_in_flight: usize) -> RenderResult<Self> {
        if frames_in_flight == 0 {
            return Err(RenderError::illegal("frames in flight must be at least 1"));
        }
        let transient = TransientExecutor::new(&device)?;
        Ok(Self {
            transient,
            frames_in_flight,
            device,
        })
    }

    /// Create the Vulkan device for `window` and wrap it
    ///
    /// The concrete device is returned alongside for pipeline construction,
    /// which needs backend-specific calls.
    pub fn create_vulkan(window: &mut GlfwWindow, config: &RendererConfig) -> RenderResult<(Self, Rc<VulkanDevice>)> {
        config.validate().map_err(RenderError::InitializationFailed)?;

        let vulkan = Rc::new(VulkanDevice::new(window, config)?);
        let device: DeviceRef = vulkan.clone();
        let context = Self::new(device, config.max_frames_in_flight)?;

        log::info!(
            "Device context ready on {} with {} frames in flight",
            vulkan.physical_device().name(),
            config.max_frames_in_flight
        );
        Ok((context, vulkan))
    }

    /// Shared device handle
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Number of frame slots (F)
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// One-shot command executor
    pub fn transient(&self) -> &TransientExecutor {
        &self.transient
    }

    /// Record and synchronously execute a one-shot command buffer
    pub fn run_transient<F>(&self, operation: &'static str, record: F) -> RenderResult<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> RenderResult<()>,
    {
        self.transient.execute(operation, record)
    }

    /// Copy `size` bytes between buffers and wait for completion
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> RenderResult<()> {
        self.transient.copy_buffer(src, dst, size)
    }

    /// Empty binding manager with one instance per frame slot
    pub fn binding_manager(&self) -> BindingManager {
        BindingManager::new(&self.device, self.frames_in_flight)
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> RenderResult<()> {
        self.device.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessDevice, ObjectKind};

    #[test]
    fn test_context_owns_transient_pool() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        {
            let context = DeviceContext::new(headless.clone(), 2).unwrap();
            assert_eq!(context.frames_in_flight(), 2);
            assert_eq!(headless.live_count(ObjectKind::CommandPool), 1);
            context.run_transient("noop", |_| Ok(())).unwrap();
        }
        assert_eq!(headless.total_live(), 0);
        assert!(headless.violations().is_empty());
    }

    #[test]
    fn test_zero_frames_rejected() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        assert!(matches!(
            DeviceContext::new(headless, 0),
            Err(RenderError::IllegalState { .. })
        ));
    }
}
