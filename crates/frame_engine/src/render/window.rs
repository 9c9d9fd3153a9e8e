//! Window management using GLFW
//!
//! The frame core only needs three things from a window: the current
//! framebuffer size, whether a resize happened since the last frame, and a
//! way to block until the window system has something to say (used while
//! minimized). [`SurfaceProvider`] captures that; [`GlfwWindow`] is the
//! real implementation and [`ScriptedSurface`] replays a fixed sequence for
//! tests.

use ash::vk;
use std::collections::VecDeque;
use thiserror::Error;

use crate::core::config::WindowConfig;

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// GLFW could not be initialized
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// The window could not be created
    #[error("Window creation failed")]
    CreationFailed,

    /// Any other GLFW failure
    #[error("GLFW error: {0}")]
    GlfwError(String),
}

/// Result type for window operations
pub type WindowResult<T> = Result<T, WindowError>;

/// Source of framebuffer size and resize notifications
pub trait SurfaceProvider {
    /// Current framebuffer size in pixels
    fn framebuffer_extent(&self) -> vk::Extent2D;

    /// Return and clear the pending-resize flag
    fn take_resize_request(&mut self) -> bool;

    /// Block until at least one window event arrives
    fn wait_events(&mut self);
}

impl<T: SurfaceProvider + ?Sized> SurfaceProvider for &mut T {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        (**self).framebuffer_extent()
    }

    fn take_resize_request(&mut self) -> bool {
        (**self).take_resize_request()
    }

    fn wait_events(&mut self) {
        (**self).wait_events()
    }
}

/// GLFW window wrapper with proper resource management
pub struct GlfwWindow {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    resize_pending: bool,
}

impl GlfwWindow {
    /// Create a window without a client API for Vulkan rendering
    pub fn new(config: &WindowConfig) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|_| WindowError::InitializationFailed)?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(config.resizable));

        let (mut window, events) = glfw
            .create_window(config.width, config.height, &config.title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        log::debug!("Created {}x{} window '{}'", config.width, config.height, config.title);

        Ok(Self {
            glfw,
            window,
            events,
            resize_pending: false,
        })
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request the window to close
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Pump the event queue without blocking
    ///
    /// Framebuffer size events latch the resize flag; escape closes the
    /// window.
    pub fn poll_events(&mut self) {
        self.glfw.poll_events();
        self.drain_events();
    }

    fn drain_events(&mut self) {
        for (_, event) in glfw::flush_messages(&self.events) {
            match event {
                glfw::WindowEvent::FramebufferSize(width, height) => {
                    log::trace!("Framebuffer resized to {}x{}", width, height);
                    self.resize_pending = true;
                }
                glfw::WindowEvent::Key(glfw::Key::Escape, _, glfw::Action::Press, _) => {
                    self.window.set_should_close(true);
                }
                _ => {}
            }
        }
    }

    /// Vulkan instance extensions GLFW needs for surface creation
    pub fn required_instance_extensions(&self) -> WindowResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::GlfwError("Failed to get required extensions".to_string()))
    }

    /// Create a Vulkan surface for this window
    pub fn create_vulkan_surface(&mut self, instance: vk::Instance) -> WindowResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self.window.create_window_surface(instance, std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(WindowError::GlfwError(format!("Failed to create Vulkan surface: {result:?}")))
        }
    }
}

impl SurfaceProvider for GlfwWindow {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        let (width, height) = self.window.get_framebuffer_size();
        vk::Extent2D {
            width: u32::try_from(width).unwrap_or(0),
            height: u32::try_from(height).unwrap_or(0),
        }
    }

    fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.resize_pending)
    }

    fn wait_events(&mut self) {
        self.glfw.wait_events();
        self.drain_events();
    }
}

/// Surface provider that replays scripted extents
///
/// Each `wait_events` call moves to the next extent in the queue; the last
/// one is reported forever. Useful for driving minimize and resize sequences
/// without a window system.
#[derive(Debug, Clone)]
pub struct ScriptedSurface {
    extents: VecDeque<vk::Extent2D>,
    resize_requests: VecDeque<bool>,
    waits: usize,
}

impl ScriptedSurface {
    /// Provider that always reports `extent`
    pub fn fixed(extent: vk::Extent2D) -> Self {
        Self::sequence([extent])
    }

    /// Provider that reports `extents` in order, then repeats the last one
    pub fn sequence(extents: impl IntoIterator<Item = vk::Extent2D>) -> Self {
        Self {
            extents: extents.into_iter().collect(),
            resize_requests: VecDeque::new(),
            waits: 0,
        }
    }

    /// Append extents to report after the current ones
    pub fn push_extents(&mut self, extents: impl IntoIterator<Item = vk::Extent2D>) {
        self.extents.extend(extents);
    }

    /// Drop the remaining script and report `extents` from now on
    pub fn replace_extents(&mut self, extents: impl IntoIterator<Item = vk::Extent2D>) {
        self.extents = extents.into_iter().collect();
    }

    /// Make the next `take_resize_request` return true
    pub fn request_resize(&mut self) {
        self.resize_requests.push_back(true);
    }

    /// How many times `wait_events` was called
    pub fn wait_count(&self) -> usize {
        self.waits
    }

    fn advance(&mut self) {
        if self.extents.len() > 1 {
            self.extents.pop_front();
        }
    }
}

impl SurfaceProvider for ScriptedSurface {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        self.extents.front().copied().unwrap_or_default()
    }

    fn take_resize_request(&mut self) -> bool {
        self.resize_requests.pop_front().unwrap_or(false)
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        self.advance();
    }
}
