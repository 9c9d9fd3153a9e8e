//! # Frame Engine
//!
//! GPU resource lifecycle and frame synchronization on Vulkan.
//!
//! ## Features
//!
//! - **Frames in flight**: F slots, each with its own fence, semaphores,
//!   command buffer and descriptor set instance
//! - **Swap image recreation**: stale surfaces, resizes and minimized
//!   windows handled inside `draw_frame`
//! - **Binding manager**: declare bindings once, get per-slot mapped
//!   buffers and descriptor sets
//! - **Headless backend**: a recording device for tests and tooling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use frame_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ApplicationConfig::default();
//!     let mut window = GlfwWindow::new(&config.window)?;
//!     let (context, _vulkan) = DeviceContext::create_vulkan(&mut window, &config.renderer)?;
//!
//!     let mut driver = FrameDriver::new(&context, &mut window, &config.renderer)?;
//!     while !driver.window().should_close() {
//!         driver.window_mut().poll_events();
//!         driver.draw_frame()?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        core::{ApplicationConfig, LoggingConfig, PresentModePreference, RendererConfig, WindowConfig},
        foundation::logging::LogSeverity,
        render::{
            BindingManager, DeviceContext, DrawObject, FrameDriver, FrameOutcome, GlfwWindow, IndexBuffer,
            PipelineBinding, RenderError, RenderResult, Sampler, SamplerConfig, SurfaceProvider, Texture,
            VertexBuffer, VertexLayout,
        },
    };
}
