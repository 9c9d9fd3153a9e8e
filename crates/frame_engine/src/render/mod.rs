//! # Rendering Core
//!
//! Resource lifecycle and frame synchronization over a [`GpuDevice`].
//!
//! ## Architecture
//!
//! - **Device seam**: [`GpuDevice`] with a Vulkan and a headless backend
//! - **Swap images**: [`SwapImageSet`] owns the swapchain, its views,
//!   framebuffers and the forward render pass
//! - **Synchronization**: [`FrameSyncSet`] holds per-slot fences and
//!   semaphores
//! - **Commands**: per-slot buffers plus a synchronous [`TransientExecutor`]
//! - **Bindings**: [`BindingManager`] maps logical bindings to per-slot
//!   resources
//! - **Driver**: [`FrameDriver`] runs the per-frame protocol
//!
//! Every RAII wrapper holds a [`DeviceRef`], so the device is released
//! after everything created from it.

pub mod allocator;
pub mod backends;
pub mod binding;
pub mod commands;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod pipeline;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod window;

pub use allocator::{Buffer, Image};
pub use binding::{BindingDecl, BindingKind, BindingManager};
pub use commands::{ActiveRenderPass, CommandPool, CommandRecorder, FrameCommandBuffers, TransientExecutor};
pub use context::DeviceContext;
pub use descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetWriter};
pub use device::{DeviceRef, GpuDevice, QueueKind};
pub use error::{RenderError, RenderResult};
pub use frame::{DrawObject, FrameDriver, FrameOutcome};
pub use geometry::{IndexBuffer, IndexElement, VertexAttribute, VertexBuffer, VertexLayout};
pub use pipeline::PipelineBinding;
pub use swapchain::{AcquireStatus, RecreateOutcome, SwapImageSet};
pub use sync::{Fence, FrameSync, FrameSyncSet, Semaphore};
pub use texture::{ImageView, Sampler, SamplerConfig, Texture};
pub use window::{GlfwWindow, ScriptedSurface, SurfaceProvider, WindowError};
