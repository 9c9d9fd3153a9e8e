//! Device seam
//!
//! [`GpuDevice`] is the full set of device operations the frame core
//! consumes. Handles are plain `ash::vk` handles; ownership lives in the
//! RAII wrappers built on top of this trait, each of which keeps a
//! [`DeviceRef`] so the device is released only after every dependent
//! object.
//!
//! Two backends implement it: the `ash` backend in
//! [`crate::render::backends::vulkan`] and the recording
//! [`crate::render::backends::headless`] device used by tests.

use ash::vk;
use std::rc::Rc;

use crate::render::error::RenderResult;

/// Shared handle to the device
pub type DeviceRef = Rc<dyn GpuDevice>;

/// Queue selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics and transfer work
    Graphics,
    /// Presentation
    Present,
}

/// Outcome of a swap image acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image index was returned
    Acquired {
        /// Index into the swap image set
        image_index: u32,
        /// The surface still works but no longer matches exactly
        suboptimal: bool,
    },
    /// The swapchain is out of date
    OutOfDate,
    /// No image became available within the timeout
    NotReady,
}

/// Outcome of a queue present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the surface no longer matches exactly
    Suboptimal,
    /// The swapchain is out of date
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the swap image set should be rebuilt
    pub fn is_stale(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Parameters for swapchain creation
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    /// Requested image count
    pub min_image_count: u32,
    /// Selected surface format
    pub format: vk::SurfaceFormatKHR,
    /// Image extent
    pub extent: vk::Extent2D,
    /// Present mode
    pub present_mode: vk::PresentModeKHR,
    /// Transform reported by the surface
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Previous swapchain being replaced, or null
    pub old_swapchain: vk::SwapchainKHR,
}

/// Parameters for a 2D image
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Extent in pixels
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
}

/// Parameters for sampler creation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    /// Magnification filter
    pub mag_filter: vk::Filter,
    /// Minification filter
    pub min_filter: vk::Filter,
    /// Address mode for all three axes
    pub address_mode: vk::SamplerAddressMode,
    /// Maximum anisotropy, `None` to disable
    pub max_anisotropy: Option<f32>,
    /// Border color for clamp-to-border
    pub border_color: vk::BorderColor,
    /// Use unnormalized texel coordinates
    pub unnormalized_coordinates: bool,
    /// Depth compare operation, `None` to disable
    pub compare_op: Option<vk::CompareOp>,
    /// Mipmap mode
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// Mip LOD bias
    pub mip_lod_bias: f32,
    /// LOD clamp range
    pub lod_range: (f32, f32),
}

/// One queue submission
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc<'a> {
    /// Command buffers executed in order
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores waited on before execution
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Stage of each wait
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signaled after execution
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Fence signaled after execution, or null
    pub fence: vk::Fence,
}

/// Resource referenced by a descriptor write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorResource {
    /// Uniform or storage buffer range
    Buffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Byte range from offset zero
        range: vk::DeviceSize,
    },
    /// Image view with optional sampler
    Image {
        /// View handle
        view: vk::ImageView,
        /// Sampler, null for storage images
        sampler: vk::Sampler,
        /// Layout the image is in when read
        layout: vk::ImageLayout,
    },
}

/// Single-entry descriptor write
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorWrite {
    /// Destination set
    pub set: vk::DescriptorSet,
    /// Destination binding
    pub binding: u32,
    /// Descriptor type of the binding
    pub descriptor_type: vk::DescriptorType,
    /// What the descriptor points at
    pub resource: DescriptorResource,
}

/// A command recorded into a command buffer
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    /// Begin a render pass with a single clear color
    BeginRenderPass {
        /// Render pass
        render_pass: vk::RenderPass,
        /// Target framebuffer
        framebuffer: vk::Framebuffer,
        /// Render area extent
        extent: vk::Extent2D,
        /// Clear color of attachment 0
        clear_color: [f32; 4],
    },
    /// End the current render pass
    EndRenderPass,
    /// Bind a graphics pipeline
    BindPipeline(vk::Pipeline),
    /// Set viewport 0
    SetViewport(vk::Viewport),
    /// Set scissor 0
    SetScissor(vk::Rect2D),
    /// Bind vertex buffers starting at binding 0
    BindVertexBuffers {
        /// Buffers
        buffers: &'a [vk::Buffer],
        /// Offsets per buffer
        offsets: &'a [vk::DeviceSize],
    },
    /// Bind an index buffer
    BindIndexBuffer {
        /// Buffer
        buffer: vk::Buffer,
        /// Index width
        index_type: vk::IndexType,
    },
    /// Bind descriptor sets for graphics
    BindDescriptorSets {
        /// Pipeline layout
        layout: vk::PipelineLayout,
        /// First set number
        first_set: u32,
        /// Sets
        sets: &'a [vk::DescriptorSet],
    },
    /// Indexed draw of a single instance
    DrawIndexed {
        /// Number of indices
        index_count: u32,
    },
    /// Buffer to buffer copy
    CopyBuffer {
        /// Source
        src: vk::Buffer,
        /// Destination
        dst: vk::Buffer,
        /// Regions
        regions: &'a [vk::BufferCopy],
    },
    /// Tightly packed buffer to color image copy
    CopyBufferToImage {
        /// Source
        src: vk::Buffer,
        /// Destination image in TRANSFER_DST_OPTIMAL
        dst: vk::Image,
        /// Copied extent
        extent: vk::Extent2D,
    },
    /// Single color image layout barrier
    ImageBarrier {
        /// Image
        image: vk::Image,
        /// Old layout
        old_layout: vk::ImageLayout,
        /// New layout
        new_layout: vk::ImageLayout,
        /// Source access
        src_access: vk::AccessFlags,
        /// Destination access
        dst_access: vk::AccessFlags,
        /// Source stage
        src_stage: vk::PipelineStageFlags,
        /// Destination stage
        dst_stage: vk::PipelineStageFlags,
    },
}

/// Device operations consumed by the frame core
///
/// Destroy calls take handles created by the same device and are
/// infallible, mirroring `vkDestroy*`.
pub trait GpuDevice {
    // Queries

    /// Memory heaps and types of the physical device
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    /// Current surface capabilities
    fn surface_capabilities(&self) -> RenderResult<vk::SurfaceCapabilitiesKHR>;
    /// Supported surface formats
    fn surface_formats(&self) -> RenderResult<Vec<vk::SurfaceFormatKHR>>;
    /// Supported present modes
    fn surface_present_modes(&self) -> RenderResult<Vec<vk::PresentModeKHR>>;
    /// Block until all queues are idle
    fn wait_idle(&self) -> RenderResult<()>;
    /// Block until one queue is idle
    fn queue_wait_idle(&self, queue: QueueKind) -> RenderResult<()>;

    // Synchronization

    /// Create a binary semaphore
    fn create_semaphore(&self) -> RenderResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Create a fence, optionally signaled
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait until the fence is signaled
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<()>;
    /// Return the fence to unsignaled
    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()>;
    /// Non-blocking fence query
    fn fence_signaled(&self, fence: vk::Fence) -> RenderResult<bool>;

    // Commands

    /// Create a command pool on the graphics family
    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> RenderResult<vk::CommandPool>;
    /// Destroy a command pool and every buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate primary command buffers
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>>;
    /// Return command buffers to their pool
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    /// Reset a command buffer to the initial state
    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> RenderResult<()>;
    /// Begin recording
    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RenderResult<()>;
    /// End recording
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RenderResult<()>;
    /// Record one command
    fn record(&self, buffer: vk::CommandBuffer, command: &Command<'_>);
    /// Submit work to a queue
    fn queue_submit(&self, queue: QueueKind, submit: &SubmitDesc<'_>) -> RenderResult<()>;

    // Memory

    /// Create an exclusive buffer
    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> RenderResult<vk::Buffer>;
    /// Destroy a buffer
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Memory requirements of a buffer
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    /// Bind memory to a buffer at offset zero
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> RenderResult<()>;
    /// Allocate device memory
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> RenderResult<vk::DeviceMemory>;
    /// Free device memory
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map the start of an allocation
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> RenderResult<*mut u8>;
    /// Unmap an allocation
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    // Images

    /// Create an optimal-tiling 2D image
    fn create_image(&self, desc: &ImageDesc) -> RenderResult<vk::Image>;
    /// Destroy an image
    fn destroy_image(&self, image: vk::Image);
    /// Memory requirements of an image
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    /// Bind memory to an image at offset zero
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> RenderResult<()>;
    /// Create a 2D color view
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> RenderResult<vk::ImageView>;
    /// Destroy a view
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Create a sampler
    fn create_sampler(&self, desc: &SamplerDesc) -> RenderResult<vk::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Render targets

    /// Create the single-subpass color render pass
    fn create_render_pass(&self, color_format: vk::Format) -> RenderResult<vk::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    /// Create a framebuffer
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RenderResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Swapchain

    /// Create a swapchain on the context's surface
    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR>;
    /// Images owned by a swapchain
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>>;
    /// Destroy a swapchain
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Acquire the next presentable image
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome>;
    /// Present an image on the present queue
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome>;

    // Descriptors

    /// Create a descriptor set layout
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<vk::DescriptorSetLayout>;
    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// Create a pool whose sets may be freed individually
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool>;
    /// Destroy a pool and its sets
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocate one set per layout
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RenderResult<Vec<vk::DescriptorSet>>;
    /// Apply descriptor writes
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_staleness() {
        assert!(!PresentOutcome::Presented.is_stale());
        assert!(PresentOutcome::Suboptimal.is_stale());
        assert!(PresentOutcome::OutOfDate.is_stale());
    }
}
