//! `ash` implementation of the device seam
//!
//! [`VulkanDevice`] owns the instance, the window surface, the selected
//! physical device and the logical device with its queues. It is the root
//! of the ownership hierarchy: every RAII wrapper in the crate keeps an
//! `Rc` to it, so it is dropped only after all of them.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use ash::Device;
use std::collections::HashSet;

use super::instance::VulkanInstance;
use super::physical_device::PhysicalDeviceInfo;
use crate::core::config::RendererConfig;
use crate::render::device::{
    AcquireOutcome, Command, DescriptorResource, DescriptorWrite, GpuDevice, ImageDesc,
    PresentOutcome, QueueKind, SamplerDesc, SubmitDesc, SwapchainDesc,
};
use crate::render::error::{resource, RenderError, RenderResult};
use crate::render::window::GlfwWindow;

/// Logical device, queues and presentation surface
pub struct VulkanDevice {
    device: Device,
    swapchain_loader: SwapchainLoader,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical: PhysicalDeviceInfo,
    instance: VulkanInstance,
}

impl VulkanDevice {
    /// Create the instance, surface and logical device for a window
    pub fn new(window: &mut GlfwWindow, config: &RendererConfig) -> RenderResult<Self> {
        let instance = VulkanInstance::new(window, config)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window.create_vulkan_surface(instance.instance.handle())?;

        let physical = match PhysicalDeviceInfo::select_suitable_device(
            &instance.instance,
            surface,
            &surface_loader,
        ) {
            Ok(physical) => physical,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };

        let device = match Self::create_logical_device(&instance, &physical) {
            Ok(device) => device,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };

        let graphics_queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical.present_family, 0) };
        let swapchain_loader = SwapchainLoader::new(&instance.instance, &device);

        log::debug!(
            "Created logical device (graphics family {}, present family {})",
            physical.graphics_family,
            physical.present_family
        );

        Ok(Self {
            device,
            swapchain_loader,
            graphics_queue,
            present_queue,
            surface,
            surface_loader,
            physical,
            instance,
        })
    }

    fn create_logical_device(
        instance: &VulkanInstance,
        physical: &PhysicalDeviceInfo,
    ) -> RenderResult<Device> {
        let unique_families: HashSet<u32> = [physical.graphics_family, physical.present_family]
            .into_iter()
            .collect();

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const std::ffi::c_char> = physical
            .required_extensions()
            .into_iter()
            .map(std::ffi::CStr::as_ptr)
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical.sampler_anisotropy)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe {
            instance
                .instance
                .create_device(physical.device, &create_info, None)
                .map_err(resource("create logical device"))
        }
    }

    /// Raw `ash` device for pipeline construction
    pub fn raw(&self) -> &Device {
        &self.device
    }

    /// Selected physical device
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Present => self.present_queue,
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        log::debug!("Destroyed logical device and surface");
        // `instance` drops after this body, destroying the messenger and instance
    }
}

impl GpuDevice for VulkanDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.physical.memory_properties
    }

    fn surface_capabilities(&self) -> RenderResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical.device, self.surface)
                .map_err(resource("query surface capabilities"))
        }
    }

    fn surface_formats(&self) -> RenderResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical.device, self.surface)
                .map_err(resource("query surface formats"))
        }
    }

    fn surface_present_modes(&self) -> RenderResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical.device, self.surface)
                .map_err(resource("query present modes"))
        }
    }

    fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle().map_err(resource("wait for device idle")) }
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> RenderResult<()> {
        unsafe {
            self.device
                .queue_wait_idle(self.queue(queue))
                .map_err(resource("wait for queue idle"))
        }
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe {
            self.device
                .create_semaphore(&info, None)
                .map_err(resource("create semaphore"))
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None).map_err(resource("create fence")) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, timeout_ns)
                .map_err(resource("wait for fence"))
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        unsafe { self.device.reset_fences(&[fence]).map_err(resource("reset fence")) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RenderResult<bool> {
        unsafe {
            self.device
                .get_fence_status(fence)
                .map_err(resource("query fence status"))
        }
    }

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> RenderResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(self.physical.graphics_family);
        unsafe {
            self.device
                .create_command_pool(&info, None)
                .map_err(resource("create command pool"))
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe {
            self.device
                .allocate_command_buffers(&info)
                .map_err(resource("allocate command buffers"))
        }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> RenderResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
                .map_err(resource("reset command buffer"))
        }
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RenderResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe {
            self.device
                .begin_command_buffer(buffer, &info)
                .map_err(resource("begin command buffer"))
        }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RenderResult<()> {
        unsafe {
            self.device
                .end_command_buffer(buffer)
                .map_err(resource("end command buffer"))
        }
    }

    fn record(&self, cb: vk::CommandBuffer, command: &Command<'_>) {
        let device = &self.device;
        unsafe {
            match *command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    extent,
                    clear_color,
                } => {
                    let clear_values = [vk::ClearValue {
                        color: vk::ClearColorValue { float32: clear_color },
                    }];
                    let info = vk::RenderPassBeginInfo::builder()
                        .render_pass(render_pass)
                        .framebuffer(framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent,
                        })
                        .clear_values(&clear_values);
                    device.cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cb),
                Command::BindPipeline(pipeline) => {
                    device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline);
                }
                Command::SetViewport(viewport) => device.cmd_set_viewport(cb, 0, &[viewport]),
                Command::SetScissor(scissor) => device.cmd_set_scissor(cb, 0, &[scissor]),
                Command::BindVertexBuffers { buffers, offsets } => {
                    device.cmd_bind_vertex_buffers(cb, 0, buffers, offsets);
                }
                Command::BindIndexBuffer { buffer, index_type } => {
                    device.cmd_bind_index_buffer(cb, buffer, 0, index_type);
                }
                Command::BindDescriptorSets {
                    layout,
                    first_set,
                    sets,
                } => device.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    first_set,
                    sets,
                    &[],
                ),
                Command::DrawIndexed { index_count } => {
                    device.cmd_draw_indexed(cb, index_count, 1, 0, 0, 0);
                }
                Command::CopyBuffer { src, dst, regions } => {
                    device.cmd_copy_buffer(cb, src, dst, regions);
                }
                Command::CopyBufferToImage { src, dst, extent } => {
                    let region = vk::BufferImageCopy::builder()
                        .buffer_offset(0)
                        .buffer_row_length(0)
                        .buffer_image_height(0)
                        .image_subresource(vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                        .image_extent(vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        })
                        .build();
                    device.cmd_copy_buffer_to_image(
                        cb,
                        src,
                        dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                Command::ImageBarrier {
                    image,
                    old_layout,
                    new_layout,
                    src_access,
                    dst_access,
                    src_stage,
                    dst_stage,
                } => {
                    let barrier = vk::ImageMemoryBarrier::builder()
                        .old_layout(old_layout)
                        .new_layout(new_layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(image)
                        .subresource_range(color_subresource_range())
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .build();
                    device.cmd_pipeline_barrier(
                        cb,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
            }
        }
    }

    fn queue_submit(&self, queue: QueueKind, submit: &SubmitDesc<'_>) -> RenderResult<()> {
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signal_semaphores)
            .build();
        unsafe {
            self.device
                .queue_submit(self.queue(queue), &[info], submit.fence)
                .map_err(resource("submit to queue"))
        }
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> RenderResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&info, None).map_err(resource("create buffer")) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> RenderResult<()> {
        unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(resource("bind buffer memory"))
        }
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> RenderResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe {
            self.device
                .allocate_memory(&info, None)
                .map_err(resource("allocate device memory"))
        }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> RenderResult<*mut u8> {
        unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                .map(|ptr| ptr.cast::<u8>())
                .map_err(resource("map memory"))
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<vk::Image> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_image(&info, None).map_err(resource("create image")) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> RenderResult<()> {
        unsafe {
            self.device
                .bind_image_memory(image, memory, 0)
                .map_err(resource("bind image memory"))
        }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> RenderResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(color_subresource_range());
        unsafe {
            self.device
                .create_image_view(&info, None)
                .map_err(resource("create image view"))
        }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RenderResult<vk::Sampler> {
        let anisotropy = desc
            .max_anisotropy
            .filter(|_| self.physical.sampler_anisotropy)
            .map(|requested| requested.min(self.physical.properties.limits.max_sampler_anisotropy));

        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .border_color(desc.border_color)
            .unnormalized_coordinates(desc.unnormalized_coordinates)
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .mipmap_mode(desc.mipmap_mode)
            .mip_lod_bias(desc.mip_lod_bias)
            .min_lod(desc.lod_range.0)
            .max_lod(desc.lod_range.1);
        unsafe { self.device.create_sampler(&info, None).map_err(resource("create sampler")) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_render_pass(&self, color_format: vk::Format) -> RenderResult<vk::RenderPass> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();
        let attachments = [color_attachment];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .build()];

        // Image-available waits at color output, so the layout transition must too
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        unsafe {
            self.device
                .create_render_pass(&info, None)
                .map_err(resource("create render pass"))
        }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> RenderResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe {
            self.device
                .create_framebuffer(&info, None)
                .map_err(resource("create framebuffer"))
        }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR> {
        let families = [self.physical.graphics_family, self.physical.present_family];
        let (sharing_mode, family_indices): (vk::SharingMode, &[u32]) =
            if self.physical.graphics_family == self.physical.present_family {
                (vk::SharingMode::EXCLUSIVE, &[])
            } else {
                (vk::SharingMode::CONCURRENT, &families)
            };

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_indices)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);
        unsafe {
            self.swapchain_loader
                .create_swapchain(&info, None)
                .map_err(resource("create swapchain"))
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>> {
        unsafe {
            self.swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(resource("get swapchain images"))
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null())
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            // Only reachable with a finite acquire timeout
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(AcquireOutcome::NotReady),
            Err(result) => Err(RenderError::GraphicsResource {
                operation: "acquire swap image",
                result,
            }),
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(self.present_queue, &info) };
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(result) => Err(RenderError::GraphicsResource {
                operation: "present swap image",
                result,
            }),
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        unsafe {
            self.device
                .create_descriptor_set_layout(&info, None)
                .map_err(resource("create descriptor set layout"))
        }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe {
            self.device
                .create_descriptor_pool(&info, None)
                .map_err(resource("create descriptor pool"))
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RenderResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        unsafe {
            self.device
                .allocate_descriptor_sets(&info)
                .map_err(resource("allocate descriptor sets"))
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        // Info arrays are filled first so the pointers taken below stay valid
        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Buffer { buffer, range } => [vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range,
                }],
                DescriptorResource::Image { .. } => [vk::DescriptorBufferInfo::default()],
            })
            .collect();
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Image {
                    view,
                    sampler,
                    layout,
                } => [vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }],
                DescriptorResource::Buffer { .. } => [vk::DescriptorImageInfo::default()],
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.descriptor_type);
                match write.resource {
                    DescriptorResource::Buffer { .. } => builder.buffer_info(&buffer_infos[i]).build(),
                    DescriptorResource::Image { .. } => builder.image_info(&image_infos[i]).build(),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) }
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}
