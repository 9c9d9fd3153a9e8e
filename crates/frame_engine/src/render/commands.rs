//! Command buffer management
//!
//! Two kinds of command buffers exist:
//!
//! - [`FrameCommandBuffers`]: one long-lived buffer per frame slot, reset
//!   and re-recorded every frame from a pool created with
//!   `RESET_COMMAND_BUFFER`
//! - [`TransientExecutor`]: single-use buffers for uploads and layout
//!   transitions, submitted and waited on synchronously
//!
//! Recording goes through [`CommandRecorder`], which tracks the recording
//! state, and [`ActiveRenderPass`], which ends its render pass on drop.

use ash::vk;
use std::rc::Rc;

use crate::render::device::{Command, DeviceRef, GpuDevice, QueueKind, SubmitDesc};
use crate::render::error::{RenderError, RenderResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: DeviceRef,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a command pool on the graphics queue family
    pub fn new(device: &DeviceRef, flags: vk::CommandPoolCreateFlags) -> RenderResult<Self> {
        let command_pool = device.create_command_pool(flags)?;
        Ok(Self {
            device: Rc::clone(device),
            command_pool,
        })
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        self.device.allocate_command_buffers(self.command_pool, count)
    }

    /// Return command buffers to the pool
    pub fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        self.device.free_command_buffers(self.command_pool, buffers);
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Frees every command buffer allocated from the pool
        self.device.destroy_command_pool(self.command_pool);
    }
}

/// One persistent command buffer per frame slot
pub struct FrameCommandBuffers {
    buffers: Vec<vk::CommandBuffer>,
    pool: CommandPool,
}

impl FrameCommandBuffers {
    /// Allocate `frames_in_flight` command buffers
    pub fn new(device: &DeviceRef, frames_in_flight: usize) -> RenderResult<Self> {
        let count = u32::try_from(frames_in_flight)
            .map_err(|_| RenderError::illegal("frames in flight does not fit in u32"))?;
        let pool = CommandPool::new(device, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let buffers = pool.allocate_command_buffers(count)?;

        log::debug!("Allocated {} frame command buffers", buffers.len());
        Ok(Self { buffers, pool })
    }

    /// Command buffer owned by `slot`
    ///
    /// # Panics
    /// Panics when `slot` is not below the frame count.
    pub fn buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.buffers[slot]
    }

    /// Number of buffers, equal to the number of frame slots
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers were allocated
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Pool the buffers come from
    pub fn pool(&self) -> &CommandPool {
        &self.pool
    }
}

/// Type-safe command buffer recorder
pub struct CommandRecorder<'d> {
    device: &'d dyn GpuDevice,
    command_buffer: vk::CommandBuffer,
    recording: bool,
}

impl<'d> CommandRecorder<'d> {
    /// Wrap a command buffer in the initial state
    pub fn new(device: &'d dyn GpuDevice, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
            recording: false,
        }
    }

    /// Begin command recording
    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> RenderResult<()> {
        if self.recording {
            return Err(RenderError::illegal("Command buffer already recording"));
        }
        self.device.begin_command_buffer(self.command_buffer, flags)?;
        self.recording = true;
        Ok(())
    }

    /// End command recording
    pub fn end(&mut self) -> RenderResult<vk::CommandBuffer> {
        self.require_recording()?;
        self.device.end_command_buffer(self.command_buffer)?;
        self.recording = false;
        Ok(self.command_buffer)
    }

    /// Whether `begin` was called without a matching `end`
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Underlying command buffer
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn require_recording(&self) -> RenderResult<()> {
        if self.recording {
            Ok(())
        } else {
            Err(RenderError::illegal("Command buffer not recording"))
        }
    }

    fn push(&self, command: &Command<'_>) {
        self.device.record(self.command_buffer, command);
    }

    /// Begin a render pass; it ends when the returned guard drops
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) -> RenderResult<ActiveRenderPass<'_, 'd>> {
        self.require_recording()?;
        self.push(&Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_color,
        });
        Ok(ActiveRenderPass { recorder: self })
    }

    /// Copy between buffers
    pub fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> RenderResult<()> {
        self.require_recording()?;
        self.push(&Command::CopyBuffer { src, dst, regions });
        Ok(())
    }

    /// Copy tightly packed texels into a color image in TRANSFER_DST layout
    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent2D,
    ) -> RenderResult<()> {
        self.require_recording()?;
        self.push(&Command::CopyBufferToImage { src, dst, extent });
        Ok(())
    }

    /// Record a color image layout barrier
    pub fn image_barrier(
        &mut self,
        image: vk::Image,
        layouts: (vk::ImageLayout, vk::ImageLayout),
        access: (vk::AccessFlags, vk::AccessFlags),
        stages: (vk::PipelineStageFlags, vk::PipelineStageFlags),
    ) -> RenderResult<()> {
        self.require_recording()?;
        self.push(&Command::ImageBarrier {
            image,
            old_layout: layouts.0,
            new_layout: layouts.1,
            src_access: access.0,
            dst_access: access.1,
            src_stage: stages.0,
            dst_stage: stages.1,
        });
        Ok(())
    }
}

/// Render pass scope; records the end of the pass on drop
pub struct ActiveRenderPass<'r, 'd> {
    recorder: &'r mut CommandRecorder<'d>,
}

impl ActiveRenderPass<'_, '_> {
    /// Bind graphics pipeline
    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.recorder.push(&Command::BindPipeline(pipeline));
    }

    /// Cover the whole render area with viewport and scissor
    pub fn set_full_viewport(&mut self, extent: vk::Extent2D) {
        self.recorder.push(&Command::SetViewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }));
        self.recorder.push(&Command::SetScissor(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }));
    }

    /// Bind one vertex buffer at binding 0
    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer) {
        self.recorder.push(&Command::BindVertexBuffers {
            buffers: &[buffer],
            offsets: &[0],
        });
    }

    /// Bind index buffer
    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, index_type: vk::IndexType) {
        self.recorder
            .push(&Command::BindIndexBuffer { buffer, index_type });
    }

    /// Bind descriptor sets starting at set 0
    pub fn bind_descriptor_sets(&mut self, layout: vk::PipelineLayout, sets: &[vk::DescriptorSet]) {
        self.recorder.push(&Command::BindDescriptorSets {
            layout,
            first_set: 0,
            sets,
        });
    }

    /// Draw indexed, single instance
    pub fn draw_indexed(&mut self, index_count: u32) {
        self.recorder.push(&Command::DrawIndexed { index_count });
    }
}

impl Drop for ActiveRenderPass<'_, '_> {
    fn drop(&mut self) {
        self.recorder.push(&Command::EndRenderPass);
    }
}

/// Synchronous one-shot command execution
///
/// Each call allocates a buffer, records it, submits it to the graphics
/// queue and blocks until the queue is idle before freeing it. This is for
/// uploads and layout transitions, never the per-frame path.
pub struct TransientExecutor {
    pool: CommandPool,
    device: DeviceRef,
}

impl TransientExecutor {
    /// Create the executor and its transient pool
    pub fn new(device: &DeviceRef) -> RenderResult<Self> {
        Ok(Self {
            pool: CommandPool::new(device, vk::CommandPoolCreateFlags::TRANSIENT)?,
            device: Rc::clone(device),
        })
    }

    /// Record with `record`, submit and wait for completion
    ///
    /// Device failures are reported as [`RenderError::TransientOp`] tagged
    /// with `operation`. Nothing about the operation may be assumed done
    /// when an error is returned.
    pub fn execute<F>(&self, operation: &'static str, record: F) -> RenderResult<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> RenderResult<()>,
    {
        let command_buffer = self
            .pool
            .allocate_command_buffers(1)
            .map_err(|e| transient(operation, e))?[0];

        let mut submitted = false;
        let result = self.run(command_buffer, record, &mut submitted);

        // A buffer that may still be executing stays with the pool
        if result.is_ok() || !submitted {
            self.pool.free_command_buffers(&[command_buffer]);
        }
        result.map_err(|e| transient(operation, e))
    }

    fn run<F>(&self, command_buffer: vk::CommandBuffer, record: F, submitted: &mut bool) -> RenderResult<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> RenderResult<()>,
    {
        let mut recorder = CommandRecorder::new(self.device.as_ref(), command_buffer);
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record(&mut recorder)?;
        recorder.end()?;

        let command_buffers = [command_buffer];
        self.device.queue_submit(
            QueueKind::Graphics,
            &SubmitDesc {
                command_buffers: &command_buffers,
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
                fence: vk::Fence::null(),
            },
        )?;
        *submitted = true;
        self.device.queue_wait_idle(QueueKind::Graphics)
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst`
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> RenderResult<()> {
        self.execute("copy buffer", |recorder| {
            recorder.copy_buffer(
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            )
        })
    }

    /// Copy tightly packed texels from `src` into `dst`
    pub fn copy_buffer_to_image(&self, src: vk::Buffer, dst: vk::Image, extent: vk::Extent2D) -> RenderResult<()> {
        self.execute("copy buffer to image", |recorder| {
            recorder.copy_buffer_to_image(src, dst, extent)
        })
    }
}

fn transient(operation: &'static str, err: RenderError) -> RenderError {
    match err {
        RenderError::GraphicsResource { result, .. } => RenderError::TransientOp { operation, result },
        other => other,
    }
}
