//! Frame driver
//!
//! Composes the swap image set, per-slot synchronization, per-slot command
//! buffers and the registered draw objects into one `draw_frame` call.
//!
//! # Per-frame protocol
//!
//! With `s = frame_counter % F`:
//!
//! 1. Wait on slot `s`'s fence. Per-slot resources of `s` are free from
//!    here, and the caller's update runs against them.
//! 2. Acquire a swap image, signaling `s`'s image-available semaphore. A
//!    stale set is recreated and the frame ends without advancing, as does
//!    an acquire that times out.
//! 3. Reset the fence, then reset and record `s`'s command buffer.
//! 4. Submit, waiting on image-available at color-attachment output and
//!    signaling render-finished plus the fence.
//! 5. Present, waiting on render-finished, then wait for the present queue.
//! 6. Advance the counter and recreate the set if present reported it
//!    stale or a resize is pending.
//!
//! The fence is only reset once an image has been acquired, so an early
//! return never leaves a slot waiting on a fence nothing will signal.

use ash::vk;
use std::rc::Rc;

use crate::core::config::RendererConfig;
use crate::render::binding::BindingManager;
use crate::render::commands::{CommandRecorder, FrameCommandBuffers};
use crate::render::context::DeviceContext;
use crate::render::device::{DeviceRef, QueueKind, SubmitDesc};
use crate::render::error::{RenderError, RenderResult};
use crate::render::geometry::{IndexBuffer, VertexBuffer};
use crate::render::pipeline::PipelineBinding;
use crate::render::swapchain::{AcquireStatus, RecreateOutcome, SwapImageSet};
use crate::render::sync::FrameSyncSet;
use crate::render::window::SurfaceProvider;

/// One indexed draw issued every frame
#[derive(Clone)]
pub struct DrawObject {
    /// Vertex data
    pub vertices: Rc<VertexBuffer>,
    /// Index data; the draw covers every index
    pub indices: Rc<IndexBuffer>,
    /// Descriptor sets, one per frame slot
    pub bindings: Rc<BindingManager>,
    /// Pipeline and layout the sets are bound against
    pub pipeline: PipelineBinding,
}

/// What a `draw_frame` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and presented
    Presented {
        /// Frame slot used
        slot: usize,
        /// Swap image presented
        image_index: u32,
        /// The swap image set was rebuilt after presenting
        recreated: bool,
    },
    /// Acquire found the set stale; it was rebuilt and nothing was drawn
    SurfaceRecreated,
    /// Nothing was drawn: the window has zero area and recreation is
    /// deferred, or no swap image arrived within the acquire timeout
    Skipped,
}

/// Drives frames through a swap image set
///
/// Fields drop in declaration order after `Drop` waits for the device, so
/// draw objects go first and the device reference last.
pub struct FrameDriver<W: SurfaceProvider> {
    objects: Vec<DrawObject>,
    // Removed objects with the counter value they were removed at
    retired: Vec<(u64, DrawObject)>,
    command_buffers: FrameCommandBuffers,
    sync: FrameSyncSet,
    swap_images: SwapImageSet,
    surface: W,
    device: DeviceRef,
    frame_counter: u64,
    resize_pending: bool,
    pause_on_minimize: bool,
    clear_color: [f32; 4],
}

impl<W: SurfaceProvider> FrameDriver<W> {
    /// Build the swap image set and per-slot state for `context`
    pub fn new(context: &DeviceContext, mut surface: W, config: &RendererConfig) -> RenderResult<Self> {
        let device = Rc::clone(context.device());
        let frames = context.frames_in_flight();

        let swap_images = SwapImageSet::new(&device, &mut surface, config)?;
        let sync = FrameSyncSet::new(&device, frames)?;
        let command_buffers = FrameCommandBuffers::new(&device, frames)?;

        log::debug!("Frame driver ready with {} frames in flight", frames);
        Ok(Self {
            objects: Vec::new(),
            retired: Vec::new(),
            command_buffers,
            sync,
            swap_images,
            surface,
            device,
            frame_counter: 0,
            resize_pending: false,
            pause_on_minimize: config.pause_on_minimize,
            clear_color: config.clear_color,
        })
    }

    /// Register a draw object; returns its index
    ///
    /// Objects are drawn in index order.
    pub fn add_object(&mut self, object: DrawObject) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    /// Register several objects in order; returns the index of the first
    pub fn add_objects(&mut self, objects: impl IntoIterator<Item = DrawObject>) -> usize {
        let first = self.objects.len();
        self.objects.extend(objects);
        first
    }

    /// Object registered at `index`
    pub fn object(&self, index: usize) -> RenderResult<&DrawObject> {
        self.objects.get(index).ok_or_else(|| {
            RenderError::illegal(format!(
                "no draw object at index {index} ({} registered)",
                self.objects.len()
            ))
        })
    }

    /// Remove the object at `index`
    ///
    /// Later objects shift down by one. The object's resources are kept
    /// until every frame that may have drawn it has retired.
    pub fn remove_object(&mut self, index: usize) -> RenderResult<()> {
        if index >= self.objects.len() {
            return Err(RenderError::illegal(format!(
                "no draw object at index {index} ({} registered)",
                self.objects.len()
            )));
        }
        let object = self.objects.remove(index);
        self.retired.push((self.frame_counter, object));
        Ok(())
    }

    /// Number of registered objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Request swap image recreation after the next present
    pub fn notify_resize(&mut self) {
        self.resize_pending = true;
    }

    /// Whether a recreation is waiting to happen
    pub fn is_resize_pending(&self) -> bool {
        self.resize_pending
    }

    /// Frames presented so far
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Slot the next frame will use
    pub fn current_slot(&self) -> usize {
        self.sync.slot_index(self.frame_counter)
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.sync.len()
    }

    /// Swap image set currently in use
    pub fn swap_images(&self) -> &SwapImageSet {
        &self.swap_images
    }

    /// Render pass pipelines must be compatible with
    pub fn render_pass(&self) -> vk::RenderPass {
        self.swap_images.render_pass()
    }

    /// Command buffers indexed by slot
    pub fn command_buffers(&self) -> &FrameCommandBuffers {
        &self.command_buffers
    }

    /// Synchronization objects indexed by slot
    pub fn sync(&self) -> &FrameSyncSet {
        &self.sync
    }

    /// Surface the driver presents to
    pub fn window(&self) -> &W {
        &self.surface
    }

    /// Mutable access for event polling
    pub fn window_mut(&mut self) -> &mut W {
        &mut self.surface
    }

    /// Draw and present one frame
    pub fn draw_frame(&mut self) -> RenderResult<FrameOutcome> {
        self.draw_frame_with(|_| Ok(()))
    }

    /// Draw and present one frame, calling `update(slot)` first
    ///
    /// `update` runs once the slot's fence has signaled and before anything
    /// is submitted, so it may write the slot's per-frame resources.
    pub fn draw_frame_with<F>(&mut self, update: F) -> RenderResult<FrameOutcome>
    where
        F: FnOnce(usize) -> RenderResult<()>,
    {
        if self.surface.take_resize_request() {
            self.resize_pending = true;
        }
        if self.resize_pending && !self.pause_on_minimize && !has_area(self.surface.framebuffer_extent()) {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.sync.slot_index(self.frame_counter);
        let frame = self.sync.frame(slot);
        frame.in_flight.wait(u64::MAX)?;
        self.release_retired();

        update(slot)?;

        let frame = self.sync.frame(slot);
        let image_index = match self.swap_images.acquire_next(frame.image_available.handle())? {
            AcquireStatus::Stale => {
                log::debug!("Swap image set stale on acquire");
                return Ok(match self.recreate_swap_images()? {
                    RecreateOutcome::Recreated => FrameOutcome::SurfaceRecreated,
                    RecreateOutcome::Deferred => FrameOutcome::Skipped,
                });
            }
            AcquireStatus::TimedOut => {
                log::debug!("No swap image within the acquire timeout, skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
            AcquireStatus::Ready { image_index, .. } => image_index,
        };

        frame.in_flight.reset()?;
        let command_buffer = self.command_buffers.buffer(slot);
        self.device.reset_command_buffer(command_buffer)?;
        self.record(command_buffer, slot, image_index)?;

        let command_buffers = [command_buffer];
        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished.handle()];
        self.device.queue_submit(
            QueueKind::Graphics,
            &SubmitDesc {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: &signal_semaphores,
                fence: frame.in_flight.handle(),
            },
        )?;

        let presented = self
            .swap_images
            .present(image_index, frame.render_finished.handle())?;
        self.device.queue_wait_idle(QueueKind::Present)?;
        self.frame_counter += 1;

        let mut recreated = false;
        if presented.is_stale() || self.resize_pending {
            log::debug!("Recreating swap images after present ({:?})", presented);
            recreated = self.recreate_swap_images()? == RecreateOutcome::Recreated;
        }

        Ok(FrameOutcome::Presented {
            slot,
            image_index,
            recreated,
        })
    }

    fn record(&self, command_buffer: vk::CommandBuffer, slot: usize, image_index: u32) -> RenderResult<()> {
        let extent = self.swap_images.extent();
        let framebuffer = self.swap_images.framebuffer(image_index)?;

        let mut recorder = CommandRecorder::new(self.device.as_ref(), command_buffer);
        recorder.begin(vk::CommandBufferUsageFlags::empty())?;
        {
            let mut pass = recorder.begin_render_pass(
                self.swap_images.render_pass(),
                framebuffer,
                extent,
                self.clear_color,
            )?;
            pass.set_full_viewport(extent);

            for object in &self.objects {
                let set = object.bindings.descriptor_set(slot)?;
                pass.bind_pipeline(object.pipeline.pipeline);
                pass.bind_vertex_buffer(object.vertices.handle());
                pass.bind_index_buffer(object.indices.handle(), object.indices.index_type());
                pass.bind_descriptor_sets(object.pipeline.layout, &[set]);
                pass.draw_indexed(object.indices.index_count());
            }
        }
        recorder.end()?;
        Ok(())
    }

    fn recreate_swap_images(&mut self) -> RenderResult<RecreateOutcome> {
        let outcome = self
            .swap_images
            .recreate(&mut self.surface, self.pause_on_minimize)?;
        self.resize_pending = outcome == RecreateOutcome::Deferred;
        if outcome == RecreateOutcome::Recreated {
            // Recreation waited for the device to go idle
            self.retired.clear();
        }
        Ok(outcome)
    }

    // Called right after a fence wait. Every frame counted at or below
    // `frame_counter - F` has retired, which covers all frames recorded
    // before a removal at counter `c` once `frame_counter >= c - 1 + F`.
    fn release_retired(&mut self) {
        let frames = self.sync.len() as u64;
        let counter = self.frame_counter;
        self.retired
            .retain(|(removed_at, _)| counter + 1 < removed_at + frames);
    }
}

impl<W: SurfaceProvider> Drop for FrameDriver<W> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle during frame driver teardown: {}", e);
        }
    }
}

fn has_area(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}
