//! Headless device
//!
//! An in-process [`GpuDevice`] that fabricates handles, backs device memory
//! with host allocations and executes buffer copies when a submission
//! retires. Every object is counted per [`ObjectKind`], every submit and
//! present is logged, and misuse of the synchronization protocol is
//! collected as a list of violations instead of crashing, so tests can
//! assert the protocol directly.
//!
//! By default submissions retire immediately. With
//! [`HeadlessDevice::set_auto_retire`] turned off they stay pending until a
//! fence wait or an idle wait observes them, which models a GPU that lags
//! behind the CPU.

use ash::vk;
use ash::vk::Handle;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::render::device::{
    AcquireOutcome, Command, DescriptorWrite, GpuDevice, ImageDesc, PresentOutcome, QueueKind,
    SamplerDesc, SubmitDesc, SwapchainDesc,
};
use crate::render::error::{RenderError, RenderResult};

/// Memory type index of device-local memory
pub const DEVICE_LOCAL_TYPE: u32 = 0;
/// Memory type index of host-visible, coherent memory
pub const HOST_VISIBLE_TYPE: u32 = 1;

/// Object categories tracked by the headless device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Semaphore
    Semaphore,
    /// Fence
    Fence,
    /// Command pool
    CommandPool,
    /// Command buffer
    CommandBuffer,
    /// Buffer
    Buffer,
    /// Device memory
    Memory,
    /// Image not owned by a swapchain
    Image,
    /// Image view
    ImageView,
    /// Sampler
    Sampler,
    /// Render pass
    RenderPass,
    /// Framebuffer
    Framebuffer,
    /// Swapchain
    Swapchain,
    /// Descriptor set layout
    DescriptorSetLayout,
    /// Descriptor pool
    DescriptorPool,
    /// Descriptor set
    DescriptorSet,
}

/// Owned copy of a recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    /// Render pass begin
    BeginRenderPass {
        /// Target framebuffer
        framebuffer: vk::Framebuffer,
        /// Render area
        extent: vk::Extent2D,
    },
    /// Render pass end
    EndRenderPass,
    /// Pipeline bind
    BindPipeline(vk::Pipeline),
    /// Viewport size
    SetViewport {
        /// Width in pixels
        width: f32,
        /// Height in pixels
        height: f32,
    },
    /// Scissor extent
    SetScissor(vk::Extent2D),
    /// Vertex buffer bind
    BindVertexBuffers(Vec<vk::Buffer>),
    /// Index buffer bind
    BindIndexBuffer(vk::Buffer, vk::IndexType),
    /// Descriptor set bind
    BindDescriptorSets(Vec<vk::DescriptorSet>),
    /// Indexed draw
    DrawIndexed(u32),
    /// Buffer copy
    CopyBuffer {
        /// Source
        src: vk::Buffer,
        /// Destination
        dst: vk::Buffer,
        /// `(src_offset, dst_offset, size)` per region
        regions: Vec<(vk::DeviceSize, vk::DeviceSize, vk::DeviceSize)>,
    },
    /// Buffer to image copy
    CopyBufferToImage {
        /// Source
        src: vk::Buffer,
        /// Destination
        dst: vk::Image,
    },
    /// Layout transition
    ImageBarrier {
        /// Image
        image: vk::Image,
        /// Old layout
        old_layout: vk::ImageLayout,
        /// New layout
        new_layout: vk::ImageLayout,
    },
}

/// Device call log entry, in call order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCall {
    /// Fence wait
    WaitFence(vk::Fence),
    /// Fence reset
    ResetFence(vk::Fence),
    /// Swap image acquire
    Acquire(vk::Semaphore),
    /// Command buffer reset
    ResetCommandBuffer(vk::CommandBuffer),
    /// Queue submission with its generation
    Submit {
        /// Signaled fence
        fence: vk::Fence,
        /// Submission generation
        generation: u64,
    },
    /// Present of an image index
    Present(u32),
    /// Queue idle wait
    QueueWaitIdle(QueueKind),
    /// Device idle wait
    WaitIdle,
    /// Swapchain creation
    CreateSwapchain(vk::SwapchainKHR),
    /// Swapchain destruction
    DestroySwapchain(vk::SwapchainKHR),
}

/// A queue submission seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    /// Monotonic submission number starting at 1
    pub generation: u64,
    /// Queue
    pub queue: QueueKind,
    /// Command buffers
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Waited semaphores
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Wait stages
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    /// Signaled semaphores
    pub signal_semaphores: Vec<vk::Semaphore>,
    /// Signaled fence
    pub fence: vk::Fence,
}

/// A present seen by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentRecord {
    /// Swapchain presented to
    pub swapchain: vk::SwapchainKHR,
    /// Image index
    pub image_index: u32,
    /// Semaphore waited on
    pub wait_semaphore: vk::Semaphore,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    pool: u64,
    recording: bool,
    pending: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
struct SwapchainState {
    images: Vec<vk::Image>,
    desc: SwapchainDesc,
    acquired: BTreeSet<u32>,
    next_image: u32,
}

#[derive(Debug)]
struct PendingSubmit {
    command_buffers: Vec<u64>,
    fence: u64,
}

struct HeadlessState {
    next_raw: u64,
    live: BTreeMap<ObjectKind, BTreeSet<u64>>,
    fences: HashMap<u64, bool>,
    signaled_semaphores: HashSet<u64>,
    command_buffers: HashMap<u64, CommandBufferState>,
    buffers: HashMap<u64, (vk::DeviceSize, Option<u64>)>,
    images: HashMap<u64, ImageDesc>,
    memory: HashMap<u64, Box<[u8]>>,
    mapped: HashSet<u64>,
    pool_sets: HashMap<u64, (u32, Vec<u64>)>,
    swapchains: HashMap<u64, SwapchainState>,
    pending: VecDeque<PendingSubmit>,
    generation: u64,
    auto_retire: bool,
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    failures: HashMap<&'static str, usize>,
    calls: Vec<DeviceCall>,
    submits: Vec<SubmitRecord>,
    presents: Vec<PresentRecord>,
    descriptor_writes: Vec<DescriptorWrite>,
    violations: Vec<String>,
}

/// Recording device without a GPU
pub struct HeadlessDevice {
    state: RefCell<HeadlessState>,
}

impl HeadlessDevice {
    /// Create a device whose surface reports `extent` with 2..=8 images
    pub fn new(extent: vk::Extent2D) -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: extent,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        };

        Self {
            state: RefCell::new(HeadlessState {
                next_raw: 1,
                live: BTreeMap::new(),
                fences: HashMap::new(),
                signaled_semaphores: HashSet::new(),
                command_buffers: HashMap::new(),
                buffers: HashMap::new(),
                images: HashMap::new(),
                memory: HashMap::new(),
                mapped: HashSet::new(),
                pool_sets: HashMap::new(),
                swapchains: HashMap::new(),
                pending: VecDeque::new(),
                generation: 0,
                auto_retire: true,
                capabilities,
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::R8G8B8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
                submits: Vec::new(),
                presents: Vec::new(),
                descriptor_writes: Vec::new(),
                violations: Vec::new(),
            }),
        }
    }

    /// Retire submissions immediately (`true`) or on fence/idle waits
    pub fn set_auto_retire(&self, enabled: bool) {
        self.state.borrow_mut().auto_retire = enabled;
    }

    /// Replace the reported surface capabilities
    pub fn set_surface_capabilities(&self, capabilities: vk::SurfaceCapabilitiesKHR) {
        self.state.borrow_mut().capabilities = capabilities;
    }

    /// Current surface capabilities
    pub fn capabilities(&self) -> vk::SurfaceCapabilitiesKHR {
        self.state.borrow().capabilities
    }

    /// Change the current surface extent
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        self.state.borrow_mut().capabilities.current_extent = extent;
    }

    /// Replace the supported surface formats
    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.borrow_mut().formats = formats;
    }

    /// Replace the supported present modes
    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state.borrow_mut().present_modes = modes;
    }

    /// Queue an outcome for the next acquire
    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().acquire_script.push_back(outcome);
    }

    /// Queue an outcome for the next present
    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().present_script.push_back(outcome);
    }

    /// Fail `operation` after `successes` more successful calls
    ///
    /// Operation names match the [`GpuDevice`] method names.
    pub fn inject_failure(&self, operation: &'static str, successes: usize) {
        self.state.borrow_mut().failures.insert(operation, successes);
    }

    /// Number of live objects of a kind
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state.borrow().live.get(&kind).map_or(0, BTreeSet::len)
    }

    /// Total number of live objects
    pub fn total_live(&self) -> usize {
        self.state.borrow().live.values().map(BTreeSet::len).sum()
    }

    /// Whether a handle of the given kind is alive
    pub fn is_live(&self, kind: ObjectKind, raw: u64) -> bool {
        self.state
            .borrow()
            .live
            .get(&kind)
            .is_some_and(|set| set.contains(&raw))
    }

    /// Device call log
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.borrow().calls.clone()
    }

    /// Every submission so far
    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.borrow().submits.clone()
    }

    /// Every present so far
    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state.borrow().presents.clone()
    }

    /// Every descriptor write so far
    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.borrow().descriptor_writes.clone()
    }

    /// Commands currently recorded in a command buffer
    pub fn recorded_commands(&self, buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .borrow()
            .command_buffers
            .get(&buffer.as_raw())
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    /// Whether a submission signaling `fence` has not retired yet
    pub fn is_fence_pending(&self, fence: vk::Fence) -> bool {
        let raw = fence.as_raw();
        self.state.borrow().pending.iter().any(|p| p.fence == raw)
    }

    /// Number of submissions that have not retired
    pub fn pending_submissions(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Images of a live swapchain
    pub fn swapchain_image_handles(&self, swapchain: vk::SwapchainKHR) -> Vec<vk::Image> {
        self.state
            .borrow()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|sc| sc.images.clone())
            .unwrap_or_default()
    }

    /// Creation parameters of a live swapchain
    pub fn swapchain_desc(&self, swapchain: vk::SwapchainKHR) -> Option<SwapchainDesc> {
        self.state
            .borrow()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|sc| sc.desc)
    }

    /// Protocol violations observed so far
    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    /// Copy of the bytes backing a memory allocation
    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .memory
            .get(&memory.as_raw())
            .map(|bytes| bytes.to_vec())
    }

    /// Copy of the bytes backing a buffer
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let (size, memory) = state.buffers.get(&buffer.as_raw())?;
        let bytes = state.memory.get(&(*memory)?)?;
        let len = usize::try_from(*size).ok()?.min(bytes.len());
        Some(bytes[..len].to_vec())
    }
}

impl HeadlessState {
    fn create(&mut self, kind: ObjectKind) -> u64 {
        let raw = self.next_raw;
        self.next_raw += 1;
        self.live.entry(kind).or_default().insert(raw);
        raw
    }

    fn destroy(&mut self, kind: ObjectKind, raw: u64) {
        if raw == 0 {
            return;
        }
        let removed = self.live.get_mut(&kind).is_some_and(|set| set.remove(&raw));
        if !removed {
            self.violations
                .push(format!("destroyed unknown or already destroyed {kind:?} {raw}"));
        }
    }

    fn check_failure(&mut self, operation: &'static str) -> RenderResult<()> {
        match self.failures.get_mut(operation) {
            Some(0) => {
                self.failures.remove(operation);
                Err(RenderError::GraphicsResource {
                    operation,
                    result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                })
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn in_use_by_pending(&self, predicate: impl Fn(&RecordedCommand) -> bool) -> bool {
        self.pending.iter().any(|submit| {
            submit.command_buffers.iter().any(|cb| {
                self.command_buffers
                    .get(cb)
                    .is_some_and(|state| state.commands.iter().any(&predicate))
            })
        })
    }

    fn retire_front(&mut self) -> bool {
        let Some(submit) = self.pending.pop_front() else {
            return false;
        };

        for cb in &submit.command_buffers {
            let commands = match self.command_buffers.get_mut(cb) {
                Some(state) => {
                    state.pending = false;
                    state.commands.clone()
                }
                None => continue,
            };
            for command in &commands {
                self.execute(command);
            }
        }

        if submit.fence != 0 {
            self.fences.insert(submit.fence, true);
        }
        true
    }

    fn retire_all(&mut self) {
        while self.retire_front() {}
    }

    fn execute(&mut self, command: &RecordedCommand) {
        if let RecordedCommand::CopyBuffer { src, dst, regions } = command {
            let src_memory = self.buffers.get(&src.as_raw()).and_then(|(_, m)| *m);
            let dst_memory = self.buffers.get(&dst.as_raw()).and_then(|(_, m)| *m);
            let (Some(src_memory), Some(dst_memory)) = (src_memory, dst_memory) else {
                self.violations.push("copy between unbound buffers".to_string());
                return;
            };

            for &(src_offset, dst_offset, size) in regions {
                let (Ok(src_offset), Ok(dst_offset), Ok(size)) = (
                    usize::try_from(src_offset),
                    usize::try_from(dst_offset),
                    usize::try_from(size),
                ) else {
                    continue;
                };
                let Some(bytes) = self
                    .memory
                    .get(&src_memory)
                    .and_then(|m| m.get(src_offset..src_offset + size))
                    .map(<[u8]>::to_vec)
                else {
                    self.violations.push("copy reads past source".to_string());
                    continue;
                };
                match self
                    .memory
                    .get_mut(&dst_memory)
                    .and_then(|m| m.get_mut(dst_offset..dst_offset + size))
                {
                    Some(target) => target.copy_from_slice(&bytes),
                    None => self.violations.push("copy writes past destination".to_string()),
                }
            }
        }
    }
}

fn owned(command: &Command<'_>) -> RecordedCommand {
    match *command {
        Command::BeginRenderPass { framebuffer, extent, .. } => {
            RecordedCommand::BeginRenderPass { framebuffer, extent }
        }
        Command::EndRenderPass => RecordedCommand::EndRenderPass,
        Command::BindPipeline(pipeline) => RecordedCommand::BindPipeline(pipeline),
        Command::SetViewport(viewport) => RecordedCommand::SetViewport {
            width: viewport.width,
            height: viewport.height,
        },
        Command::SetScissor(scissor) => RecordedCommand::SetScissor(scissor.extent),
        Command::BindVertexBuffers { buffers, .. } => {
            RecordedCommand::BindVertexBuffers(buffers.to_vec())
        }
        Command::BindIndexBuffer { buffer, index_type } => {
            RecordedCommand::BindIndexBuffer(buffer, index_type)
        }
        Command::BindDescriptorSets { sets, .. } => RecordedCommand::BindDescriptorSets(sets.to_vec()),
        Command::DrawIndexed { index_count } => RecordedCommand::DrawIndexed(index_count),
        Command::CopyBuffer { src, dst, regions } => RecordedCommand::CopyBuffer {
            src,
            dst,
            regions: regions
                .iter()
                .map(|r| (r.src_offset, r.dst_offset, r.size))
                .collect(),
        },
        Command::CopyBufferToImage { src, dst, .. } => RecordedCommand::CopyBufferToImage { src, dst },
        Command::ImageBarrier {
            image,
            old_layout,
            new_layout,
            ..
        } => RecordedCommand::ImageBarrier {
            image,
            old_layout,
            new_layout,
        },
    }
}

impl GpuDevice for HeadlessDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        properties.memory_types[DEVICE_LOCAL_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        properties.memory_types[HOST_VISIBLE_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        properties.memory_heaps[0] = vk::MemoryHeap {
            size: 256 << 20,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        properties.memory_heaps[1] = vk::MemoryHeap {
            size: 256 << 20,
            flags: vk::MemoryHeapFlags::empty(),
        };
        properties
    }

    fn surface_capabilities(&self) -> RenderResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.borrow().capabilities)
    }

    fn surface_formats(&self) -> RenderResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.borrow().formats.clone())
    }

    fn surface_present_modes(&self) -> RenderResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state.borrow().present_modes.clone())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(DeviceCall::WaitIdle);
        state.retire_all();
        Ok(())
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(DeviceCall::QueueWaitIdle(queue));
        // Presentation does not consume graphics submissions
        if queue == QueueKind::Graphics {
            state.retire_all();
        }
        Ok(())
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_semaphore")?;
        Ok(vk::Semaphore::from_raw(state.create(ObjectKind::Semaphore)))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.borrow_mut();
        state.signaled_semaphores.remove(&semaphore.as_raw());
        state.destroy(ObjectKind::Semaphore, semaphore.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_fence")?;
        let raw = state.create(ObjectKind::Fence);
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        let raw = fence.as_raw();
        if state.pending.iter().any(|p| p.fence == raw) {
            state.violations.push(format!("fence {raw} destroyed while pending"));
        }
        state.fences.remove(&raw);
        state.destroy(ObjectKind::Fence, raw);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        let raw = fence.as_raw();
        state.calls.push(DeviceCall::WaitFence(fence));

        while !state.fences.get(&raw).copied().unwrap_or(false) {
            if !state.retire_front() {
                return Err(RenderError::GraphicsResource {
                    operation: "wait for fence",
                    result: vk::Result::TIMEOUT,
                });
            }
        }
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        let raw = fence.as_raw();
        state.calls.push(DeviceCall::ResetFence(fence));
        if state.pending.iter().any(|p| p.fence == raw) {
            state.violations.push(format!("fence {raw} reset while its submission is pending"));
        }
        state.fences.insert(raw, false);
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RenderResult<bool> {
        Ok(self
            .state
            .borrow()
            .fences
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false))
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> RenderResult<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_command_pool")?;
        Ok(vk::CommandPool::from_raw(state.create(ObjectKind::CommandPool)))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.borrow_mut();
        let raw = pool.as_raw();
        let owned: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, cb)| cb.pool == raw)
            .map(|(handle, _)| *handle)
            .collect();
        for cb in owned {
            if state.command_buffers.get(&cb).is_some_and(|s| s.pending) {
                state.violations.push(format!("command buffer {cb} destroyed while pending"));
            }
            state.command_buffers.remove(&cb);
            state.destroy(ObjectKind::CommandBuffer, cb);
        }
        state.destroy(ObjectKind::CommandPool, raw);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.borrow_mut();
        state.check_failure("allocate_command_buffers")?;
        Ok((0..count)
            .map(|_| {
                let raw = state.create(ObjectKind::CommandBuffer);
                state.command_buffers.insert(
                    raw,
                    CommandBufferState {
                        pool: pool.as_raw(),
                        ..CommandBufferState::default()
                    },
                );
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.borrow_mut();
        for buffer in buffers {
            let raw = buffer.as_raw();
            if state.command_buffers.get(&raw).is_some_and(|s| s.pending) {
                state.violations.push(format!("command buffer {raw} freed while pending"));
            }
            state.command_buffers.remove(&raw);
            state.destroy(ObjectKind::CommandBuffer, raw);
        }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        let raw = buffer.as_raw();
        state.calls.push(DeviceCall::ResetCommandBuffer(buffer));
        let mut violation = None;
        if let Some(cb) = state.command_buffers.get_mut(&raw) {
            if cb.pending {
                violation = Some(format!("command buffer {raw} reset while pending"));
            }
            cb.recording = false;
            cb.commands.clear();
        }
        state.violations.extend(violation);
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_failure("begin_command_buffer")?;
        let raw = buffer.as_raw();
        let mut violation = None;
        match state.command_buffers.get_mut(&raw) {
            Some(cb) => {
                if cb.pending {
                    violation = Some(format!("command buffer {raw} re-recorded while pending"));
                }
                cb.recording = true;
                cb.commands.clear();
            }
            None => violation = Some(format!("begin on unknown command buffer {raw}")),
        }
        state.violations.extend(violation);
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        let raw = buffer.as_raw();
        let mut violation = None;
        if let Some(cb) = state.command_buffers.get_mut(&raw) {
            if !cb.recording {
                violation = Some(format!("end on command buffer {raw} that is not recording"));
            }
            cb.recording = false;
        }
        state.violations.extend(violation);
        Ok(())
    }

    fn record(&self, buffer: vk::CommandBuffer, command: &Command<'_>) {
        let mut state = self.state.borrow_mut();
        let raw = buffer.as_raw();
        let recorded = owned(command);

        if let RecordedCommand::BeginRenderPass { framebuffer, .. } = &recorded {
            if !state
                .live
                .get(&ObjectKind::Framebuffer)
                .is_some_and(|set| set.contains(&framebuffer.as_raw()))
            {
                state
                    .violations
                    .push(format!("render pass begun on stale framebuffer {}", framebuffer.as_raw()));
            }
        }

        let mut violation = None;
        match state.command_buffers.get_mut(&raw) {
            Some(cb) if cb.recording => cb.commands.push(recorded),
            _ => violation = Some(format!("command recorded outside recording on {raw}")),
        }
        state.violations.extend(violation);
    }

    fn queue_submit(&self, queue: QueueKind, submit: &SubmitDesc<'_>) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_failure("queue_submit")?;

        let fence_raw = submit.fence.as_raw();
        if fence_raw != 0 {
            if state.fences.get(&fence_raw).copied().unwrap_or(false) {
                state.violations.push(format!("fence {fence_raw} submitted while signaled"));
            }
            if state.pending.iter().any(|p| p.fence == fence_raw) {
                state.violations.push(format!("fence {fence_raw} submitted twice"));
            }
        }
        for semaphore in submit.wait_semaphores {
            if !state.signaled_semaphores.remove(&semaphore.as_raw()) {
                state
                    .violations
                    .push(format!("submit waits on unsignaled semaphore {}", semaphore.as_raw()));
            }
        }
        for semaphore in submit.signal_semaphores {
            if !state.signaled_semaphores.insert(semaphore.as_raw()) {
                state
                    .violations
                    .push(format!("semaphore {} signaled twice", semaphore.as_raw()));
            }
        }

        let mut violations = Vec::new();
        for cb in submit.command_buffers {
            match state.command_buffers.get_mut(&cb.as_raw()) {
                Some(cb_state) if !cb_state.recording && !cb_state.pending => cb_state.pending = true,
                _ => violations.push(format!("command buffer {} not executable", cb.as_raw())),
            }
        }
        state.violations.extend(violations);

        state.generation += 1;
        let generation = state.generation;
        state.calls.push(DeviceCall::Submit {
            fence: submit.fence,
            generation,
        });
        state.submits.push(SubmitRecord {
            generation,
            queue,
            command_buffers: submit.command_buffers.to_vec(),
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });
        state.pending.push_back(PendingSubmit {
            command_buffers: submit.command_buffers.iter().map(|cb| cb.as_raw()).collect(),
            fence: fence_raw,
        });

        if state.auto_retire {
            state.retire_all();
        }
        Ok(())
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> RenderResult<vk::Buffer> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_buffer")?;
        if size == 0 {
            return Err(RenderError::GraphicsResource {
                operation: "create buffer",
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        let raw = state.create(ObjectKind::Buffer);
        state.buffers.insert(raw, (size, None));
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.borrow_mut();
        let raw = buffer.as_raw();
        if state.in_use_by_pending(|c| match c {
            RecordedCommand::BindVertexBuffers(buffers) => buffers.contains(&buffer),
            RecordedCommand::BindIndexBuffer(b, _) => *b == buffer,
            RecordedCommand::CopyBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
            _ => false,
        }) {
            state.violations.push(format!("buffer {raw} destroyed while in use"));
        }
        state.buffers.remove(&raw);
        state.destroy(ObjectKind::Buffer, raw);
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .state
            .borrow()
            .buffers
            .get(&buffer.as_raw())
            .map_or(0, |(size, _)| *size);
        vk::MemoryRequirements {
            size: (size + 15) & !15,
            alignment: 16,
            memory_type_bits: 0b11,
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> RenderResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_failure("bind_buffer_memory")?;
        if let Some(entry) = state.buffers.get_mut(&buffer.as_raw()) {
            entry.1 = Some(memory.as_raw());
        }
        Ok(())
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> RenderResult<vk::DeviceMemory> {
        let mut state = self.state.borrow_mut();
        state.check_failure("allocate_memory")?;
        if memory_type_index > HOST_VISIBLE_TYPE {
            return Err(RenderError::GraphicsResource {
                operation: "allocate memory",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        }
        let len = usize::try_from(size).map_err(|_| RenderError::GraphicsResource {
            operation: "allocate memory",
            result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        })?;
        let raw = state.create(ObjectKind::Memory);
        state.memory.insert(raw, vec![0u8; len].into_boxed_slice());
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.borrow_mut();
        let raw = memory.as_raw();
        if state.mapped.remove(&raw) {
            state.violations.push(format!("memory {raw} freed while mapped"));
        }
        state.memory.remove(&raw);
        state.destroy(ObjectKind::Memory, raw);
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> RenderResult<*mut u8> {
        let mut state = self.state.borrow_mut();
        state.check_failure("map_memory")?;
        let raw = memory.as_raw();
        if !state.mapped.insert(raw) {
            state.violations.push(format!("memory {raw} mapped twice"));
        }
        let bytes = state.memory.get_mut(&raw).ok_or(RenderError::GraphicsResource {
            operation: "map memory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
        })?;
        if usize::try_from(size).map_or(true, |size| size > bytes.len()) {
            return Err(RenderError::GraphicsResource {
                operation: "map memory",
                result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            });
        }
        Ok(bytes.as_mut_ptr())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.borrow_mut();
        let raw = memory.as_raw();
        if !state.mapped.remove(&raw) {
            state.violations.push(format!("memory {raw} unmapped while not mapped"));
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<vk::Image> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_image")?;
        let raw = state.create(ObjectKind::Image);
        state.images.insert(raw, *desc);
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.borrow_mut();
        state.images.remove(&image.as_raw());
        state.destroy(ObjectKind::Image, image.as_raw());
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self
            .state
            .borrow()
            .images
            .get(&image.as_raw())
            .map_or(0, |desc| u64::from(desc.extent.width) * u64::from(desc.extent.height) * 4);
        vk::MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: 0b01,
        }
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> RenderResult<()> {
        self.state.borrow_mut().check_failure("bind_image_memory")
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> RenderResult<vk::ImageView> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_image_view")?;
        Ok(vk::ImageView::from_raw(state.create(ObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state
            .borrow_mut()
            .destroy(ObjectKind::ImageView, view.as_raw());
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> RenderResult<vk::Sampler> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_sampler")?;
        Ok(vk::Sampler::from_raw(state.create(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state
            .borrow_mut()
            .destroy(ObjectKind::Sampler, sampler.as_raw());
    }

    fn create_render_pass(&self, _color_format: vk::Format) -> RenderResult<vk::RenderPass> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_render_pass")?;
        Ok(vk::RenderPass::from_raw(state.create(ObjectKind::RenderPass)))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state
            .borrow_mut()
            .destroy(ObjectKind::RenderPass, render_pass.as_raw());
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> RenderResult<vk::Framebuffer> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_framebuffer")?;
        for view in attachments {
            if !state
                .live
                .get(&ObjectKind::ImageView)
                .is_some_and(|set| set.contains(&view.as_raw()))
            {
                state
                    .violations
                    .push(format!("framebuffer built on stale view {}", view.as_raw()));
            }
        }
        Ok(vk::Framebuffer::from_raw(state.create(ObjectKind::Framebuffer)))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.borrow_mut();
        if state.in_use_by_pending(|c| {
            matches!(c, RecordedCommand::BeginRenderPass { framebuffer: f, .. } if *f == framebuffer)
        }) {
            state
                .violations
                .push(format!("framebuffer {} destroyed while in use", framebuffer.as_raw()));
        }
        state.destroy(ObjectKind::Framebuffer, framebuffer.as_raw());
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_swapchain")?;
        if desc.extent.width == 0 || desc.extent.height == 0 {
            state.violations.push("swapchain created with zero extent".to_string());
        }
        let raw = state.create(ObjectKind::Swapchain);
        // Swapchain images are owned by the swapchain, not tracked as objects
        let images = (0..desc.min_image_count)
            .map(|_| {
                let image = state.next_raw;
                state.next_raw += 1;
                vk::Image::from_raw(image)
            })
            .collect();
        state.swapchains.insert(
            raw,
            SwapchainState {
                images,
                desc: *desc,
                acquired: BTreeSet::new(),
                next_image: 0,
            },
        );
        let swapchain = vk::SwapchainKHR::from_raw(raw);
        state.calls.push(DeviceCall::CreateSwapchain(swapchain));
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>> {
        self.state
            .borrow()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|sc| sc.images.clone())
            .ok_or(RenderError::GraphicsResource {
                operation: "get swapchain images",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        state.swapchains.remove(&swapchain.as_raw());
        state.calls.push(DeviceCall::DestroySwapchain(swapchain));
        state.destroy(ObjectKind::Swapchain, swapchain.as_raw());
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let mut state = self.state.borrow_mut();
        state.check_failure("acquire_next_image")?;
        state.calls.push(DeviceCall::Acquire(signal));

        let scripted = state.acquire_script.pop_front();
        if let Some(outcome @ (AcquireOutcome::OutOfDate | AcquireOutcome::NotReady)) = scripted {
            return Ok(outcome);
        }

        let Some(chain) = state.swapchains.get_mut(&swapchain.as_raw()) else {
            return Err(RenderError::GraphicsResource {
                operation: "acquire next image",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            });
        };
        let count = u32::try_from(chain.images.len()).unwrap_or(u32::MAX).max(1);
        let image_index = match scripted {
            Some(AcquireOutcome::Acquired { image_index, .. }) => image_index,
            _ => {
                let index = chain.next_image % count;
                chain.next_image = chain.next_image.wrapping_add(1);
                index
            }
        };
        let suboptimal = matches!(scripted, Some(AcquireOutcome::Acquired { suboptimal: true, .. }));
        let double_acquire = !chain.acquired.insert(image_index);

        if double_acquire {
            state
                .violations
                .push(format!("swap image {image_index} acquired twice"));
        }
        if !state.signaled_semaphores.insert(signal.as_raw()) {
            state
                .violations
                .push(format!("acquire signals already signaled semaphore {}", signal.as_raw()));
        }
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal,
        })
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let mut state = self.state.borrow_mut();
        state.check_failure("queue_present")?;
        state.calls.push(DeviceCall::Present(image_index));

        if !state.signaled_semaphores.remove(&wait.as_raw()) {
            state
                .violations
                .push(format!("present waits on unsignaled semaphore {}", wait.as_raw()));
        }
        let released = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .is_some_and(|chain| chain.acquired.remove(&image_index));
        if !released {
            state
                .violations
                .push(format!("present of image {image_index} that was not acquired"));
        }

        state.presents.push(PresentRecord {
            swapchain,
            image_index,
            wait_semaphore: wait,
        });
        Ok(state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<vk::DescriptorSetLayout> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_descriptor_set_layout")?;
        Ok(vk::DescriptorSetLayout::from_raw(
            state.create(ObjectKind::DescriptorSetLayout),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state
            .borrow_mut()
            .destroy(ObjectKind::DescriptorSetLayout, layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool> {
        let mut state = self.state.borrow_mut();
        state.check_failure("create_descriptor_pool")?;
        let raw = state.create(ObjectKind::DescriptorPool);
        state.pool_sets.insert(raw, (max_sets, Vec::new()));
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.borrow_mut();
        let raw = pool.as_raw();
        if let Some((_, sets)) = state.pool_sets.remove(&raw) {
            for set in sets {
                state.destroy(ObjectKind::DescriptorSet, set);
            }
        }
        state.destroy(ObjectKind::DescriptorPool, raw);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RenderResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.borrow_mut();
        state.check_failure("allocate_descriptor_sets")?;
        let raw = pool.as_raw();
        let (capacity, used) = state
            .pool_sets
            .get(&raw)
            .map_or((0, 0), |(capacity, sets)| (*capacity as usize, sets.len()));
        if used + layouts.len() > capacity {
            return Err(RenderError::GraphicsResource {
                operation: "allocate descriptor sets",
                result: vk::Result::ERROR_OUT_OF_POOL_MEMORY,
            });
        }
        let sets: Vec<u64> = layouts
            .iter()
            .map(|_| state.create(ObjectKind::DescriptorSet))
            .collect();
        if let Some((_, owned)) = state.pool_sets.get_mut(&raw) {
            owned.extend(&sets);
        }
        Ok(sets.into_iter().map(vk::DescriptorSet::from_raw).collect())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state
            .borrow_mut()
            .descriptor_writes
            .extend_from_slice(writes);
    }
}
