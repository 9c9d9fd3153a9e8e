//! Presentation surface and swap image set
//!
//! [`SwapImageSet`] owns the swapchain, one view and one framebuffer per
//! swap image, and the forward render pass they are built against. The
//! images, views and framebuffers are always rebuilt together; there is no
//! partial update path because image count and extent can change at the
//! same time.
//!
//! Synchronization objects are not owned here. They belong to the frame
//! slots and survive recreation untouched.

use ash::vk;
use std::rc::Rc;

use crate::core::config::RendererConfig;
use crate::render::device::{AcquireOutcome, DeviceRef, PresentOutcome, SwapchainDesc};
use crate::render::error::{RenderError, RenderResult};
use crate::render::window::SurfaceProvider;

/// Surface format preferred when offered
pub const PREFERRED_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::R8G8B8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

fn same_format(a: vk::SurfaceFormatKHR, b: vk::SurfaceFormatKHR) -> bool {
    a.format == b.format && a.color_space == b.color_space
}

fn has_area(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

/// Pick the 8-bit sRGB format when offered, otherwise the first one
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> RenderResult<vk::SurfaceFormatKHR> {
    if let Some(format) = available
        .iter()
        .copied()
        .find(|&f| same_format(f, PREFERRED_SURFACE_FORMAT))
    {
        return Ok(format);
    }

    let first = available
        .first()
        .copied()
        .ok_or_else(|| RenderError::InitializationFailed("Surface reports no formats".to_string()))?;
    log::warn!(
        "Preferred surface format unavailable, falling back to {:?}/{:?}",
        first.format,
        first.color_space
    );
    Ok(first)
}

/// Use `preferred` when supported, otherwise FIFO
pub fn choose_present_mode(available: &[vk::PresentModeKHR], preferred: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        log::debug!("Present mode {:?} unsupported, using FIFO", preferred);
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the framebuffer size clamped to the surface limits
/// when the surface leaves it to the application
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, framebuffer: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: framebuffer.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: framebuffer.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum when there is one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Result of an acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    /// An image is ready for rendering
    Ready {
        /// Index into the swap image set, unrelated to the frame slot
        image_index: u32,
        /// The surface still works but should be rebuilt soon
        suboptimal: bool,
    },
    /// The set no longer matches the surface
    Stale,
    /// The acquire timeout elapsed first; nothing was signaled
    TimedOut,
}

/// Result of a recreation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    /// A new generation of swap images is in place
    Recreated,
    /// The window has zero area; nothing was touched
    Deferred,
}

/// Extent to build against, waiting while the window is minimized
///
/// Both the framebuffer and the surface must have area; surfaces keep
/// reporting a zero extent for a while after the window is minimized.
/// Returns `None` instead of waiting when `pause` is false.
fn visible_extent(
    device: &DeviceRef,
    surface: &mut dyn SurfaceProvider,
    pause: bool,
) -> RenderResult<Option<(vk::Extent2D, vk::SurfaceCapabilitiesKHR)>> {
    loop {
        let framebuffer = surface.framebuffer_extent();
        if has_area(framebuffer) {
            let capabilities = device.surface_capabilities()?;
            let extent = choose_extent(&capabilities, framebuffer);
            if has_area(extent) {
                return Ok(Some((extent, capabilities)));
            }
        }
        if !pause {
            return Ok(None);
        }
        surface.wait_events();
    }
}

struct SwapTargets {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
}

impl SwapTargets {
    fn build(
        device: &DeviceRef,
        swapchain: vk::SwapchainKHR,
        format: vk::Format,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let mut targets = Self {
            images: device.swapchain_images(swapchain)?,
            views: Vec::new(),
            framebuffers: Vec::new(),
        };
        if let Err(err) = targets.populate(device, format, render_pass, extent) {
            targets.release(device);
            return Err(err);
        }
        Ok(targets)
    }

    fn populate(
        &mut self,
        device: &DeviceRef,
        format: vk::Format,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> RenderResult<()> {
        for &image in &self.images {
            self.views.push(device.create_image_view(image, format)?);
        }
        for &view in &self.views {
            self.framebuffers
                .push(device.create_framebuffer(render_pass, &[view], extent)?);
        }
        Ok(())
    }

    fn release(&mut self, device: &DeviceRef) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer);
        }
        for view in self.views.drain(..) {
            device.destroy_image_view(view);
        }
        self.images.clear();
    }
}

/// Swap images and the render targets derived from them
pub struct SwapImageSet {
    device: DeviceRef,
    swapchain: vk::SwapchainKHR,
    targets: SwapTargets,
    render_pass: vk::RenderPass,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    preferred_present_mode: vk::PresentModeKHR,
    acquire_timeout_ns: u64,
    generation: u64,
}

impl SwapImageSet {
    /// Build the first generation of swap images
    ///
    /// Blocks on `surface.wait_events()` while the window has zero area.
    pub fn new(device: &DeviceRef, surface: &mut dyn SurfaceProvider, config: &RendererConfig) -> RenderResult<Self> {
        let (extent, capabilities) = visible_extent(device, surface, true)?
            .ok_or_else(|| RenderError::InitializationFailed("Window never became visible".to_string()))?;

        let format = choose_surface_format(&device.surface_formats()?)?;
        let render_pass = device.create_render_pass(format.format)?;

        let mut set = Self {
            device: Rc::clone(device),
            swapchain: vk::SwapchainKHR::null(),
            targets: SwapTargets {
                images: Vec::new(),
                views: Vec::new(),
                framebuffers: Vec::new(),
            },
            render_pass,
            format,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            preferred_present_mode: config.preferred_present_mode.to_vk(),
            acquire_timeout_ns: config.acquire_timeout_ns,
            generation: 0,
        };
        // On failure the partially built set drops and releases the render pass
        set.rebuild(extent, &capabilities)?;

        log::info!(
            "Swap image set: {} images {}x{} {:?} {:?}",
            set.image_count(),
            set.extent.width,
            set.extent.height,
            set.format.format,
            set.present_mode
        );
        Ok(set)
    }

    /// Rebuild the set against the current surface
    ///
    /// While the window or the surface has zero area this either blocks on
    /// `wait_events()` (`pause_on_minimize`) or returns
    /// [`RecreateOutcome::Deferred`] without touching anything. Otherwise
    /// it waits for the device to go idle before destroying the old
    /// generation.
    pub fn recreate(
        &mut self,
        surface: &mut dyn SurfaceProvider,
        pause_on_minimize: bool,
    ) -> RenderResult<RecreateOutcome> {
        let Some((extent, capabilities)) = visible_extent(&self.device, surface, pause_on_minimize)? else {
            log::trace!("Window minimized, deferring swap image recreation");
            return Ok(RecreateOutcome::Deferred);
        };

        self.device.wait_idle()?;
        self.rebuild(extent, &capabilities)?;

        log::debug!(
            "Recreated swap image set (generation {}): {} images {}x{}",
            self.generation,
            self.image_count(),
            self.extent.width,
            self.extent.height
        );
        Ok(RecreateOutcome::Recreated)
    }

    fn rebuild(&mut self, extent: vk::Extent2D, capabilities: &vk::SurfaceCapabilitiesKHR) -> RenderResult<()> {
        // Keep the current format while it is offered so the render pass,
        // and every pipeline built against it, stays compatible
        let formats = self.device.surface_formats()?;
        let format = if formats.iter().any(|&f| same_format(f, self.format)) {
            self.format
        } else {
            choose_surface_format(&formats)?
        };
        let present_mode = choose_present_mode(&self.device.surface_present_modes()?, self.preferred_present_mode);

        let swapchain = self.device.create_swapchain(&SwapchainDesc {
            min_image_count: choose_image_count(capabilities),
            format,
            extent,
            present_mode,
            pre_transform: capabilities.current_transform,
            old_swapchain: self.swapchain,
        })?;

        self.targets.release(&self.device);
        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
        }
        self.swapchain = swapchain;

        if !same_format(format, self.format) {
            log::warn!(
                "Surface format changed from {:?} to {:?}; pipelines must be rebuilt",
                self.format.format,
                format.format
            );
            let render_pass = self.device.create_render_pass(format.format)?;
            self.device.destroy_render_pass(self.render_pass);
            self.render_pass = render_pass;
            self.format = format;
        }

        self.targets = SwapTargets::build(&self.device, swapchain, format.format, self.render_pass, extent)?;
        self.present_mode = present_mode;
        self.extent = extent;
        self.generation += 1;
        Ok(())
    }

    /// Acquire the next image, signaling `signal` when it is ready
    pub fn acquire_next(&self, signal: vk::Semaphore) -> RenderResult<AcquireStatus> {
        match self
            .device
            .acquire_next_image(self.swapchain, self.acquire_timeout_ns, signal)?
        {
            AcquireOutcome::OutOfDate => Ok(AcquireStatus::Stale),
            AcquireOutcome::NotReady => Ok(AcquireStatus::TimedOut),
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if image_index as usize >= self.targets.images.len() {
                    return Err(RenderError::illegal(format!(
                        "acquired image {image_index} outside a set of {}",
                        self.targets.images.len()
                    )));
                }
                Ok(AcquireStatus::Ready {
                    image_index,
                    suboptimal,
                })
            }
        }
    }

    /// Present `image_index` once `wait` is signaled
    pub fn present(&self, image_index: u32, wait: vk::Semaphore) -> RenderResult<PresentOutcome> {
        self.device.queue_present(self.swapchain, image_index, wait)
    }

    /// Framebuffer of a swap image
    pub fn framebuffer(&self, image_index: u32) -> RenderResult<vk::Framebuffer> {
        self.targets
            .framebuffers
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| RenderError::illegal(format!("no framebuffer for swap image {image_index}")))
    }

    /// Forward render pass the framebuffers are built against
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Number of swap images
    pub fn image_count(&self) -> usize {
        self.targets.images.len()
    }

    /// Swap images of the current generation
    pub fn images(&self) -> &[vk::Image] {
        &self.targets.images
    }

    /// Views of the current generation
    pub fn views(&self) -> &[vk::ImageView] {
        &self.targets.views
    }

    /// Framebuffers of the current generation
    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.targets.framebuffers
    }

    /// Selected surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Selected present mode
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of completed builds, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for SwapImageSet {
    fn drop(&mut self) {
        self.targets.release(&self.device);
        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
        }
        self.device.destroy_render_pass(self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{DeviceCall, HeadlessDevice, ObjectKind};
    use crate::render::window::ScriptedSurface;

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 800, height: 600 };

    fn setup() -> (Rc<HeadlessDevice>, DeviceRef) {
        let headless = Rc::new(HeadlessDevice::new(EXTENT));
        let device: DeviceRef = headless.clone();
        (headless, device)
    }

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: EXTENT,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    #[test]
    fn test_surface_format_preference() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = choose_surface_format(&[unorm, PREFERRED_SURFACE_FORMAT]).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);

        let chosen = choose_surface_format(&[unorm]).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);

        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_selection() {
        let fixed = capabilities(2, 3);
        assert_eq!(
            choose_extent(&fixed, vk::Extent2D { width: 1, height: 1 }),
            EXTENT
        );

        let mut sentinel = capabilities(2, 3);
        sentinel.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        sentinel.max_image_extent = vk::Extent2D { width: 1024, height: 768 };
        let extent = choose_extent(&sentinel, vk::Extent2D { width: 2000, height: 500 });
        assert_eq!((extent.width, extent.height), (1024, 500));
    }

    #[test]
    fn test_image_count_clamped() {
        assert_eq!(choose_image_count(&capabilities(2, 8)), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3)), 3);
        assert_eq!(choose_image_count(&capabilities(2, 0)), 3);
        assert_eq!(choose_image_count(&capabilities(1, 2)), 2);
    }

    #[test]
    fn test_initial_build() {
        let (headless, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();

        assert_eq!(set.image_count(), 3);
        assert_eq!(set.format().format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(set.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(set.generation(), 1);
        assert_eq!(headless.live_count(ObjectKind::ImageView), 3);
        assert_eq!(headless.live_count(ObjectKind::Framebuffer), 3);
        assert_eq!(headless.live_count(ObjectKind::RenderPass), 1);

        drop(set);
        assert_eq!(headless.total_live(), 0);
        assert!(headless.violations().is_empty());
    }

    #[test]
    fn test_recreation_replaces_every_target() {
        let (headless, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let mut set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();

        let old_views = set.views().to_vec();
        let old_framebuffers = set.framebuffers().to_vec();
        let old_swapchain = set.handle();
        let render_pass = set.render_pass();

        headless.set_surface_capabilities(vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 1024, height: 768 },
            ..capabilities(3, 4)
        });
        assert_eq!(
            set.recreate(&mut surface, true).unwrap(),
            RecreateOutcome::Recreated
        );

        assert_eq!(set.image_count(), 4);
        assert_eq!(set.extent().width, 1024);
        assert_eq!(set.generation(), 2);
        assert_eq!(set.render_pass(), render_pass);
        for view in old_views {
            assert!(!headless.is_live(ObjectKind::ImageView, vk::Handle::as_raw(view)));
        }
        for framebuffer in old_framebuffers {
            assert!(!headless.is_live(ObjectKind::Framebuffer, vk::Handle::as_raw(framebuffer)));
        }
        assert!(!headless.is_live(ObjectKind::Swapchain, vk::Handle::as_raw(old_swapchain)));
        assert_eq!(headless.live_count(ObjectKind::Framebuffer), 4);
        assert_eq!(headless.live_count(ObjectKind::Swapchain), 1);
        assert!(headless.calls().contains(&DeviceCall::WaitIdle));
        assert!(headless.violations().is_empty());
    }

    #[test]
    fn test_format_change_rebuilds_render_pass() {
        let (headless, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let mut set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();
        let render_pass = set.render_pass();

        headless.set_surface_formats(vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }]);
        set.recreate(&mut surface, true).unwrap();

        assert_eq!(set.format().format, vk::Format::B8G8R8A8_UNORM);
        assert_ne!(set.render_pass(), render_pass);
        assert_eq!(headless.live_count(ObjectKind::RenderPass), 1);
    }

    #[test]
    fn test_minimized_recreation_polls_until_visible() {
        let (headless, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let mut set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();
        let swapchains_before = headless
            .calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::CreateSwapchain(_)))
            .count();

        let mut minimized = ScriptedSurface::sequence([
            vk::Extent2D { width: 0, height: 0 },
            vk::Extent2D { width: 0, height: 0 },
            EXTENT,
        ]);
        set.recreate(&mut minimized, true).unwrap();

        assert_eq!(minimized.wait_count(), 2);
        let swapchains_after = headless
            .calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::CreateSwapchain(_)))
            .count();
        assert_eq!(swapchains_after, swapchains_before + 1);
        assert!(set.image_count() > 0);
        assert!(headless.violations().is_empty());
    }

    #[test]
    fn test_minimized_without_pause_defers() {
        let (_, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let mut set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();

        let mut minimized = ScriptedSurface::fixed(vk::Extent2D { width: 0, height: 0 });
        assert_eq!(
            set.recreate(&mut minimized, false).unwrap(),
            RecreateOutcome::Deferred
        );
        assert_eq!(minimized.wait_count(), 0);
        assert_eq!(set.generation(), 1);
    }

    /// Window that stays visible while the surface catches up after
    /// `restore_after` waits
    struct LaggingSurface {
        headless: Rc<HeadlessDevice>,
        restore_after: usize,
        waits: usize,
    }

    impl SurfaceProvider for LaggingSurface {
        fn framebuffer_extent(&self) -> vk::Extent2D {
            EXTENT
        }

        fn take_resize_request(&mut self) -> bool {
            false
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            if self.waits == self.restore_after {
                self.headless.set_surface_extent(EXTENT);
            }
        }
    }

    #[test]
    fn test_zero_area_surface_waits_while_paused() {
        let (headless, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let mut set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();

        headless.set_surface_extent(vk::Extent2D { width: 0, height: 0 });
        let mut lagging = LaggingSurface {
            headless: Rc::clone(&headless),
            restore_after: 2,
            waits: 0,
        };
        assert_eq!(
            set.recreate(&mut lagging, true).unwrap(),
            RecreateOutcome::Recreated
        );
        assert_eq!(lagging.waits, 2);
        assert_eq!(set.extent(), EXTENT);
        assert_eq!(set.generation(), 2);
        assert!(headless.violations().is_empty());
    }

    #[test]
    fn test_zero_area_surface_defers_without_pause() {
        let (headless, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let mut set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();
        let old_swapchain = set.handle();

        headless.set_surface_extent(vk::Extent2D { width: 0, height: 0 });
        assert_eq!(
            set.recreate(&mut surface, false).unwrap(),
            RecreateOutcome::Deferred
        );
        // Nothing was waited on or replaced
        assert!(!headless.calls().contains(&DeviceCall::WaitIdle));
        assert_eq!(set.handle(), old_swapchain);
        assert_eq!(set.generation(), 1);
        assert_eq!(surface.wait_count(), 0);
    }

    #[test]
    fn test_stale_acquire() {
        let (headless, device) = setup();
        let mut surface = ScriptedSurface::fixed(EXTENT);
        let set = SwapImageSet::new(&device, &mut surface, &RendererConfig::default()).unwrap();
        let semaphore = device.create_semaphore().unwrap();

        headless.script_acquire(AcquireOutcome::OutOfDate);
        assert_eq!(set.acquire_next(semaphore).unwrap(), AcquireStatus::Stale);
        device.destroy_semaphore(semaphore);
    }
}
