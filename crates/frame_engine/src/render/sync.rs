//! Synchronization primitives
//!
//! Each frame slot owns one [`FrameSync`]: a semaphore signaled by image
//! acquisition, a semaphore signaled when rendering finishes, and a fence
//! the CPU waits on before reusing the slot. Fences start signaled so the
//! first wait on every slot returns immediately.

use ash::vk;
use std::rc::Rc;

use crate::render::device::DeviceRef;
use crate::render::error::{RenderError, RenderResult};

/// Binary semaphore with RAII cleanup
pub struct Semaphore {
    device: DeviceRef,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: &DeviceRef) -> RenderResult<Self> {
        let semaphore = device.create_semaphore()?;
        Ok(Self {
            device: Rc::clone(device),
            semaphore,
        })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: DeviceRef,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: &DeviceRef, signaled: bool) -> RenderResult<Self> {
        let fence = device.create_fence(signaled)?;
        Ok(Self {
            device: Rc::clone(device),
            fence,
        })
    }

    /// Wait for the fence to become signaled
    pub fn wait(&self, timeout_ns: u64) -> RenderResult<()> {
        self.device.wait_for_fence(self.fence, timeout_ns)
    }

    /// Reset the fence to unsignaled
    pub fn reset(&self) -> RenderResult<()> {
        self.device.reset_fence(self.fence)
    }

    /// Non-blocking status query
    pub fn is_signaled(&self) -> RenderResult<bool> {
        self.device.fence_signaled(self.fence)
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

/// Synchronization objects of one frame slot
pub struct FrameSync {
    /// Signaled when the acquired swap image is ready
    pub image_available: Semaphore,
    /// Signaled when the slot's rendering completes
    pub render_finished: Semaphore,
    /// Signaled when the slot's submission retires
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create frame synchronization objects, fence signaled
    pub fn new(device: &DeviceRef) -> RenderResult<Self> {
        let image_available = Semaphore::new(device)?;
        let render_finished = Semaphore::new(device)?;
        let in_flight = Fence::new(device, true)?;

        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }
}

/// Per-slot synchronization for every frame in flight
pub struct FrameSyncSet {
    frames: Vec<FrameSync>,
}

impl FrameSyncSet {
    /// Create `frames_in_flight` slots
    pub fn new(device: &DeviceRef, frames_in_flight: usize) -> RenderResult<Self> {
        if frames_in_flight == 0 {
            return Err(RenderError::illegal("frames in flight must be at least 1"));
        }
        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(device))
            .collect::<RenderResult<Vec<_>>>()?;

        log::debug!("Created synchronization for {} frames in flight", frames.len());
        Ok(Self { frames })
    }

    /// Slot used by the frame with the given counter value
    pub fn slot_index(&self, frame_counter: u64) -> usize {
        // The modulus is the slot count, so the result always fits
        (frame_counter % self.frames.len() as u64) as usize
    }

    /// Synchronization objects of `slot`
    ///
    /// # Panics
    /// Panics when `slot` is not below the frame count.
    pub fn frame(&self, slot: usize) -> &FrameSync {
        &self.frames[slot]
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether there are no slots
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessDevice, ObjectKind};

    #[test]
    fn test_sync_set_counts() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let device: DeviceRef = headless.clone();
        {
            let set = FrameSyncSet::new(&device, 3).unwrap();
            assert_eq!(set.len(), 3);
            assert_eq!(headless.live_count(ObjectKind::Fence), 3);
            assert_eq!(headless.live_count(ObjectKind::Semaphore), 6);
            assert!(set.frame(2).in_flight.is_signaled().unwrap());
        }
        assert_eq!(headless.total_live(), 0);
    }

    #[test]
    fn test_slot_index_wraps() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let device: DeviceRef = headless;
        let set = FrameSyncSet::new(&device, 2).unwrap();
        let slots: Vec<usize> = (0..5).map(|n| set.slot_index(n)).collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_zero_frames_rejected() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let device: DeviceRef = headless;
        assert!(matches!(
            FrameSyncSet::new(&device, 0),
            Err(RenderError::IllegalState { .. })
        ));
    }
}
