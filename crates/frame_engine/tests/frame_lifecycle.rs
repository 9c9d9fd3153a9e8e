//! Per-slot write safety, minimized windows and teardown

mod common;

use ash::vk;
use std::cell::RefCell;
use std::rc::Rc;

use common::{draw_object, harness, harness_with_surface, EXTENT};
use frame_engine::core::RendererConfig;
use frame_engine::render::backends::headless::ObjectKind;
use frame_engine::render::backends::HeadlessDevice;
use frame_engine::render::{DeviceContext, FrameOutcome, RenderError, ScriptedSurface, VertexBuffer};

const MINIMIZED: vk::Extent2D = vk::Extent2D { width: 0, height: 0 };

#[test]
fn test_slot_updates_only_after_fence_signals() {
    let mut h = harness(&RendererConfig::default().with_max_frames_in_flight(3));
    h.headless.set_auto_retire(false);
    let object = draw_object(&h.context, &[0, 1, 2], 1);
    let bindings = Rc::clone(&object.bindings);
    h.driver.add_object(object);

    let fences: Vec<vk::Fence> = (0..3)
        .map(|slot| h.driver.sync().frame(slot).in_flight.handle())
        .collect();
    let written = RefCell::new(Vec::new());

    for frame in 0..9u32 {
        let headless = &h.headless;
        h.driver
            .draw_frame_with(|slot| {
                // The GPU may still be reading other slots, never this one
                assert!(!headless.is_fence_pending(fences[slot]));
                assert!(headless.pending_submissions() < 3);
                let value = [frame as f32; 4];
                bindings.update_uniform_pod(0, slot, &value)?;
                written.borrow_mut().push((slot, value));
                Ok(())
            })
            .unwrap();
    }

    // Slot instances are independent: each holds the last value written to it
    for (slot, value) in written.borrow().iter().rev().take(3) {
        let bytes = bindings.read_mapped(0, *slot).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<[f32; 4]>(&bytes), *value);
    }
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_update_error_leaves_slot_untouched() {
    let mut h = harness(&RendererConfig::default());
    let result = h
        .driver
        .draw_frame_with(|_| Err(RenderError::illegal("scene not ready")));

    assert!(matches!(result, Err(RenderError::IllegalState { .. })));
    assert_eq!(h.driver.frame_counter(), 0);
    assert!(h.headless.submits().is_empty());
    // Nothing was acquired, so the next frame proceeds normally
    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { slot: 0, .. }
    ));
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_minimized_without_pause_skips_frames() {
    let config = RendererConfig::default().with_pause_on_minimize(false);
    let mut h = harness(&config);
    h.driver.draw_frame().unwrap();

    h.driver.window_mut().replace_extents([MINIMIZED]);
    h.driver.window_mut().request_resize();
    for _ in 0..3 {
        assert_eq!(h.driver.draw_frame().unwrap(), FrameOutcome::Skipped);
        assert!(h.driver.is_resize_pending());
    }
    assert_eq!(h.driver.frame_counter(), 1);
    assert_eq!(h.headless.submits().len(), 1);
    assert_eq!(h.driver.swap_images().generation(), 1);

    let restored = vk::Extent2D {
        width: 640,
        height: 480,
    };
    h.headless.set_surface_extent(restored);
    h.driver.window_mut().replace_extents([restored]);
    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { recreated: true, .. }
    ));
    assert_eq!(h.driver.swap_images().extent(), restored);
    assert!(!h.driver.is_resize_pending());
    assert_eq!(h.driver.window().wait_count(), 0);
}

#[test]
fn test_stale_acquire_while_minimized_defers() {
    let config = RendererConfig::default().with_pause_on_minimize(false);
    let mut h = harness(&config);
    h.driver.window_mut().replace_extents([MINIMIZED]);
    h.headless.script_acquire(frame_engine::render::device::AcquireOutcome::OutOfDate);

    assert_eq!(h.driver.draw_frame().unwrap(), FrameOutcome::Skipped);
    assert!(h.driver.is_resize_pending());
    assert_eq!(h.driver.frame_counter(), 0);
}

#[test]
fn test_minimized_with_pause_waits_for_events() {
    let mut h = harness(&RendererConfig::default());
    h.driver
        .window_mut()
        .replace_extents([MINIMIZED, MINIMIZED, EXTENT]);
    h.driver.window_mut().request_resize();

    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { recreated: true, .. }
    ));
    assert_eq!(h.driver.window().wait_count(), 2);
    assert_eq!(h.driver.swap_images().generation(), 2);
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_initial_build_waits_for_visible_window() {
    let surface = ScriptedSurface::sequence([MINIMIZED, EXTENT]);
    let h = harness_with_surface(&RendererConfig::default(), surface);

    assert_eq!(h.driver.window().wait_count(), 1);
    assert_eq!(h.driver.swap_images().extent(), EXTENT);
}

#[test]
fn test_teardown_releases_every_object() {
    let headless = Rc::new(HeadlessDevice::new(EXTENT));
    headless.set_auto_retire(false);
    {
        let config = RendererConfig::default();
        let context = DeviceContext::new(headless.clone(), 2).unwrap();
        let mut driver =
            frame_engine::render::FrameDriver::new(&context, ScriptedSurface::fixed(EXTENT), &config).unwrap();
        driver.add_object(draw_object(&context, &[0, 1, 2], 1));
        driver.add_object(draw_object(&context, &[0, 1, 2, 2, 3, 0], 2));
        for _ in 0..4 {
            driver.draw_frame().unwrap();
        }
        assert!(headless.pending_submissions() > 0);
        assert!(headless.total_live() > 0);
    }

    assert_eq!(headless.total_live(), 0);
    assert_eq!(headless.pending_submissions(), 0);
    assert!(headless.violations().is_empty(), "{:?}", headless.violations());
}

#[test]
fn test_failed_upload_reports_transient_operation() {
    let h = harness(&RendererConfig::default());
    let buffers_before = h.headless.live_count(ObjectKind::Buffer);
    h.headless.inject_failure("queue_submit", 0);

    let result = VertexBuffer::new(&h.context, &[0; 32]);
    assert!(matches!(
        result,
        Err(RenderError::TransientOp {
            operation: "copy buffer",
            ..
        })
    ));
    assert_eq!(h.headless.live_count(ObjectKind::Buffer), buffers_before);
    assert_eq!(h.headless.live_count(ObjectKind::CommandBuffer), 2);
}

#[test]
fn test_zero_area_surface_is_not_fatal() {
    let config = RendererConfig::default().with_pause_on_minimize(false);
    let mut h = harness(&config);
    h.driver.draw_frame().unwrap();

    // The window still reports its size while the surface already reads 0x0
    h.headless.set_surface_extent(MINIMIZED);
    h.driver.notify_resize();
    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { recreated: false, .. }
    ));
    assert!(h.driver.is_resize_pending());
    assert_eq!(h.driver.swap_images().generation(), 1);

    h.headless.set_surface_extent(EXTENT);
    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { recreated: true, .. }
    ));
    assert!(!h.driver.is_resize_pending());
    assert_eq!(h.driver.swap_images().generation(), 2);
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}
