//! Per-frame protocol scenarios on the headless device

mod common;

use ash::vk;

use common::{draw_object, harness, EXTENT};
use frame_engine::core::RendererConfig;
use frame_engine::render::backends::headless::{DeviceCall, ObjectKind, RecordedCommand};
use frame_engine::render::device::{AcquireOutcome, PresentOutcome, QueueKind};
use frame_engine::render::FrameOutcome;

#[test]
fn test_per_slot_objects_exist() {
    let h = harness(&RendererConfig::default().with_max_frames_in_flight(3));

    assert_eq!(h.driver.frames_in_flight(), 3);
    assert_eq!(h.headless.live_count(ObjectKind::CommandBuffer), 3);
    assert_eq!(h.headless.live_count(ObjectKind::Fence), 3);
    assert_eq!(h.headless.live_count(ObjectKind::Semaphore), 6);
    assert_eq!(h.driver.command_buffers().len(), 3);
}

#[test]
fn test_slots_cycle_through_frames() {
    let mut h = harness(&RendererConfig::default());

    let slots: Vec<usize> = (0..5)
        .map(|_| match h.driver.draw_frame().unwrap() {
            FrameOutcome::Presented { slot, recreated, .. } => {
                assert!(!recreated);
                slot
            }
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();

    assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    assert_eq!(h.driver.frame_counter(), 5);
    assert_eq!(h.driver.current_slot(), 1);
    assert_eq!(h.headless.presents().len(), 5);
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_submit_and_present_use_slot_sync() {
    let mut h = harness(&RendererConfig::default());
    h.driver.draw_frame().unwrap();
    h.driver.draw_frame().unwrap();

    let submits = h.headless.submits();
    let presents = h.headless.presents();
    for (slot, (submit, present)) in submits.iter().zip(&presents).enumerate() {
        let frame = h.driver.sync().frame(slot);
        assert_eq!(submit.queue, QueueKind::Graphics);
        assert_eq!(submit.command_buffers, vec![h.driver.command_buffers().buffer(slot)]);
        assert_eq!(submit.wait_semaphores, vec![frame.image_available.handle()]);
        assert_eq!(submit.wait_stages, vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]);
        assert_eq!(submit.signal_semaphores, vec![frame.render_finished.handle()]);
        assert_eq!(submit.fence, frame.in_flight.handle());
        assert_eq!(present.wait_semaphore, frame.render_finished.handle());
    }
}

#[test]
fn test_call_order_within_a_frame() {
    let mut h = harness(&RendererConfig::default());
    h.driver.draw_frame().unwrap();

    let fence = h.driver.sync().frame(0).in_flight.handle();
    let calls = h.headless.calls();
    let position = |wanted: &dyn Fn(&DeviceCall) -> bool| calls.iter().position(|c| wanted(c)).unwrap();

    let wait = position(&|c| *c == DeviceCall::WaitFence(fence));
    let acquire = position(&|c| matches!(c, DeviceCall::Acquire(_)));
    let reset = position(&|c| *c == DeviceCall::ResetFence(fence));
    let submit = position(&|c| matches!(c, DeviceCall::Submit { fence: f, .. } if *f == fence));
    let present = position(&|c| matches!(c, DeviceCall::Present(_)));
    let idle = position(&|c| *c == DeviceCall::QueueWaitIdle(QueueKind::Present));

    assert!(wait < acquire);
    assert!(acquire < reset);
    assert!(reset < submit);
    assert!(submit < present);
    assert!(present < idle);
}

#[test]
fn test_stale_acquire_recreates_without_advancing() {
    let mut h = harness(&RendererConfig::default());
    let old_swapchain = h.driver.swap_images().handle();
    h.headless.script_acquire(AcquireOutcome::OutOfDate);

    assert_eq!(h.driver.draw_frame().unwrap(), FrameOutcome::SurfaceRecreated);
    assert_eq!(h.driver.frame_counter(), 0);
    assert_eq!(h.driver.swap_images().generation(), 2);
    assert!(h.headless.submits().is_empty());
    // The fence was never reset, so the next wait cannot hang
    assert!(!h
        .headless
        .calls()
        .iter()
        .any(|c| matches!(c, DeviceCall::ResetFence(_))));
    assert!(!h.headless.is_live(ObjectKind::Swapchain, vk::Handle::as_raw(old_swapchain)));

    match h.driver.draw_frame().unwrap() {
        FrameOutcome::Presented { slot, .. } => assert_eq!(slot, 0),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_stale_present_advances_then_recreates() {
    let mut h = harness(&RendererConfig::default());
    h.headless.script_present(PresentOutcome::OutOfDate);

    match h.driver.draw_frame().unwrap() {
        FrameOutcome::Presented { slot, recreated, .. } => {
            assert_eq!(slot, 0);
            assert!(recreated);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.driver.frame_counter(), 1);
    assert_eq!(h.driver.swap_images().generation(), 2);
    assert!(h.headless.calls().contains(&DeviceCall::WaitIdle));
}

#[test]
fn test_suboptimal_present_recreates() {
    let mut h = harness(&RendererConfig::default());
    h.headless.script_present(PresentOutcome::Suboptimal);

    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { recreated: true, .. }
    ));
}

#[test]
fn test_suboptimal_acquire_still_draws() {
    let mut h = harness(&RendererConfig::default());
    h.headless.script_acquire(AcquireOutcome::Acquired {
        image_index: 1,
        suboptimal: true,
    });

    assert_eq!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented {
            slot: 0,
            image_index: 1,
            recreated: false
        }
    );
    assert_eq!(h.driver.swap_images().generation(), 1);
}

#[test]
fn test_resize_request_rebuilds_swap_images() {
    let mut h = harness(&RendererConfig::default());
    h.driver.draw_frame().unwrap();
    let old_swapchain = h.driver.swap_images().handle();
    let old_framebuffers = h.driver.swap_images().framebuffers().to_vec();

    let resized = vk::Extent2D {
        width: 1024,
        height: 768,
    };
    h.headless.set_surface_extent(resized);
    h.driver.window_mut().replace_extents([resized]);
    h.driver.window_mut().request_resize();

    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { recreated: true, .. }
    ));
    let swap_images = h.driver.swap_images();
    assert_eq!(swap_images.extent(), resized);
    assert!(!h.driver.is_resize_pending());

    let desc = h.headless.swapchain_desc(swap_images.handle()).unwrap();
    assert_eq!(desc.old_swapchain, old_swapchain);
    assert!(!h.headless.is_live(ObjectKind::Swapchain, vk::Handle::as_raw(old_swapchain)));
    for framebuffer in old_framebuffers {
        assert!(!h.headless.is_live(ObjectKind::Framebuffer, vk::Handle::as_raw(framebuffer)));
    }
    assert_eq!(h.headless.live_count(ObjectKind::Framebuffer), swap_images.image_count());
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_notify_resize_sets_pending_flag() {
    let mut h = harness(&RendererConfig::default());
    h.driver.notify_resize();
    assert!(h.driver.is_resize_pending());

    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { recreated: true, .. }
    ));
    assert!(!h.driver.is_resize_pending());
    // Same extent, same format: the render pass survives
    assert_eq!(h.headless.live_count(ObjectKind::RenderPass), 1);
}

#[test]
fn test_objects_drawn_in_registration_order() {
    let mut h = harness(&RendererConfig::default());
    let first = draw_object(&h.context, &[0, 1, 2], 1);
    let second = draw_object(&h.context, &[0, 1, 2, 2, 3, 0], 2);
    let second_set = second.bindings.descriptor_set(0).unwrap();
    assert_eq!(h.driver.add_object(first), 0);
    assert_eq!(h.driver.add_object(second), 1);

    h.driver.draw_frame().unwrap();
    let commands = h.headless.recorded_commands(h.driver.command_buffers().buffer(0));

    let draws: Vec<u32> = commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::DrawIndexed(count) => Some(*count),
            _ => None,
        })
        .collect();
    assert_eq!(draws, vec![3, 6]);
    assert!(commands.contains(&RecordedCommand::BindDescriptorSets(vec![second_set])));
    assert!(matches!(
        commands.first(),
        Some(RecordedCommand::BeginRenderPass { extent, .. }) if *extent == EXTENT
    ));
    assert_eq!(commands.last(), Some(&RecordedCommand::EndRenderPass));
    assert!(commands.contains(&RecordedCommand::SetScissor(EXTENT)));
}

#[test]
fn test_each_slot_binds_its_own_set() {
    let mut h = harness(&RendererConfig::default());
    let object = draw_object(&h.context, &[0, 1, 2], 1);
    let sets = [
        object.bindings.descriptor_set(0).unwrap(),
        object.bindings.descriptor_set(1).unwrap(),
    ];
    assert_ne!(sets[0], sets[1]);
    h.driver.add_object(object);

    h.driver.draw_frame().unwrap();
    h.driver.draw_frame().unwrap();
    for (slot, set) in sets.iter().enumerate() {
        let commands = h.headless.recorded_commands(h.driver.command_buffers().buffer(slot));
        assert!(commands.contains(&RecordedCommand::BindDescriptorSets(vec![*set])));
    }
}

#[test]
fn test_removed_object_outlives_in_flight_frames() {
    let mut h = harness(&RendererConfig::default());
    h.headless.set_auto_retire(false);
    let index = h.driver.add_object(draw_object(&h.context, &[0, 1, 2], 1));
    // Vertex, index and one uniform per slot
    assert_eq!(h.headless.live_count(ObjectKind::Buffer), 4);

    h.driver.draw_frame().unwrap();
    h.driver.remove_object(index).unwrap();
    assert_eq!(h.driver.object_count(), 0);
    assert!(h.driver.remove_object(0).is_err());

    // Frame 0 may still be executing
    h.driver.draw_frame().unwrap();
    assert_eq!(h.headless.live_count(ObjectKind::Buffer), 4);

    // Waiting on slot 0 retires frame 0, the last one that drew the object
    h.driver.draw_frame().unwrap();
    assert_eq!(h.headless.live_count(ObjectKind::Buffer), 0);
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_five_frames_with_uniform_writes() {
    let mut h = harness(&RendererConfig::default());
    let object = draw_object(&h.context, &[0, 1, 2], 1);
    let bindings = std::rc::Rc::clone(&object.bindings);
    h.driver.add_object(object);

    let mut slots = Vec::new();
    for frame in 0..5u8 {
        let pattern = [frame + 1; 16];
        let outcome = h
            .driver
            .draw_frame_with(|slot| bindings.update_uniform(0, slot, &pattern, 0))
            .unwrap();
        match outcome {
            FrameOutcome::Presented { slot, .. } => slots.push(slot),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    assert_eq!(h.headless.presents().len(), 5);
    // Frames 4 and 3 were the last to use slots 0 and 1
    assert_eq!(bindings.read_mapped(0, 0).unwrap(), vec![5; 16]);
    assert_eq!(bindings.read_mapped(0, 1).unwrap(), vec![4; 16]);
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}

#[test]
fn test_batch_registration_and_lookup() {
    let mut h = harness(&RendererConfig::default());
    let single = draw_object(&h.context, &[0, 1, 2], 1);
    assert_eq!(h.driver.add_object(single), 0);

    let batch = vec![
        draw_object(&h.context, &[0, 1, 2, 2, 3, 0], 2),
        draw_object(&h.context, &[0, 1, 2], 3),
    ];
    assert_eq!(h.driver.add_objects(batch), 1);
    assert_eq!(h.driver.object_count(), 3);
    assert_eq!(h.driver.object(1).unwrap().indices.index_count(), 6);
    assert_eq!(h.driver.object(2).unwrap().pipeline, common::fake_pipeline(3));
    assert!(h.driver.object(3).is_err());

    h.driver.draw_frame().unwrap();
    let draws = h
        .headless
        .recorded_commands(h.driver.command_buffers().buffer(0))
        .iter()
        .filter(|c| matches!(c, RecordedCommand::DrawIndexed(_)))
        .count();
    assert_eq!(draws, 3);
}

#[test]
fn test_acquire_timeout_skips_frame() {
    let mut h = harness(&RendererConfig::default());
    h.headless.script_acquire(AcquireOutcome::NotReady);

    assert_eq!(h.driver.draw_frame().unwrap(), FrameOutcome::Skipped);
    assert_eq!(h.driver.frame_counter(), 0);
    assert!(h.headless.submits().is_empty());
    assert!(!h
        .headless
        .calls()
        .iter()
        .any(|c| matches!(c, DeviceCall::ResetFence(_))));
    assert_eq!(h.driver.swap_images().generation(), 1);

    // The slot's fence is still signaled, so the retry goes through
    assert!(matches!(
        h.driver.draw_frame().unwrap(),
        FrameOutcome::Presented { slot: 0, .. }
    ));
    assert!(h.headless.violations().is_empty(), "{:?}", h.headless.violations());
}
