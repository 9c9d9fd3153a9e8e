//! Shared fixtures for frame scenario tests

#![allow(dead_code)]

use ash::vk;
use ash::vk::Handle;
use std::rc::Rc;

use frame_engine::core::RendererConfig;
use frame_engine::render::backends::HeadlessDevice;
use frame_engine::render::{
    BindingManager, DeviceContext, DrawObject, FrameDriver, IndexBuffer, PipelineBinding, ScriptedSurface,
    VertexBuffer,
};

pub const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

pub struct Harness {
    pub headless: Rc<HeadlessDevice>,
    pub context: DeviceContext,
    pub driver: FrameDriver<ScriptedSurface>,
}

pub fn harness(config: &RendererConfig) -> Harness {
    harness_with_surface(config, ScriptedSurface::fixed(EXTENT))
}

pub fn harness_with_surface(config: &RendererConfig, surface: ScriptedSurface) -> Harness {
    let headless = Rc::new(HeadlessDevice::new(EXTENT));
    let context = DeviceContext::new(headless.clone(), config.max_frames_in_flight).unwrap();
    let driver = FrameDriver::new(&context, surface, config).unwrap();
    Harness {
        headless,
        context,
        driver,
    }
}

/// Pipeline handles the headless device never dereferences
pub fn fake_pipeline(id: u64) -> PipelineBinding {
    PipelineBinding::new(vk::Pipeline::from_raw(0xF000 + id), vk::PipelineLayout::from_raw(0xE000 + id))
}

/// Built manager with a 16-byte uniform at binding 0
pub fn uniform_bindings(context: &DeviceContext) -> Rc<BindingManager> {
    let mut bindings = context.binding_manager();
    bindings
        .declare_uniform(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT, 16)
        .unwrap();
    bindings.build().unwrap();
    Rc::new(bindings)
}

/// Indexed quad or triangle with its own bindings
pub fn draw_object(context: &DeviceContext, indices: &[u32], pipeline: u64) -> DrawObject {
    let vertices: [f32; 8] = [-0.5, -0.5, 0.5, -0.5, 0.5, 0.5, -0.5, 0.5];
    DrawObject {
        vertices: Rc::new(VertexBuffer::from_vertices(context, &vertices).unwrap()),
        indices: Rc::new(IndexBuffer::new(context, indices).unwrap()),
        bindings: uniform_bindings(context),
        pipeline: fake_pipeline(pipeline),
    }
}
