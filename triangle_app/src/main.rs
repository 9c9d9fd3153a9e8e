//! Triangle demo application
//!
//! Draws one colored triangle through the frame driver. The tint is a
//! per-frame uniform written into the slot being recorded, and the
//! triangle's shape pulses through in-place vertex replacement.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use frame_engine::config::Config;
use frame_engine::core::ApplicationConfig;
use frame_engine::foundation::logging;
use frame_engine::render::backends::vulkan::{GraphicsPipeline, PipelineConfig, ShaderModule, VulkanDevice};
use frame_engine::render::{
    BindingManager, DeviceContext, DrawObject, FrameDriver, FrameOutcome, GlfwWindow, IndexBuffer, RenderError,
    VertexBuffer, VertexLayout,
};

const CONFIG_PATH: &str = "triangle.toml";
const SHADER_DIR: &str = env!("TRIANGLE_SHADER_DIR");
const TINT_BINDING: u32 = 0;
// Seconds between geometry updates
const PULSE_INTERVAL: f32 = 1.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

impl Vertex {
    fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Self>() as u32)
            .with_attribute(0, vk::Format::R32G32_SFLOAT, 0)
            .with_attribute(1, vk::Format::R32G32B32_SFLOAT, 8)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniform {
    tint: [f32; 4],
}

fn triangle(scale: f32) -> [Vertex; 3] {
    [
        Vertex {
            position: [0.0, -0.6 * scale],
            color: [1.0, 0.2, 0.2],
        },
        Vertex {
            position: [0.6 * scale, 0.5 * scale],
            color: [0.2, 1.0, 0.2],
        },
        Vertex {
            position: [-0.6 * scale, 0.5 * scale],
            color: [0.2, 0.2, 1.0],
        },
    ]
}

fn shader_path(name: &str) -> PathBuf {
    PathBuf::from(SHADER_DIR).join(name)
}

fn build_pipeline(
    vulkan: &Rc<VulkanDevice>,
    render_pass: vk::RenderPass,
    bindings: &BindingManager,
) -> Result<GraphicsPipeline, RenderError> {
    let vertex_shader = ShaderModule::from_file(vulkan, shader_path("triangle.vert.spv"))?;
    let fragment_shader = ShaderModule::from_file(vulkan, shader_path("triangle.frag.spv"))?;
    GraphicsPipeline::new(
        vulkan,
        render_pass,
        &[bindings.layout()?],
        &vertex_shader,
        &fragment_shader,
        &PipelineConfig::new(Vertex::layout()),
    )
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ApplicationConfig::load_validated(CONFIG_PATH)?;
    logging::init(&config.logging)?;
    log::info!("Starting {}", config.renderer.application_name);

    let mut window = GlfwWindow::new(&config.window)?;
    let (context, vulkan) = DeviceContext::create_vulkan(&mut window, &config.renderer)?;

    let vertices = Rc::new(VertexBuffer::from_vertices(&context, &triangle(1.0))?);
    let indices = Rc::new(IndexBuffer::new(&context, &[0u16, 1, 2])?);

    let mut bindings = context.binding_manager();
    bindings.declare_uniform(
        TINT_BINDING,
        vk::ShaderStageFlags::FRAGMENT,
        std::mem::size_of::<FrameUniform>() as vk::DeviceSize,
    )?;
    bindings.build()?;
    let bindings = Rc::new(bindings);

    let mut driver = FrameDriver::new(&context, &mut window, &config.renderer)?;
    let mut render_pass = driver.render_pass();
    let mut pipeline = build_pipeline(&vulkan, render_pass, &bindings)?;
    let mut object = driver.add_object(DrawObject {
        vertices: Rc::clone(&vertices),
        indices,
        bindings: Rc::clone(&bindings),
        pipeline: pipeline.binding(),
    });

    let start = Instant::now();
    let mut presented = 0u64;
    // Runs as a closure so the idle wait below also covers the error path
    let result = (|| -> Result<(), Box<dyn std::error::Error>> {
        let mut last_pulse = 0.0;
        while !driver.window().should_close() {
            driver.window_mut().poll_events();
            let time = start.elapsed().as_secs_f32();

            // The vertex buffer is shared by every slot, so wait for all of them
            if time - last_pulse >= PULSE_INTERVAL {
                last_pulse = time;
                context.wait_idle()?;
                vertices.replace_vertices(&triangle(0.75 + 0.25 * (time * 0.5).sin().abs()))?;
            }

            let tint = FrameUniform {
                tint: [0.6 + 0.4 * time.sin(), 0.6 + 0.4 * (time * 0.7).cos(), 1.0, 1.0],
            };
            let outcome = driver.draw_frame_with(|slot| bindings.update_uniform_pod(TINT_BINDING, slot, &tint));
            match outcome {
                Ok(FrameOutcome::Presented { .. }) => presented += 1,
                Ok(FrameOutcome::SurfaceRecreated | FrameOutcome::Skipped) => {}
                Err(e) if !e.is_fatal() => log::warn!("Frame dropped: {}", e),
                Err(e) => return Err(e.into()),
            }

            // A surface format change replaces the render pass
            if driver.render_pass() != render_pass {
                context.wait_idle()?;
                render_pass = driver.render_pass();
                pipeline = build_pipeline(&vulkan, render_pass, &bindings)?;
                driver.remove_object(object)?;
                object = driver.add_object(DrawObject {
                    vertices: Rc::clone(&vertices),
                    indices: Rc::new(IndexBuffer::new(&context, &[0u16, 1, 2])?),
                    bindings: Rc::clone(&bindings),
                    pipeline: pipeline.binding(),
                });
            }
        }
        Ok(())
    })();

    // The pipeline drops before the driver, so nothing may still be using it
    context.wait_idle()?;
    result?;
    log::info!("Presented {} frames in {:.1}s", presented, start.elapsed().as_secs_f32());
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        log::error!("Fatal error: {}", e);
        eprintln!("triangle_demo: {e}");
        std::process::exit(1);
    }
}
