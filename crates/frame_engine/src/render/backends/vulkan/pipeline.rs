//! Shader modules and graphics pipelines
//!
//! Pipelines are built from a data-driven [`VertexLayout`] so the render
//! path never depends on a particular vertex struct. Viewport and scissor
//! are dynamic state, which keeps pipelines valid across swap image set
//! recreation.

use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::rc::Rc;

use super::device::VulkanDevice;
use crate::render::error::{resource, RenderError, RenderResult};
use crate::render::geometry::VertexLayout;
use crate::render::pipeline::PipelineBinding;

const ENTRY_POINT: &CStr = c"main";

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Rc<VulkanDevice>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytecode
    pub fn from_bytes(device: &Rc<VulkanDevice>, bytes: &[u8]) -> RenderResult<Self> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
            .map_err(|e| RenderError::InitializationFailed(format!("Invalid SPIR-V: {e}")))?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe {
            device
                .raw()
                .create_shader_module(&create_info, None)
                .map_err(resource("create shader module"))?
        };

        Ok(Self {
            device: Rc::clone(device),
            module,
        })
    }

    /// Load a shader from a SPIR-V file
    pub fn from_file<P: AsRef<Path>>(device: &Rc<VulkanDevice>, path: P) -> RenderResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            RenderError::InitializationFailed(format!("Failed to read shader {}: {e}", path.display()))
        })?;
        Self::from_bytes(device, &bytes)
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    fn stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_shader_module(self.module, None);
        }
    }
}

/// Fixed-function state of a graphics pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Vertex input layout
    pub vertex_layout: VertexLayout,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Winding of front faces
    pub front_face: vk::FrontFace,
    /// Fill mode
    pub polygon_mode: vk::PolygonMode,
}

impl PipelineConfig {
    /// Filled triangle lists with no culling
    pub fn new(vertex_layout: VertexLayout) -> Self {
        Self {
            vertex_layout,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            polygon_mode: vk::PolygonMode::FILL,
        }
    }
}

/// Graphics pipeline wrapper with RAII cleanup
pub struct GraphicsPipeline {
    device: Rc<VulkanDevice>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Build a pipeline for subpass 0 of `render_pass`
    pub fn new(
        device: &Rc<VulkanDevice>,
        render_pass: vk::RenderPass,
        set_layouts: &[vk::DescriptorSetLayout],
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
        config: &PipelineConfig,
    ) -> RenderResult<Self> {
        let raw = device.raw();

        let shader_stages = [
            vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX),
            fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let bindings = [config.vertex_layout.binding_description()];
        let attributes = config.vertex_layout.attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(config.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .line_width(1.0)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = unsafe {
            raw.create_pipeline_layout(&layout_info, None)
                .map_err(resource("create pipeline layout"))?
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            raw.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, result)) => {
                unsafe { raw.destroy_pipeline_layout(layout, None) };
                return Err(RenderError::GraphicsResource {
                    operation: "create graphics pipeline",
                    result,
                });
            }
        };

        log::debug!(
            "Created graphics pipeline ({} vertex attributes, stride {})",
            attributes.len(),
            config.vertex_layout.stride
        );

        Ok(Self {
            device: Rc::clone(device),
            pipeline,
            layout,
        })
    }

    /// Handles the frame driver binds at record time
    pub fn binding(&self) -> PipelineBinding {
        PipelineBinding {
            pipeline: self.pipeline,
            layout: self.layout,
        }
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_pipeline(self.pipeline, None);
            self.device.raw().destroy_pipeline_layout(self.layout, None);
        }
    }
}
