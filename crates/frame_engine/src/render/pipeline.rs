//! Backend-neutral pipeline handles
//!
//! Pipelines are built by the caller (see
//! [`GraphicsPipeline`](crate::render::backends::vulkan::GraphicsPipeline)) and
//! handed to the frame driver as plain handles.

use ash::vk;

/// Pipeline and the layout its descriptor sets are bound against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineBinding {
    /// Graphics pipeline
    pub pipeline: vk::Pipeline,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
}

impl PipelineBinding {
    /// Pair a pipeline with its layout
    pub fn new(pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> Self {
        Self { pipeline, layout }
    }
}
