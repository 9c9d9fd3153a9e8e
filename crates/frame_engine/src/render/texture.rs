//! Textures, image views and samplers

use ash::vk;
use std::rc::Rc;

use crate::render::allocator::{Buffer, Image};
use crate::render::commands::TransientExecutor;
use crate::render::context::DeviceContext;
use crate::render::device::{DeviceRef, ImageDesc, SamplerDesc};
use crate::render::error::{RenderError, RenderResult};

/// Format of textures uploaded from 8-bit RGBA pixels
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// 2D color view with RAII cleanup
pub struct ImageView {
    device: DeviceRef,
    view: vk::ImageView,
}

impl ImageView {
    /// Create a color view of `image`
    pub fn new(device: &DeviceRef, image: vk::Image, format: vk::Format) -> RenderResult<Self> {
        let view = device.create_image_view(image, format)?;
        Ok(Self {
            device: Rc::clone(device),
            view,
        })
    }

    /// Get the view handle
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.device.destroy_image_view(self.view);
    }
}

/// Record and execute one supported layout transition
///
/// Only `UNDEFINED -> TRANSFER_DST_OPTIMAL` and
/// `TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL` are supported. `format`
/// is checked against the image's own format; a mismatch is reported and
/// the image's format is left as created.
pub fn transition_image_layout(
    transient: &TransientExecutor,
    image: &Image,
    format: vk::Format,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> RenderResult<()> {
    if format != image.format() {
        log::warn!(
            "Layout transition requested with format {:?} for an image created as {:?}",
            format,
            image.format()
        );
    }

    let (access, stages) = match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            (vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE),
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER),
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            (vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::SHADER_READ),
            (vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::FRAGMENT_SHADER),
        ),
        (old, new) => {
            return Err(RenderError::illegal(format!(
                "unsupported layout transition {old:?} -> {new:?}"
            )))
        }
    };

    let handle = image.handle();
    transient.execute("layout transition", |recorder| {
        recorder.image_barrier(handle, (old_layout, new_layout), access, stages)
    })
}

/// Device-local image with a view
pub struct Texture {
    view: ImageView,
    image: Image,
}

impl Texture {
    /// Create an image and view without uploading anything
    ///
    /// The image is left in `UNDEFINED` layout.
    pub fn new(context: &DeviceContext, desc: ImageDesc) -> RenderResult<Self> {
        let image = Image::new(context.device(), desc)?;
        let view = ImageView::new(context.device(), image.handle(), desc.format)?;
        Ok(Self { view, image })
    }

    /// Upload tightly packed RGBA8 pixels into a sampled sRGB texture
    pub fn from_rgba8(context: &DeviceContext, extent: vk::Extent2D, pixels: &[u8]) -> RenderResult<Self> {
        let expected = u64::from(extent.width) * u64::from(extent.height) * 4;
        if extent.width == 0 || extent.height == 0 || pixels.len() as u64 != expected {
            return Err(RenderError::illegal(format!(
                "{} bytes of pixel data for a {}x{} RGBA texture",
                pixels.len(),
                extent.width,
                extent.height
            )));
        }

        let staging = Buffer::staging(context.device(), pixels)?;
        let image = Image::new(
            context.device(),
            ImageDesc {
                extent,
                format: TEXTURE_FORMAT,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            },
        )?;

        let transient = context.transient();
        transition_image_layout(
            transient,
            &image,
            TEXTURE_FORMAT,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        transient.copy_buffer_to_image(staging.handle(), image.handle(), extent)?;
        transition_image_layout(
            transient,
            &image,
            TEXTURE_FORMAT,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let view = ImageView::new(context.device(), image.handle(), TEXTURE_FORMAT)?;
        log::debug!("Uploaded {}x{} texture", extent.width, extent.height);
        Ok(Self { view, image })
    }

    /// Image view bound in descriptors
    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    /// Underlying image
    pub fn image(&self) -> &Image {
        &self.image
    }
}

/// Sampler parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    /// Magnification and minification filter
    pub filter: vk::Filter,
    /// Address mode on every axis
    pub address_mode: vk::SamplerAddressMode,
    /// Enable anisotropic filtering when the device supports it
    pub anisotropy: bool,
    /// Depth comparison, used for shadow maps
    pub compare_op: Option<vk::CompareOp>,
    /// Filtering between mip levels
    pub mipmap_mode: vk::SamplerMipmapMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: true,
            compare_op: None,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        }
    }
}

impl SamplerConfig {
    /// Nearest filtering for pixel art
    pub fn nearest() -> Self {
        Self {
            filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Self::default()
        }
    }

    fn desc(&self) -> SamplerDesc {
        SamplerDesc {
            mag_filter: self.filter,
            min_filter: self.filter,
            address_mode: self.address_mode,
            // Clamped to the device limit by the backend
            max_anisotropy: self.anisotropy.then_some(16.0),
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            unnormalized_coordinates: false,
            compare_op: self.compare_op,
            mipmap_mode: self.mipmap_mode,
            mip_lod_bias: 0.0,
            lod_range: (0.0, 0.0),
        }
    }
}

/// Sampler wrapper with RAII cleanup
pub struct Sampler {
    device: DeviceRef,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Create a sampler
    pub fn new(device: &DeviceRef, config: &SamplerConfig) -> RenderResult<Self> {
        let sampler = device.create_sampler(&config.desc())?;
        Ok(Self {
            device: Rc::clone(device),
            sampler,
        })
    }

    /// Get the sampler handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.sampler);
    }
}
