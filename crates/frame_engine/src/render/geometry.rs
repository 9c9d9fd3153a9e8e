//! Vertex layouts and geometry buffers
//!
//! Vertex data is opaque bytes to the renderer. Its shape is described by a
//! [`VertexLayout`] handed to pipeline construction, so nothing here is tied
//! to a particular vertex struct.

use ash::vk;
use bytemuck::Pod;

use crate::render::allocator::Buffer;
use crate::render::context::DeviceContext;
use crate::render::error::{RenderError, RenderResult};

/// One shader input within a vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Shader `location`
    pub location: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Byte offset within the vertex
    pub offset: u32,
}

/// Data-driven description of one interleaved vertex stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    /// Bytes between consecutive vertices
    pub stride: u32,
    /// Attributes in declaration order
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Layout with no attributes yet
    pub fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute
    pub fn with_attribute(mut self, location: u32, format: vk::Format, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }

    /// Per-vertex binding 0
    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attribute descriptions on binding 0
    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                binding: 0,
                location: attribute.location,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect()
    }
}

/// Where an uploaded buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    /// Device-local memory, reachable only through transfers
    DeviceLocal,
    /// Host-visible memory that stays mapped for direct rewrites
    HostMapped,
}

/// Copy `data` into a new buffer through a staging buffer
fn upload(
    context: &DeviceContext,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    residency: Residency,
) -> RenderResult<Buffer> {
    if data.is_empty() {
        return Err(RenderError::illegal("geometry upload with no data"));
    }
    let size = data.len() as vk::DeviceSize;
    let usage = usage | vk::BufferUsageFlags::TRANSFER_DST;
    let staging = Buffer::staging(context.device(), data)?;
    let buffer = match residency {
        Residency::DeviceLocal => {
            Buffer::new(context.device(), size, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL)?
        }
        Residency::HostMapped => Buffer::new_mapped(context.device(), size, usage)?,
    };
    context.copy_buffer(staging.handle(), buffer.handle(), size)?;
    Ok(buffer)
}

/// Vertex bytes in GPU-visible memory
///
/// The allocation stays host mapped so animated geometry can be rewritten
/// in place with [`VertexBuffer::replace_contents`].
pub struct VertexBuffer {
    buffer: Buffer,
}

impl VertexBuffer {
    /// Upload raw vertex bytes
    pub fn new(context: &DeviceContext, data: &[u8]) -> RenderResult<Self> {
        let buffer = upload(context, data, vk::BufferUsageFlags::VERTEX_BUFFER, Residency::HostMapped)?;
        log::debug!("Uploaded vertex buffer ({} bytes)", data.len());
        Ok(Self { buffer })
    }

    /// Upload a slice of plain-old-data vertices
    pub fn from_vertices<T: Pod>(context: &DeviceContext, vertices: &[T]) -> RenderResult<Self> {
        Self::new(context, bytemuck::cast_slice(vertices))
    }

    /// Overwrite the start of the buffer without staging
    ///
    /// The buffer never grows; `data` longer than the original upload is
    /// rejected. Only safe once no in-flight frame reads the buffer.
    pub fn replace_contents(&self, data: &[u8]) -> RenderResult<()> {
        if data.len() as vk::DeviceSize > self.buffer.size() {
            return Err(RenderError::illegal(format!(
                "{} bytes replace a {} byte vertex buffer",
                data.len(),
                self.buffer.size()
            )));
        }
        self.buffer.write_bytes(0, data)
    }

    /// Typed form of [`Self::replace_contents`]
    pub fn replace_vertices<T: Pod>(&self, vertices: &[T]) -> RenderResult<()> {
        self.replace_contents(bytemuck::cast_slice(vertices))
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    /// Current contents
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.buffer.read_mapped()
    }
}

/// Integer types usable as indices
pub trait IndexElement: Pod {
    /// Matching Vulkan index type
    const INDEX_TYPE: vk::IndexType;
}

impl IndexElement for u16 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT16;
}

impl IndexElement for u32 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;
}

/// Index data in device-local memory
pub struct IndexBuffer {
    buffer: Buffer,
    index_type: vk::IndexType,
    index_count: u32,
}

impl IndexBuffer {
    /// Upload 16 or 32 bit indices
    pub fn new<I: IndexElement>(context: &DeviceContext, indices: &[I]) -> RenderResult<Self> {
        let index_count = u32::try_from(indices.len())
            .map_err(|_| RenderError::illegal("index count exceeds u32"))?;
        let buffer = upload(
            context,
            bytemuck::cast_slice(indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
            Residency::DeviceLocal,
        )?;
        log::debug!("Uploaded {} indices ({:?})", index_count, I::INDEX_TYPE);
        Ok(Self {
            buffer,
            index_type: I::INDEX_TYPE,
            index_count,
        })
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Width of each index
    pub fn index_type(&self) -> vk::IndexType {
        self.index_type
    }

    /// Number of indices drawn
    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessDevice, ObjectKind};
    use std::rc::Rc;

    fn context() -> (Rc<HeadlessDevice>, DeviceContext) {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let context = DeviceContext::new(headless.clone(), 2).unwrap();
        (headless, context)
    }

    #[test]
    fn test_layout_descriptions() {
        let layout = VertexLayout::new(20)
            .with_attribute(0, vk::Format::R32G32_SFLOAT, 0)
            .with_attribute(1, vk::Format::R32G32B32_SFLOAT, 8);

        assert_eq!(layout.binding_description().stride, 20);
        let attributes = layout.attribute_descriptions();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].offset, 8);
        assert!(attributes.iter().all(|a| a.binding == 0));
    }

    #[test]
    fn test_vertex_upload_goes_through_staging() {
        let (headless, context) = context();
        let vertices = [0.0f32, 0.5, 1.0, -0.5];
        let buffer = VertexBuffer::from_vertices(&context, &vertices).unwrap();

        assert_eq!(headless.submits().len(), 1);
        // Staging buffer released after the copy
        assert_eq!(headless.live_count(ObjectKind::Buffer), 1);
        assert_eq!(buffer.size(), 16);
        assert_eq!(
            headless.buffer_contents(buffer.handle()).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&vertices).to_vec()
        );
    }

    #[test]
    fn test_replace_contents_never_grows() {
        let (headless, context) = context();
        let buffer = VertexBuffer::new(&context, &[1; 8]).unwrap();

        buffer.replace_contents(&[2; 4]).unwrap();
        assert_eq!(buffer.contents().unwrap(), vec![2, 2, 2, 2, 1, 1, 1, 1]);

        let result = buffer.replace_contents(&[3; 9]);
        assert!(matches!(result, Err(RenderError::IllegalState { .. })));
        // Direct writes do not submit anything
        assert_eq!(headless.submits().len(), 1);
    }

    #[test]
    fn test_index_types() {
        let (_, context) = context();
        let short = IndexBuffer::new(&context, &[0u16, 1, 2]).unwrap();
        let wide = IndexBuffer::new(&context, &[0u32, 1, 2, 2, 3, 0]).unwrap();

        assert_eq!(short.index_type(), vk::IndexType::UINT16);
        assert_eq!(short.index_count(), 3);
        assert_eq!(wide.index_type(), vk::IndexType::UINT32);
        assert_eq!(wide.index_count(), 6);
    }

    #[test]
    fn test_index_buffer_is_device_local() {
        let (headless, context) = context();
        let indices = IndexBuffer::new(&context, &[0u16, 1, 2]).unwrap();

        assert!(!indices.buffer.is_mapped());
        assert_eq!(headless.submits().len(), 1);
        assert_eq!(
            headless.buffer_contents(indices.handle()).unwrap(),
            bytemuck::cast_slice::<u16, u8>(&[0, 1, 2]).to_vec()
        );
        // The vertex buffer keeps its mapping for in-place rewrites
        let vertices = VertexBuffer::new(&context, &[1; 8]).unwrap();
        assert!(vertices.buffer.is_mapped());
    }

    #[test]
    fn test_empty_upload_rejected() {
        let (headless, context) = context();
        assert!(matches!(
            VertexBuffer::new(&context, &[]),
            Err(RenderError::IllegalState { .. })
        ));
        assert_eq!(headless.live_count(ObjectKind::Buffer), 0);
    }
}
