//! Buffer and image allocation
//!
//! Every device-memory-backed resource goes through here: create the
//! handle, query its requirements, pick a memory type, allocate and bind.
//! A failure at any step releases what was already created, so callers
//! never see a half-built resource.

use ash::vk;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::render::device::{DeviceRef, ImageDesc};
use crate::render::error::{RenderError, RenderResult};

/// Find a memory type allowed by `type_filter` with all `required` flags
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RenderError::NoSuitableMemoryType)
}

fn allocate_bound(
    device: &DeviceRef,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    bind: impl FnOnce(vk::DeviceMemory) -> RenderResult<()>,
) -> RenderResult<vk::DeviceMemory> {
    let memory_type = find_memory_type(
        &device.memory_properties(),
        requirements.memory_type_bits,
        properties,
    )?;
    let memory = device.allocate_memory(requirements.size, memory_type)?;
    if let Err(err) = bind(memory) {
        device.free_memory(memory);
        return Err(err);
    }
    Ok(memory)
}

/// Buffer with its own device memory allocation
pub struct Buffer {
    device: DeviceRef,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

impl Buffer {
    /// Create a buffer with memory of the given properties bound to it
    pub fn new(
        device: &DeviceRef,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Self> {
        let buffer = device.create_buffer(size, usage)?;
        let requirements = device.buffer_memory_requirements(buffer);
        let memory = match allocate_bound(device, requirements, properties, |memory| {
            device.bind_buffer_memory(buffer, memory)
        }) {
            Ok(memory) => memory,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err);
            }
        };

        Ok(Self {
            device: Rc::clone(device),
            buffer,
            memory,
            size,
            mapped: None,
        })
    }

    /// Create a host-visible, coherent buffer that stays mapped until drop
    pub fn new_mapped(
        device: &DeviceRef,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<Self> {
        let mut buffer = Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let ptr = device.map_memory(buffer.memory, size)?;
        buffer.mapped = NonNull::new(ptr);
        if buffer.mapped.is_none() {
            return Err(RenderError::GraphicsResource {
                operation: "map memory",
                result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            });
        }
        Ok(buffer)
    }

    /// Create a host-visible staging buffer holding `data`
    pub fn staging(device: &DeviceRef, data: &[u8]) -> RenderResult<Self> {
        let buffer = Self::new(
            device,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write_bytes(0, data)?;
        Ok(buffer)
    }

    /// Copy `data` into host-visible memory at `offset`
    ///
    /// Uses the persistent mapping when there is one, otherwise maps for the
    /// duration of the copy.
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> RenderResult<()> {
        offset
            .checked_add(data.len() as vk::DeviceSize)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                RenderError::illegal(format!(
                    "write of {} bytes at offset {} exceeds buffer size {}",
                    data.len(),
                    offset,
                    self.size
                ))
            })?;
        let offset = usize::try_from(offset)
            .map_err(|_| RenderError::illegal("buffer offset does not fit in host memory"))?;

        match self.mapped {
            Some(base) => unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(offset), data.len());
            },
            None => {
                let base = self.device.map_memory(self.memory, self.size)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len());
                }
                self.device.unmap_memory(self.memory);
            }
        }
        Ok(())
    }

    /// Copy of the persistently mapped contents
    pub fn read_mapped(&self) -> Option<Vec<u8>> {
        let base = self.mapped?;
        let len = usize::try_from(self.size).ok()?;
        let bytes = unsafe { std::slice::from_raw_parts(base.as_ptr(), len) };
        Some(bytes.to_vec())
    }

    /// Whether the buffer is persistently mapped
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Backing memory
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Requested size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.mapped.take().is_some() {
            self.device.unmap_memory(self.memory);
        }
        self.device.destroy_buffer(self.buffer);
        self.device.free_memory(self.memory);
    }
}

/// Device-local 2D image with its own memory
pub struct Image {
    device: DeviceRef,
    image: vk::Image,
    memory: vk::DeviceMemory,
    desc: ImageDesc,
}

impl Image {
    /// Create an optimal-tiling image backed by device-local memory
    pub fn new(device: &DeviceRef, desc: ImageDesc) -> RenderResult<Self> {
        let image = device.create_image(&desc)?;
        let requirements = device.image_memory_requirements(image);
        let memory = match allocate_bound(
            device,
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            |memory| device.bind_image_memory(image, memory),
        ) {
            Ok(memory) => memory,
            Err(err) => {
                device.destroy_image(image);
                return Err(err);
            }
        };

        Ok(Self {
            device: Rc::clone(device),
            image,
            memory,
            desc,
        })
    }

    /// Get image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Format the image was created with
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Extent in pixels
    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.device.destroy_image(self.image);
        self.device.free_memory(self.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessDevice, ObjectKind, HOST_VISIBLE_TYPE};

    fn device() -> (Rc<HeadlessDevice>, DeviceRef) {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 64, height: 64 }));
        let device: DeviceRef = headless.clone();
        (headless, device)
    }

    #[test]
    fn test_find_memory_type() {
        let (_, device) = device();
        let properties = device.memory_properties();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&properties, 0b11, host).unwrap(), HOST_VISIBLE_TYPE);
        assert!(matches!(
            find_memory_type(&properties, 0b01, host),
            Err(RenderError::NoSuitableMemoryType)
        ));
    }

    #[test]
    fn test_mapped_write_roundtrip() {
        let (headless, device) = device();
        let buffer = Buffer::new_mapped(&device, 16, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        buffer.write_bytes(4, &[1, 2, 3, 4]).unwrap();

        let contents = buffer.read_mapped().unwrap();
        assert_eq!(&contents[..8], &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(
            &headless.buffer_contents(buffer.handle()).unwrap()[4..8],
            &[1, 2, 3, 4]
        );
    }

    #[test]
    fn test_oversized_write_rejected() {
        let (_, device) = device();
        let buffer = Buffer::new_mapped(&device, 8, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        assert!(matches!(
            buffer.write_bytes(4, &[0; 8]),
            Err(RenderError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_failed_bind_releases_everything() {
        let (headless, device) = device();
        headless.inject_failure("bind_buffer_memory", 0);
        let result = Buffer::new(
            &device,
            64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert!(result.is_err());
        assert_eq!(headless.live_count(ObjectKind::Buffer), 0);
        assert_eq!(headless.live_count(ObjectKind::Memory), 0);
        assert!(headless.violations().is_empty());
    }

    #[test]
    fn test_drop_unmaps_and_frees() {
        let (headless, device) = device();
        {
            let _buffer = Buffer::new_mapped(&device, 32, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
            assert_eq!(headless.live_count(ObjectKind::Memory), 1);
        }
        assert_eq!(headless.total_live(), 0);
        assert!(headless.violations().is_empty());
    }
}
