//! Descriptor set layouts, pools and writes
//!
//! Thin RAII layer the [`BindingManager`](crate::render::binding::BindingManager)
//! is built from. Layouts and pools own their handles; sets allocated from
//! a pool are released with it.

use ash::vk;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::render::device::{DescriptorResource, DescriptorWrite, DeviceRef};
use crate::render::error::RenderResult;

/// Descriptor set layout builder for creating reusable layouts
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single-descriptor binding
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &DeviceRef) -> RenderResult<DescriptorSetLayout> {
        let layout = device.create_descriptor_set_layout(&self.bindings)?;
        Ok(DescriptorSetLayout {
            device: Rc::clone(device),
            layout,
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    device: DeviceRef,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Get the descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Pool sizes for `sets` sets of this layout
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        // Keyed on the raw type so the order is deterministic
        let mut counts: BTreeMap<i32, u32> = BTreeMap::new();
        for binding in &self.bindings {
            *counts.entry(binding.descriptor_type.as_raw()).or_default() += binding.descriptor_count;
        }
        counts
            .into_iter()
            .map(|(ty, count)| vk::DescriptorPoolSize {
                ty: vk::DescriptorType::from_raw(ty),
                descriptor_count: count * sets,
            })
            .collect()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
    }
}

/// Descriptor pool for allocating descriptor sets
pub struct DescriptorPool {
    device: DeviceRef,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a pool for `max_sets` sets
    pub fn new(device: &DeviceRef, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> RenderResult<Self> {
        let pool = device.create_descriptor_pool(max_sets, sizes)?;
        Ok(Self {
            device: Rc::clone(device),
            pool,
        })
    }

    /// Allocate one set per layout
    pub fn allocate(&self, layouts: &[vk::DescriptorSetLayout]) -> RenderResult<Vec<vk::DescriptorSet>> {
        self.device.allocate_descriptor_sets(self.pool, layouts)
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
    }
}

/// Batches descriptor writes into one update call
#[derive(Default)]
pub struct DescriptorSetWriter {
    writes: Vec<DescriptorWrite>,
}

impl DescriptorSetWriter {
    /// Create a new descriptor set writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Point a buffer binding at `buffer[0..range]`
    pub fn write_buffer(
        mut self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) -> Self {
        self.writes.push(DescriptorWrite {
            set,
            binding,
            descriptor_type,
            resource: DescriptorResource::Buffer { buffer, range },
        });
        self
    }

    /// Point an image binding at a view, with a sampler when combined
    pub fn write_image(
        mut self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Self {
        self.writes.push(DescriptorWrite {
            set,
            binding,
            descriptor_type,
            resource: DescriptorResource::Image { view, sampler, layout },
        });
        self
    }

    /// Number of pending writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether there are no pending writes
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every pending write
    pub fn update(self, device: &DeviceRef) {
        if !self.writes.is_empty() {
            device.update_descriptor_sets(&self.writes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessDevice, ObjectKind};

    #[test]
    fn test_pool_sizes_aggregate_by_type() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let device: DeviceRef = headless.clone();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
            .add_binding(2, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT)
            .build(&device)
            .unwrap();

        let sizes = layout.pool_sizes(3);
        assert_eq!(sizes.len(), 2);
        let uniform = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 6);

        drop(layout);
        assert_eq!(headless.live_count(ObjectKind::DescriptorSetLayout), 0);
    }

    #[test]
    fn test_pool_respects_max_sets() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let device: DeviceRef = headless.clone();
        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .build(&device)
            .unwrap();
        let pool = DescriptorPool::new(&device, 2, &layout.pool_sizes(2)).unwrap();

        assert_eq!(pool.allocate(&[layout.handle(); 2]).unwrap().len(), 2);
        assert!(pool.allocate(&[layout.handle()]).is_err());

        drop(pool);
        assert_eq!(headless.live_count(ObjectKind::DescriptorSet), 0);
    }
}
