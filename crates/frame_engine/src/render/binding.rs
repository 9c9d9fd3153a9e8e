//! Resource binding manager
//!
//! Maps logical bindings (an index plus a resource kind) onto one physical
//! resource instance per frame slot. Use is two-phase:
//!
//! 1. Declare bindings with the `declare_*` methods.
//! 2. Call [`BindingManager::build`] once. It allocates F persistently
//!    mapped buffers per uniform or storage binding, one layout, one pool
//!    and F descriptor sets, and writes every set.
//!
//! After the build, per-slot buffers are updated through host mappings.
//! Writing slot `s` is only safe once slot `s`'s fence has signaled; the
//! frame driver's update callback runs at exactly that point. Nothing here
//! checks it.

use ash::vk;
use bytemuck::Pod;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::render::allocator::Buffer;
use crate::render::descriptor::{
    DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetWriter,
};
use crate::render::device::DeviceRef;
use crate::render::error::{RenderError, RenderResult};
use crate::render::texture::{Sampler, Texture};

/// What a binding refers to
#[derive(Clone)]
pub enum BindingKind {
    /// Per-slot host-mapped uniform buffer
    UniformBuffer {
        /// Size in bytes
        size: vk::DeviceSize,
    },
    /// Per-slot host-mapped storage buffer
    StorageBuffer {
        /// Size in bytes
        size: vk::DeviceSize,
    },
    /// Sampled texture, shared by every slot
    CombinedImageSampler {
        /// Texture in `SHADER_READ_ONLY_OPTIMAL`
        texture: Rc<Texture>,
        /// Sampler
        sampler: Rc<Sampler>,
    },
    /// Storage image, shared by every slot
    StorageImage {
        /// Image created with storage usage, in `GENERAL` layout when used
        texture: Rc<Texture>,
    },
    /// Buffer owned elsewhere, shared by every slot
    ExternalBuffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Bound range in bytes
        size: vk::DeviceSize,
        /// `UNIFORM_BUFFER` or `STORAGE_BUFFER`
        descriptor_type: vk::DescriptorType,
    },
}

impl BindingKind {
    /// Descriptor type written for this binding
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            Self::CombinedImageSampler { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            Self::ExternalBuffer { descriptor_type, .. } => *descriptor_type,
        }
    }

    fn owned_buffer(&self) -> Option<(vk::DeviceSize, vk::BufferUsageFlags)> {
        match self {
            Self::UniformBuffer { size } => Some((*size, vk::BufferUsageFlags::UNIFORM_BUFFER)),
            Self::StorageBuffer { size } => Some((*size, vk::BufferUsageFlags::STORAGE_BUFFER)),
            _ => None,
        }
    }
}

/// One declared binding
#[derive(Clone)]
pub struct BindingDecl {
    /// Binding index in the set
    pub binding: u32,
    /// Shader stages that see the binding
    pub stages: vk::ShaderStageFlags,
    /// Resource kind
    pub kind: BindingKind,
}

struct BuiltBindings {
    sets: Vec<vk::DescriptorSet>,
    buffers: BTreeMap<u32, Vec<Buffer>>,
    pool: DescriptorPool,
    layout: DescriptorSetLayout,
}

/// Per-slot resources behind a descriptor set layout
pub struct BindingManager {
    device: DeviceRef,
    frames_in_flight: usize,
    declarations: Vec<BindingDecl>,
    built: Option<BuiltBindings>,
    // Sampled images swapped in per slot after the build
    image_overrides: RefCell<BTreeMap<(u32, usize), (Rc<Texture>, Rc<Sampler>)>>,
}

impl BindingManager {
    /// Empty manager for `frames_in_flight` slots
    pub fn new(device: &DeviceRef, frames_in_flight: usize) -> Self {
        Self {
            device: Rc::clone(device),
            frames_in_flight,
            declarations: Vec::new(),
            built: None,
            image_overrides: RefCell::new(BTreeMap::new()),
        }
    }

    /// Declare a binding
    pub fn declare(&mut self, binding: u32, stages: vk::ShaderStageFlags, kind: BindingKind) -> RenderResult<&mut Self> {
        if self.built.is_some() {
            return Err(RenderError::illegal(format!(
                "binding {binding} declared after build"
            )));
        }
        if self.declarations.iter().any(|d| d.binding == binding) {
            return Err(RenderError::illegal(format!("binding {binding} declared twice")));
        }
        match &kind {
            BindingKind::UniformBuffer { size }
            | BindingKind::StorageBuffer { size }
            | BindingKind::ExternalBuffer { size, .. }
                if *size == 0 =>
            {
                return Err(RenderError::illegal(format!("binding {binding} has zero size")));
            }
            BindingKind::ExternalBuffer { descriptor_type, .. }
                if *descriptor_type != vk::DescriptorType::UNIFORM_BUFFER
                    && *descriptor_type != vk::DescriptorType::STORAGE_BUFFER =>
            {
                return Err(RenderError::illegal(format!(
                    "external binding {binding} has non-buffer type {descriptor_type:?}"
                )));
            }
            _ => {}
        }

        self.declarations.push(BindingDecl {
            binding,
            stages,
            kind,
        });
        Ok(self)
    }

    /// Declare a per-slot uniform buffer of `size` bytes
    pub fn declare_uniform(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        size: vk::DeviceSize,
    ) -> RenderResult<&mut Self> {
        self.declare(binding, stages, BindingKind::UniformBuffer { size })
    }

    /// Declare a per-slot storage buffer of `size` bytes
    pub fn declare_storage(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        size: vk::DeviceSize,
    ) -> RenderResult<&mut Self> {
        self.declare(binding, stages, BindingKind::StorageBuffer { size })
    }

    /// Declare a combined image sampler
    pub fn declare_image_sampler(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        texture: Rc<Texture>,
        sampler: Rc<Sampler>,
    ) -> RenderResult<&mut Self> {
        self.declare(binding, stages, BindingKind::CombinedImageSampler { texture, sampler })
    }

    /// Declare a storage image
    pub fn declare_storage_image(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        texture: Rc<Texture>,
    ) -> RenderResult<&mut Self> {
        self.declare(binding, stages, BindingKind::StorageImage { texture })
    }

    /// Declare a buffer owned by the caller
    pub fn declare_external_buffer(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RenderResult<&mut Self> {
        self.declare(
            binding,
            stages,
            BindingKind::ExternalBuffer {
                buffer,
                size,
                descriptor_type,
            },
        )
    }

    /// Allocate every per-slot resource and write all descriptor sets
    ///
    /// Fails without leaving anything allocated.
    pub fn build(&mut self) -> RenderResult<()> {
        if self.built.is_some() {
            return Err(RenderError::illegal("bindings already built"));
        }
        if self.declarations.is_empty() {
            return Err(RenderError::illegal("build with no declared bindings"));
        }
        let frames = u32::try_from(self.frames_in_flight)
            .ok()
            .filter(|&f| f > 0)
            .ok_or_else(|| RenderError::illegal("frames in flight must be at least 1"))?;

        // Locals drop in reverse on any early return
        let mut buffers = BTreeMap::new();
        for decl in &self.declarations {
            if let Some((size, usage)) = decl.kind.owned_buffer() {
                let per_slot = (0..self.frames_in_flight)
                    .map(|_| Buffer::new_mapped(&self.device, size, usage))
                    .collect::<RenderResult<Vec<_>>>()?;
                buffers.insert(decl.binding, per_slot);
            }
        }

        let layout = self
            .declarations
            .iter()
            .fold(DescriptorSetLayoutBuilder::new(), |builder, decl| {
                builder.add_binding(decl.binding, decl.kind.descriptor_type(), decl.stages)
            })
            .build(&self.device)?;
        let pool = DescriptorPool::new(&self.device, frames, &layout.pool_sizes(frames))?;
        let sets = pool.allocate(&vec![layout.handle(); self.frames_in_flight])?;

        let mut writer = DescriptorSetWriter::new();
        for (slot, &set) in sets.iter().enumerate() {
            for decl in &self.declarations {
                let ty = decl.kind.descriptor_type();
                writer = match &decl.kind {
                    BindingKind::UniformBuffer { size } | BindingKind::StorageBuffer { size } => {
                        let buffer = buffers
                            .get(&decl.binding)
                            .map(|per_slot: &Vec<Buffer>| per_slot[slot].handle())
                            .ok_or(RenderError::NotFound {
                                binding: decl.binding,
                            })?;
                        writer.write_buffer(set, decl.binding, ty, buffer, *size)
                    }
                    BindingKind::ExternalBuffer { buffer, size, .. } => {
                        writer.write_buffer(set, decl.binding, ty, *buffer, *size)
                    }
                    BindingKind::CombinedImageSampler { texture, sampler } => writer.write_image(
                        set,
                        decl.binding,
                        ty,
                        texture.view(),
                        sampler.handle(),
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    ),
                    BindingKind::StorageImage { texture } => writer.write_image(
                        set,
                        decl.binding,
                        ty,
                        texture.view(),
                        vk::Sampler::null(),
                        vk::ImageLayout::GENERAL,
                    ),
                };
            }
        }
        writer.update(&self.device);

        log::debug!(
            "Built {} bindings across {} frame slots",
            self.declarations.len(),
            self.frames_in_flight
        );
        self.built = Some(BuiltBindings {
            sets,
            buffers,
            pool,
            layout,
        });
        Ok(())
    }

    /// Whether `build` has completed
    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    /// Declared bindings in declaration order
    pub fn declarations(&self) -> &[BindingDecl] {
        &self.declarations
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn built(&self, action: &str) -> RenderResult<&BuiltBindings> {
        self.built
            .as_ref()
            .ok_or_else(|| RenderError::illegal(format!("{action} before build")))
    }

    fn check_slot(&self, slot: usize) -> RenderResult<()> {
        if slot < self.frames_in_flight {
            Ok(())
        } else {
            Err(RenderError::illegal(format!(
                "slot {slot} out of range for {} frames in flight",
                self.frames_in_flight
            )))
        }
    }

    fn declaration(&self, binding: u32) -> RenderResult<&BindingDecl> {
        self.declarations
            .iter()
            .find(|d| d.binding == binding)
            .ok_or(RenderError::NotFound { binding })
    }

    fn slot_buffer(&self, binding: u32, slot: usize, action: &str) -> RenderResult<&Buffer> {
        let built = self.built(action)?;
        self.check_slot(slot)?;
        built
            .buffers
            .get(&binding)
            .map(|per_slot| &per_slot[slot])
            .ok_or(RenderError::NotFound { binding })
    }

    fn write_slot(
        &self,
        binding: u32,
        slot: usize,
        data: &[u8],
        size: usize,
        expected: vk::DescriptorType,
    ) -> RenderResult<()> {
        let action = if expected == vk::DescriptorType::UNIFORM_BUFFER {
            "uniform update"
        } else {
            "storage update"
        };
        self.built(action)?;
        let decl = self.declaration(binding)?;
        if decl.kind.descriptor_type() != expected || decl.kind.owned_buffer().is_none() {
            return Err(RenderError::illegal(format!(
                "binding {binding} is not a {expected:?} owned by the manager"
            )));
        }
        let buffer = self.slot_buffer(binding, slot, action)?;

        let declared = usize::try_from(buffer.size())
            .map_err(|_| RenderError::illegal("binding size does not fit in host memory"))?;
        let size = if size == 0 { declared } else { size };
        if size > declared || size > data.len() {
            return Err(RenderError::illegal(format!(
                "write of {size} bytes to binding {binding} (declared {declared}, given {})",
                data.len()
            )));
        }
        buffer.write_bytes(0, &data[..size])
    }

    /// Copy `size` bytes of `data` into the uniform buffer of `slot`
    ///
    /// A `size` of zero writes the declared size. The caller must only
    /// write a slot whose fence has signaled.
    pub fn update_uniform(&self, binding: u32, slot: usize, data: &[u8], size: usize) -> RenderResult<()> {
        self.write_slot(binding, slot, data, size, vk::DescriptorType::UNIFORM_BUFFER)
    }

    /// Typed form of [`Self::update_uniform`]
    pub fn update_uniform_pod<T: Pod>(&self, binding: u32, slot: usize, value: &T) -> RenderResult<()> {
        let bytes = bytemuck::bytes_of(value);
        self.update_uniform(binding, slot, bytes, bytes.len())
    }

    /// Copy `size` bytes of `data` into the storage buffer of `slot`
    pub fn update_storage(&self, binding: u32, slot: usize, data: &[u8], size: usize) -> RenderResult<()> {
        self.write_slot(binding, slot, data, size, vk::DescriptorType::STORAGE_BUFFER)
    }

    /// Point one slot's image sampler binding at a new texture and sampler
    ///
    /// Issues a single descriptor write; nothing is rebuilt. The slot keeps
    /// the new resources alive until its next swap, and other slots keep
    /// theirs. The caller must only update a slot whose fence has signaled.
    pub fn update_image_sampler(
        &self,
        binding: u32,
        slot: usize,
        texture: Rc<Texture>,
        sampler: Rc<Sampler>,
    ) -> RenderResult<()> {
        let set = self.descriptor_set(slot)?;
        let decl = self.declaration(binding)?;
        if decl.kind.descriptor_type() != vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
            return Err(RenderError::illegal(format!(
                "binding {binding} is not a combined image sampler"
            )));
        }

        DescriptorSetWriter::new()
            .write_image(
                set,
                binding,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                texture.view(),
                sampler.handle(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .update(&self.device);
        self.image_overrides
            .borrow_mut()
            .insert((binding, slot), (texture, sampler));
        Ok(())
    }

    /// Contents of a manager-owned buffer for `slot`
    pub fn read_mapped(&self, binding: u32, slot: usize) -> RenderResult<Vec<u8>> {
        self.declaration(binding)?;
        self.slot_buffer(binding, slot, "read")?
            .read_mapped()
            .ok_or_else(|| RenderError::illegal(format!("binding {binding} is not host mapped")))
    }

    /// Buffer backing a manager-owned binding for `slot`
    pub fn buffer(&self, binding: u32, slot: usize) -> RenderResult<vk::Buffer> {
        self.declaration(binding)?;
        Ok(self.slot_buffer(binding, slot, "buffer lookup")?.handle())
    }

    /// Descriptor set instance of `slot`
    pub fn descriptor_set(&self, slot: usize) -> RenderResult<vk::DescriptorSet> {
        let built = self.built("descriptor set lookup")?;
        self.check_slot(slot)?;
        Ok(built.sets[slot])
    }

    /// Layout shared by every slot's set
    pub fn layout(&self) -> RenderResult<vk::DescriptorSetLayout> {
        Ok(self.built("layout lookup")?.layout.handle())
    }

    /// Pool the sets were allocated from
    pub fn pool(&self) -> RenderResult<vk::DescriptorPool> {
        Ok(self.built("pool lookup")?.pool.handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessDevice, ObjectKind};
    use crate::render::context::DeviceContext;
    use crate::render::device::DescriptorResource;
    use crate::render::texture::SamplerConfig;

    const FRAGMENT: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;

    fn setup(frames: usize) -> (Rc<HeadlessDevice>, DeviceRef, BindingManager) {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let device: DeviceRef = headless.clone();
        let manager = BindingManager::new(&device, frames);
        (headless, device, manager)
    }

    #[test]
    fn test_build_allocates_per_slot() {
        let (headless, _device, mut manager) = setup(3);
        manager
            .declare_uniform(0, vk::ShaderStageFlags::VERTEX, 16)
            .unwrap()
            .declare_storage(1, FRAGMENT, 64)
            .unwrap();
        manager.build().unwrap();

        assert_eq!(headless.live_count(ObjectKind::Buffer), 6);
        assert_eq!(headless.live_count(ObjectKind::DescriptorSetLayout), 1);
        assert_eq!(headless.live_count(ObjectKind::DescriptorPool), 1);
        assert_eq!(headless.live_count(ObjectKind::DescriptorSet), 3);
        // Two bindings written into each of the three sets
        assert_eq!(headless.descriptor_writes().len(), 6);

        let set1 = manager.descriptor_set(1).unwrap();
        let uniform1 = manager.buffer(0, 1).unwrap();
        assert!(headless.descriptor_writes().iter().any(|w| w.set == set1
            && w.binding == 0
            && w.resource
                == DescriptorResource::Buffer {
                    buffer: uniform1,
                    range: 16
                }));

        drop(manager);
        assert_eq!(headless.total_live(), 0);
        assert!(headless.violations().is_empty());
    }

    #[test]
    fn test_uniform_round_trip_is_per_slot() {
        let (_, _device, mut manager) = setup(2);
        manager.declare_uniform(0, FRAGMENT, 16).unwrap();
        manager.build().unwrap();

        let payload: Vec<u8> = (1..=16).collect();
        manager.update_uniform(0, 0, &payload, 0).unwrap();

        assert_eq!(manager.read_mapped(0, 0).unwrap(), payload);
        assert_eq!(manager.read_mapped(0, 1).unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_pod_update() {
        let (_, _device, mut manager) = setup(2);
        manager.declare_uniform(0, FRAGMENT, 16).unwrap();
        manager.build().unwrap();

        manager.update_uniform_pod(0, 1, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let bytes = manager.read_mapped(0, 1).unwrap();
        let floats: [f32; 4] = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(floats, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_misuse_errors_leave_nothing_allocated() {
        let (headless, _device, mut manager) = setup(2);

        assert!(matches!(manager.build(), Err(RenderError::IllegalState { .. })));
        assert!(matches!(
            manager.update_uniform(0, 0, &[0; 16], 0),
            Err(RenderError::IllegalState { .. })
        ));
        assert_eq!(headless.total_live(), 0);

        manager.declare_uniform(0, FRAGMENT, 16).unwrap();
        assert!(matches!(
            manager.declare_uniform(0, FRAGMENT, 16),
            Err(RenderError::IllegalState { .. })
        ));
        manager.build().unwrap();
        let live = headless.total_live();

        assert!(matches!(manager.build(), Err(RenderError::IllegalState { .. })));
        assert!(matches!(
            manager.declare_uniform(1, FRAGMENT, 16),
            Err(RenderError::IllegalState { .. })
        ));
        assert!(matches!(
            manager.update_uniform(5, 0, &[0; 16], 0),
            Err(RenderError::NotFound { binding: 5 })
        ));
        assert!(matches!(
            manager.update_uniform(0, 2, &[0; 16], 0),
            Err(RenderError::IllegalState { .. })
        ));
        assert_eq!(headless.total_live(), live);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let (_, _device, mut manager) = setup(2);
        manager.declare_uniform(0, FRAGMENT, 8).unwrap();
        manager.build().unwrap();

        assert!(matches!(
            manager.update_uniform(0, 0, &[0; 16], 16),
            Err(RenderError::IllegalState { .. })
        ));
        assert!(matches!(
            manager.update_uniform(0, 0, &[0; 4], 0),
            Err(RenderError::IllegalState { .. })
        ));
        manager.update_uniform(0, 0, &[7; 4], 4).unwrap();
        assert_eq!(manager.read_mapped(0, 0).unwrap(), vec![7, 7, 7, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn test_storage_and_uniform_are_not_interchangeable() {
        let (_, _device, mut manager) = setup(2);
        manager.declare_storage(2, FRAGMENT, 32).unwrap();
        manager.build().unwrap();

        assert!(matches!(
            manager.update_uniform(2, 0, &[0; 32], 0),
            Err(RenderError::IllegalState { .. })
        ));
        manager.update_storage(2, 0, &[9; 32], 0).unwrap();
        assert_eq!(manager.read_mapped(2, 0).unwrap(), vec![9; 32]);
    }

    #[test]
    fn test_failed_build_releases_partial_allocation() {
        let (headless, _device, mut manager) = setup(2);
        manager.declare_uniform(0, FRAGMENT, 16).unwrap();
        headless.inject_failure("allocate_descriptor_sets", 0);

        assert!(manager.build().is_err());
        assert!(!manager.is_built());
        assert_eq!(headless.total_live(), 0);
        assert!(headless.violations().is_empty());

        manager.build().unwrap();
        assert!(manager.is_built());
    }

    #[test]
    fn test_external_buffer_is_shared() {
        let (headless, device, mut manager) = setup(2);
        let external = Buffer::new_mapped(&device, 128, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
        manager
            .declare_external_buffer(3, FRAGMENT, vk::DescriptorType::STORAGE_BUFFER, external.handle(), 128)
            .unwrap();
        manager.build().unwrap();

        let writes = headless.descriptor_writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.resource
            == DescriptorResource::Buffer {
                buffer: external.handle(),
                range: 128
            }));
        assert!(matches!(
            manager.update_storage(3, 0, &[0; 128], 0),
            Err(RenderError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_image_sampler_swap_is_single_write() {
        let headless = Rc::new(HeadlessDevice::new(vk::Extent2D { width: 8, height: 8 }));
        let context = DeviceContext::new(headless.clone(), 2).unwrap();
        let extent = vk::Extent2D { width: 1, height: 1 };
        let first = Rc::new(Texture::from_rgba8(&context, extent, &[0, 0, 0, 255]).unwrap());
        let second = Rc::new(Texture::from_rgba8(&context, extent, &[255, 0, 0, 255]).unwrap());
        let sampler = Rc::new(Sampler::new(context.device(), &SamplerConfig::default()).unwrap());

        let mut manager = context.binding_manager();
        manager
            .declare_image_sampler(1, FRAGMENT, Rc::clone(&first), Rc::clone(&sampler))
            .unwrap();
        manager.build().unwrap();
        let before = headless.descriptor_writes().len();

        manager
            .update_image_sampler(1, 1, Rc::clone(&second), Rc::clone(&sampler))
            .unwrap();
        let writes = headless.descriptor_writes();
        assert_eq!(writes.len(), before + 1);
        let last = writes[writes.len() - 1];
        assert_eq!(last.set, manager.descriptor_set(1).unwrap());
        assert!(matches!(
            last.resource,
            DescriptorResource::Image { view, .. } if view == second.view()
        ));

        assert!(matches!(
            manager.update_image_sampler(4, 0, second, sampler),
            Err(RenderError::NotFound { binding: 4 })
        ));
    }
}
