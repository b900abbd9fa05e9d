//! The bindless descriptor set backing the shader-visible descriptor heap.
//!
//! One set holds every descriptor the renderer writes. Storage buffers and
//! sampled images live in two arrays indexed by the same heap slot, so a
//! slot number is valid in whichever array matches the view written to it.
//! The set is written while earlier frames still execute, which requires
//! update-after-bind on both arrays.

use ash::vk;

use crate::backend::{BackendError, BackendResult};

pub(super) const STORAGE_BUFFER_BINDING: u32 = 0;
pub(super) const SAMPLED_IMAGE_BINDING: u32 = 1;
pub(super) const SAMPLER_BINDING: u32 = 2;

/// Push constant block: the table base followed by the pass constants.
pub(super) const PUSH_CONSTANT_SIZE: u32 = 32;
/// Byte offset of the pass constants within the push constant block.
pub(super) const PASS_CONSTANTS_OFFSET: u32 = 4;

pub(super) const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::COMPUTE.as_raw()
        | vk::ShaderStageFlags::VERTEX.as_raw()
        | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

pub(super) struct BindlessSet {
    pub layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub set: vk::DescriptorSet,
    pub capacity: u32,
    pool: vk::DescriptorPool,
    sampler: vk::Sampler,
}

impl BindlessSet {
    pub fn new(device: &ash::Device, capacity: u32) -> BackendResult<Self> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }
            .map_err(|e| heap_error("sampler", e))?;

        let samplers = [sampler];
        let stages = vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::FRAGMENT;
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(STORAGE_BUFFER_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(capacity)
                .stage_flags(stages),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLED_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(capacity)
                .stage_flags(stages),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(stages)
                .immutable_samplers(&samplers),
        ];
        let bindless_flags = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        let binding_flags = [bindless_flags, bindless_flags, vk::DescriptorBindingFlags::empty()];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| heap_error("descriptor set layout", e))?;

        let set_layouts = [layout];
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(PUSH_CONSTANT_STAGES)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(|e| heap_error("pipeline layout", e))?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| heap_error("descriptor pool", e))?;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| heap_error("descriptor set", e))?
            .first()
            .copied()
            .ok_or_else(|| {
                BackendError::DescriptorHeapCreationFailed("No descriptor set allocated".into())
            })?;

        log::debug!("Created bindless descriptor set with {capacity} slots");

        Ok(Self {
            layout,
            pipeline_layout,
            set,
            capacity,
            pool,
            sampler,
        })
    }

    pub fn write_storage_buffer(
        &self,
        device: &ash::Device,
        slot: u32,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(size)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(STORAGE_BUFFER_BINDING)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_sampled_image(&self, device: &ash::Device, slot: u32, view: vk::ImageView) {
        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(SAMPLED_IMAGE_BINDING)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.layout, None);
            device.destroy_sampler(self.sampler, None);
        }
    }
}

fn heap_error(what: &str, e: vk::Result) -> BackendError {
    BackendError::DescriptorHeapCreationFailed(format!("Failed to create {what}: {:?}", e))
}
