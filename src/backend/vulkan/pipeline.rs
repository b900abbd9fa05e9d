//! Shader modules and pipeline creation.
//!
//! Every pipeline shares the bindless pipeline layout, so binding the
//! descriptor set and pushing constants once per command list stays valid
//! across pipeline switches.

use std::ffi::CString;

use ash::vk;

use crate::backend::{BackendError, BackendResult, RenderPipelineDesc};
use crate::shader::ShaderBlob;

use super::conversion::{convert_blend_state, convert_texture_format, convert_vertex_format};

/// Create a shader module from a SPIR-V blob.
pub(super) fn create_shader_module(
    device: &ash::Device,
    blob: &ShaderBlob,
) -> BackendResult<vk::ShaderModule> {
    let code = blob
        .spirv_words()
        .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
        BackendError::PipelineCreationFailed(format!(
            "Failed to create shader module {}: {:?}",
            blob.name, e
        ))
    })
}

fn entry_point(blob: &ShaderBlob) -> BackendResult<CString> {
    CString::new(blob.entry_point.as_str()).map_err(|e| {
        BackendError::PipelineCreationFailed(format!(
            "Invalid entry point name for {}: {}",
            blob.name, e
        ))
    })
}

pub(super) fn create_compute_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    shader: &ShaderBlob,
    group_size: u32,
) -> BackendResult<vk::Pipeline> {
    let entry = entry_point(shader)?;
    let module = create_shader_module(device, shader)?;

    // Constant 0 is the shader's local_size_x.
    let map_entries = [vk::SpecializationMapEntry {
        constant_id: 0,
        offset: 0,
        size: std::mem::size_of::<u32>(),
    }];
    let specialization = vk::SpecializationInfo::default()
        .map_entries(&map_entries)
        .data(bytemuck::bytes_of(&group_size));
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry)
        .specialization_info(&specialization);
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let result = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
    };
    unsafe { device.destroy_shader_module(module, None) };

    let pipelines = result.map_err(|(_, e)| {
        BackendError::PipelineCreationFailed(format!(
            "Failed to create compute pipeline {}: {:?}",
            shader.name, e
        ))
    })?;
    Ok(pipelines[0])
}

pub(super) fn create_render_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &RenderPipelineDesc,
) -> BackendResult<vk::Pipeline> {
    let vertex_module = create_shader_module(device, &desc.vertex)?;
    let pixel_module = match create_shader_module(device, &desc.pixel) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
    };

    let result = build_render_pipeline(device, layout, desc, vertex_module, pixel_module);

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(pixel_module, None);
    }
    result
}

fn build_render_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &RenderPipelineDesc,
    vertex_module: vk::ShaderModule,
    pixel_module: vk::ShaderModule,
) -> BackendResult<vk::Pipeline> {
    let vertex_entry = entry_point(&desc.vertex)?;
    let pixel_entry = entry_point(&desc.pixel)?;

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(&vertex_entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(pixel_module)
            .name(&pixel_entry),
    ];

    let binding_descriptions = [vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(desc.vertex_stride)
        .input_rate(vk::VertexInputRate::VERTEX)];

    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_attributes
        .iter()
        .map(|attr| {
            vk::VertexInputAttributeDescription::default()
                .location(attr.location)
                .binding(0)
                .format(convert_vertex_format(attr.format))
                .offset(attr.offset)
        })
        .collect();

    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachments = [convert_blend_state(desc.alpha_blend)];
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_attachment_formats = [convert_texture_format(desc.target_format)];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_attachment_formats);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| {
        BackendError::PipelineCreationFailed(format!(
            "Failed to create render pipeline {}: {:?}",
            desc.label, e
        ))
    })?;

    Ok(pipelines[0])
}
