//! Type conversions between renderer types and Vulkan types.

use ash::vk;

use crate::backend::types::{
    BufferFlags, HeapLocation, ResourceState, TextureFormat, VertexFormat,
};

/// Convert TextureFormat to Vulkan format.
pub fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
    }
}

/// Convert a swapchain surface format back to a TextureFormat.
pub fn texture_format_from_vk(format: vk::Format) -> Option<TextureFormat> {
    match format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Some(TextureFormat::Rgba8Unorm),
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => Some(TextureFormat::Bgra8Unorm),
        vk::Format::R8_UNORM => Some(TextureFormat::R8Unorm),
        _ => None,
    }
}

/// Convert VertexFormat to Vulkan vertex attribute format.
pub fn convert_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
        VertexFormat::Uint32 => vk::Format::R32_UINT,
    }
}

/// Buffer usage flags for a buffer placed in `heap` with `flags`.
///
/// Upload buffers are only ever copy sources. Default-heap buffers may be
/// copied in both directions, bound as vertex input, and additionally as
/// storage or indirect argument buffers when their flags ask for it.
pub fn convert_buffer_usage(heap: HeapLocation, flags: BufferFlags) -> vk::BufferUsageFlags {
    if heap == HeapLocation::Upload {
        return vk::BufferUsageFlags::TRANSFER_SRC;
    }

    let mut result = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER;

    if flags.contains(BufferFlags::ALLOW_UNORDERED_ACCESS) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if flags.contains(BufferFlags::INDIRECT) {
        result |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }

    result
}

/// Memory location used by the allocator for `heap`.
pub fn convert_heap_location(heap: HeapLocation) -> gpu_allocator::MemoryLocation {
    match heap {
        HeapLocation::Default => gpu_allocator::MemoryLocation::GpuOnly,
        HeapLocation::Upload => gpu_allocator::MemoryLocation::CpuToGpu,
    }
}

/// Pipeline stages and memory accesses a resource state stands for.
///
/// Used on both sides of a barrier: the stages and accesses of the `before`
/// state form the source scope, those of the `after` state the destination.
pub fn state_scope(state: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;

    match state {
        ResourceState::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
        ResourceState::VertexAndConstantBuffer => (
            S::VERTEX_ATTRIBUTE_INPUT | S::VERTEX_SHADER | S::FRAGMENT_SHADER,
            A::VERTEX_ATTRIBUTE_READ | A::UNIFORM_READ,
        ),
        ResourceState::IndexBuffer => (S::INDEX_INPUT, A::INDEX_READ),
        ResourceState::UnorderedAccess => (
            S::COMPUTE_SHADER,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
        ),
        ResourceState::CopyDest => (S::COPY, A::TRANSFER_WRITE),
        ResourceState::CopySource => (S::COPY, A::TRANSFER_READ),
        // Host writes become visible at submission.
        ResourceState::GenericRead => (S::ALL_COMMANDS, A::MEMORY_READ),
        ResourceState::IndirectArgument => (S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ),
        ResourceState::PixelShaderResource => (S::FRAGMENT_SHADER, A::SHADER_SAMPLED_READ),
        ResourceState::AllShaderResource => (
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            A::SHADER_READ,
        ),
        ResourceState::RenderTarget => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        // Chains with the acquire semaphore, which is waited at this stage.
        ResourceState::Present => (S::COLOR_ATTACHMENT_OUTPUT, A::NONE),
    }
}

/// Image layout a texture in `state` must have.
pub fn state_layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::PixelShaderResource | ResourceState::AllShaderResource => {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        ResourceState::Common
        | ResourceState::UnorderedAccess
        | ResourceState::GenericRead
        | ResourceState::VertexAndConstantBuffer
        | ResourceState::IndexBuffer
        | ResourceState::IndirectArgument => vk::ImageLayout::GENERAL,
    }
}

/// Convert a clear color or load request to a Vulkan load op and clear value.
pub fn convert_load_op(clear: Option<[f32; 4]>) -> (vk::AttachmentLoadOp, vk::ClearValue) {
    match clear {
        Some(float32) => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
        ),
        None => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
    }
}

/// Straight-alpha source-over blending, or none.
pub fn convert_blend_state(alpha_blend: bool) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    if !alpha_blend {
        return state.blend_enable(false);
    }
    state
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .alpha_blend_op(vk::BlendOp::ADD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_buffers_are_copy_sources_only() {
        let usage = convert_buffer_usage(HeapLocation::Upload, BufferFlags::all());
        assert_eq!(usage, vk::BufferUsageFlags::TRANSFER_SRC);
    }

    #[test]
    fn test_unordered_buffers_get_storage_and_indirect() {
        let usage = convert_buffer_usage(
            HeapLocation::Default,
            BufferFlags::ALLOW_UNORDERED_ACCESS | BufferFlags::INDIRECT,
        );
        assert!(usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER));
    }

    #[test]
    fn test_sampled_states_share_read_only_layout() {
        assert_eq!(
            state_layout(ResourceState::PixelShaderResource),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            state_layout(ResourceState::AllShaderResource),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            state_layout(ResourceState::Present),
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn test_format_round_trip() {
        for format in [
            TextureFormat::Rgba8Unorm,
            TextureFormat::Bgra8Unorm,
            TextureFormat::R8Unorm,
        ] {
            assert_eq!(
                texture_format_from_vk(convert_texture_format(format)),
                Some(format)
            );
        }
    }
}
