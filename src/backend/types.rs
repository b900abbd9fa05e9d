//! Common types shared between backends

use bitflags::bitflags;

use crate::backend::traits::{BufferId, TextureId};

/// Row pitch alignment required for buffer-to-texture copies.
pub const TEXTURE_ROW_PITCH_ALIGNMENT: u64 = 256;

/// Size alignment applied to every buffer allocation.
pub const BUFFER_SIZE_ALIGNMENT: u64 = 256;

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Access state of a GPU resource.
///
/// A resource must be transitioned into the state matching its next use
/// before that use is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexAndConstantBuffer,
    IndexBuffer,
    UnorderedAccess,
    CopyDest,
    CopySource,
    /// Permanent state of upload-heap buffers.
    GenericRead,
    IndirectArgument,
    PixelShaderResource,
    AllShaderResource,
    RenderTarget,
    Present,
}

impl ResourceState {
    /// Whether this state allows the GPU to write the resource.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ResourceState::UnorderedAccess | ResourceState::CopyDest | ResourceState::RenderTarget
        )
    }

    /// Whether a shader may sample a texture in this state.
    pub fn is_shader_readable(&self) -> bool {
        matches!(
            self,
            ResourceState::PixelShaderResource | ResourceState::AllShaderResource
        )
    }
}

/// Memory heap a buffer is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapLocation {
    /// GPU-local memory, not CPU visible.
    Default,
    /// CPU-writable memory read by the GPU.
    Upload,
}

bitflags! {
    /// Allocation flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Buffer may be bound as a storage (unordered access) view.
        const ALLOW_UNORDERED_ACCESS = 1 << 0;
        /// Buffer may be read as indirect draw arguments.
        const INDIRECT = 1 << 1;
        /// Contents are undefined after creation.
        const NOT_ZEROED = 1 << 2;
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub heap: HeapLocation,
    pub initial_state: ResourceState,
    pub flags: BufferFlags,
}

/// Texel formats supported for sprite textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    #[default]
    Rgba8Unorm,
    Bgra8Unorm,
    R8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm => 4,
            TextureFormat::R8Unorm => 1,
        }
    }
}

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub initial_state: ResourceState,
}

/// Layout a texture's pixels must have inside a buffer to be copied into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFootprint {
    pub row_count: u32,
    /// Tightly packed bytes per row.
    pub row_size: u64,
    /// Aligned distance between the starts of consecutive rows.
    pub row_pitch: u64,
    pub total_bytes: u64,
}

impl TextureFootprint {
    /// Footprint of a single-mip 2D texture with pitch aligned to
    /// [`TEXTURE_ROW_PITCH_ALIGNMENT`].
    pub fn for_texture(width: u32, height: u32, format: TextureFormat) -> Self {
        let row_size = width as u64 * format.bytes_per_pixel() as u64;
        let row_pitch = align_up(row_size.max(1), TEXTURE_ROW_PITCH_ALIGNMENT);
        Self {
            row_count: height,
            row_size,
            row_pitch,
            total_bytes: row_pitch * height.saturating_sub(1) as u64 + row_size,
        }
    }
}

/// A resource referenced by a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferId),
    Texture(TextureId),
}

/// Resource barrier recorded into a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders unordered-access writes against later unordered accesses.
    /// `None` covers every resource.
    UnorderedAccess { resource: Option<ResourceId> },
}

/// CPU-side handle used to write a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    pub fn offset(self, slots: u32, increment: u32) -> Self {
        Self(self.0 + slots as u64 * increment as u64)
    }
}

/// GPU-side handle used to bind a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub fn offset(self, slots: u32, increment: u32) -> Self {
        Self(self.0 + slots as u64 * increment as u64)
    }
}

/// Start handles of a shader-visible descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: GpuDescriptorHandle,
    /// Distance between consecutive slots in handle units.
    pub increment: u32,
    pub capacity: u32,
}

/// A view written into a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorView {
    /// Read-write structured buffer range, in bytes.
    StorageBuffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    /// Sampled texture.
    Texture(TextureId),
}

/// Fixed-function description of the sprite render pipeline.
#[derive(Debug, Clone)]
pub struct RenderPipelineDesc {
    pub label: String,
    pub vertex: crate::shader::ShaderBlob,
    pub pixel: crate::shader::ShaderBlob,
    pub vertex_stride: u32,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub target_format: TextureFormat,
    pub alpha_blend: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Unorm8x4,
    Uint32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Size of one indirect draw argument record (four u32 words).
pub const INDIRECT_DRAW_ARGS_SIZE: u64 = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_footprint_pads_rows() {
        let fp = TextureFootprint::for_texture(10, 3, TextureFormat::Rgba8Unorm);
        assert_eq!(fp.row_size, 40);
        assert_eq!(fp.row_pitch, 256);
        assert_eq!(fp.row_count, 3);
        assert_eq!(fp.total_bytes, 256 * 2 + 40);
    }

    #[test]
    fn test_footprint_exact_pitch() {
        let fp = TextureFootprint::for_texture(64, 2, TextureFormat::Rgba8Unorm);
        assert_eq!(fp.row_pitch, 256);
        assert_eq!(fp.total_bytes, 512);
    }

    #[test]
    fn test_state_classification() {
        assert!(ResourceState::UnorderedAccess.is_write());
        assert!(!ResourceState::GenericRead.is_write());
        assert!(ResourceState::PixelShaderResource.is_shader_readable());
        assert!(!ResourceState::CopyDest.is_shader_readable());
    }
}
