//! GPU-driven sprite rendering.
//!
//! The CPU builds a flat array of [`DrawCommand`]s. At flush the GPU culls
//! them against the viewport, expands the survivors into [`SpriteVertex`]
//! quads and draws everything with a single indirect draw whose vertex count
//! it wrote itself.

mod batch;
mod geometry;
mod kernels;
mod pipeline;
mod transform;

pub use batch::SpriteBatch;
pub use geometry::{bounding_box, overlaps_viewport, quad_corners, quad_vertices, Rect};
pub use kernels::{CullKernel, GenerateKernel};
pub use pipeline::{FlushStats, SpritePipeline};
pub use transform::{MatrixStack, Transform2D, MATRIX_STACK_DEPTH};

use bytemuck::{Pod, Zeroable};

/// Vertices emitted per visible sprite (two triangles).
pub const SPRITE_VERTEX_COUNT: u32 = 6;

/// Threads per compute group of the cull and generate passes.
pub const THREAD_GROUP_SIZE: u32 = 1024;

/// Storage views written at the start of every flush's descriptor range,
/// ahead of the sprite textures.
pub const COMPUTE_VIEW_COUNT: u32 = 5;

/// Descriptor slots of the compute views, relative to the flush's range.
pub(crate) mod slots {
    pub const COMMANDS: u32 = 0;
    pub const VISIBLE: u32 = 1;
    pub const COUNTER: u32 = 2;
    pub const ARGS: u32 = 3;
    pub const VERTICES: u32 = 4;
}

/// One sprite submitted by the caller.
///
/// # Memory Layout
///
/// 40 bytes, matching the `DrawCommand` struct of the compute shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct DrawCommand {
    /// Local rectangle: x, y, width, height.
    pub rect: [f32; 4],
    /// Translate x, translate y, rotation in radians, uniform scale.
    pub transform: [f32; 4],
    /// Packed RGBA, see [`crate::color`].
    pub color: u32,
    /// Bind index of the texture within the flush.
    pub texture_id: u32,
}

impl DrawCommand {
    pub fn transform(&self) -> Transform2D {
        Transform2D::from_array(self.transform)
    }

    pub fn local_rect(&self) -> Rect {
        Rect::from_array(self.rect)
    }
}

/// A vertex generated by the GPU for a visible sprite.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct SpriteVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: u32,
    /// Descriptor slot of the texture relative to the bound table.
    pub texture_id: u32,
}

impl SpriteVertex {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Arguments of the indirect draw, written by the cull pass.
///
/// Layout of `vkCmdDrawIndirect` / `D3D12_DRAW_ARGUMENTS`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct IndirectDrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl IndirectDrawArgs {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Contents the arguments are reset to before every cull: nothing to
    /// draw, one instance.
    pub const CLEARED: Self = Self {
        vertex_count: 0,
        instance_count: 1,
        first_vertex: 0,
        first_instance: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::INDIRECT_DRAW_ARGS_SIZE;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<DrawCommand>(), 40);
        assert_eq!(SpriteVertex::SIZE, 24);
        assert_eq!(IndirectDrawArgs::SIZE, INDIRECT_DRAW_ARGS_SIZE);
    }

    #[test]
    fn test_cleared_args_draw_nothing() {
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&IndirectDrawArgs::CLEARED));
        assert_eq!(words, &[0, 1, 0, 0]);
    }
}
