//! Sprite Engine - a GPU-driven 2D sprite renderer
//!
//! Callers submit up to a million sprites per frame as plain draw commands.
//! Culling against the viewport and vertex generation run entirely on the
//! GPU, and the frame is drawn with one indirect draw whose vertex count the
//! GPU computed itself.
//!
//! # Backends
//! - **software**: CPU reference device with a worker-thread queue and full
//!   resource-state validation (always available)
//! - **Vulkan**: Vulkan 1.3 via ash (`vulkan-backend` feature)
//!
//! # Frame structure
//!
//! ```text
//! begin_frame -> reset_sprite_batch -> draw_sprite* -> flush -> end_frame -> present
//! ```
//!
//! [`Renderer`] is the entry point; the modules below it are usable on their
//! own for custom pipelines.

pub mod backend;
pub mod barrier;
pub mod buffer;
pub mod color;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod renderer;
pub mod shader;
pub mod sprite;
pub mod texture;
pub mod upload;

pub use backend::software::SoftwareBackend;
pub use backend::{GpuBackend, TextureFormat};
pub use buffer::BufferKind;
pub use error::{fatal, OrFatal, RenderError, RenderResult};
pub use frame::FrameHandle;
pub use renderer::Renderer;
pub use shader::{FileShaderLoader, ShaderLoader, ShaderSet};
pub use sprite::{DrawCommand, IndirectDrawArgs, SpriteVertex};
pub use texture::TextureHandle;

#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::{VulkanBackend, VulkanConfig};

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Frames the CPU may record ahead of the GPU
    pub frame_count: usize,
    /// Swap-chain images requested from the presentation backend
    pub backbuffer_count: usize,
    /// Descriptor slots reserved for each frame
    pub max_descriptors_per_frame: u32,
    /// Sprites accepted per flush
    pub max_draw_commands: u32,
    /// Backbuffer clear color, linear RGBA
    pub clear_color: [f32; 4],
    /// Validate GPU work where the backend supports it
    pub validation: bool,
    /// Threads per compute group of the cull and generate passes
    pub thread_group_size: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frame_count: 3,
            backbuffer_count: 2,
            max_descriptors_per_frame: 4096,
            max_draw_commands: 1_000_000,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            validation: cfg!(debug_assertions),
            thread_group_size: sprite::THREAD_GROUP_SIZE,
        }
    }
}

impl RendererConfig {
    /// Reject configurations the renderer cannot run with.
    pub fn validate(&self) -> RenderResult<()> {
        let invalid = |reason: &str| Err(RenderError::InvalidConfig(reason.to_string()));
        if self.frame_count == 0 {
            return invalid("frame_count must be at least 1");
        }
        if self.backbuffer_count == 0 {
            return invalid("backbuffer_count must be at least 1");
        }
        if self.max_draw_commands == 0 {
            return invalid("max_draw_commands must be at least 1");
        }
        if self.thread_group_size == 0 {
            return invalid("thread_group_size must be at least 1");
        }
        if self.max_descriptors_per_frame <= sprite::COMPUTE_VIEW_COUNT {
            return invalid("max_descriptors_per_frame must leave room for textures");
        }
        Ok(())
    }
}
