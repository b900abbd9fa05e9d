//! The renderer context object.
//!
//! [`Renderer`] owns the backend and every piece of renderer state. It is
//! passed explicitly to all calls, so several renderers can coexist and tests
//! run against isolated instances.

use std::sync::Arc;

use crate::backend::software::SoftwareBackend;
use crate::backend::{GpuBackend, TextureDesc, TextureFormat};
use crate::buffer::{self, BufferKind, GpuBuffer};
use crate::error::{RenderError, RenderResult};
use crate::frame::{FrameHandle, FramePipeline, Retired};
use crate::shader::{ShaderSet, CULL_SHADER, GENERATE_SHADER};
use crate::sprite::{
    CullKernel, FlushStats, GenerateKernel, MatrixStack, Rect, SpriteBatch, SpritePipeline,
    Transform2D,
};
use crate::texture::{Texture, TextureHandle, TextureRegistry, TEXTURE_STEADY_STATE};
use crate::upload::TextureUploadQueue;
use crate::RendererConfig;

/// GPU-driven sprite renderer over backend `B`.
pub struct Renderer<B: GpuBackend> {
    backend: B,
    config: RendererConfig,
    frames: FramePipeline,
    textures: TextureRegistry,
    uploads: TextureUploadQueue,
    batch: SpriteBatch,
    sprites: SpritePipeline,
    matrices: MatrixStack,
    last_flush: FlushStats,
}

impl Renderer<SoftwareBackend> {
    /// Renderer on a software device of `width` x `height` pixels, with the
    /// built-in cull and generate kernels.
    pub fn software(width: u32, height: u32, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;
        let mut backend =
            SoftwareBackend::with_backbuffers(width, height, config.backbuffer_count)?;
        backend.set_validation(config.validation);
        backend.register_kernel(
            CULL_SHADER,
            Arc::new(CullKernel::new(config.thread_group_size)),
        );
        backend.register_kernel(
            GENERATE_SHADER,
            Arc::new(GenerateKernel::new(config.thread_group_size)),
        );
        Self::init(backend, config, &ShaderSet::builtin())
    }
}

impl<B: GpuBackend> Renderer<B> {
    /// Create frame ring, descriptor heap, pipelines and sprite buffers.
    pub fn init(mut backend: B, config: RendererConfig, shaders: &ShaderSet) -> RenderResult<Self> {
        config.validate()?;
        let (width, height) = backend.viewport();
        log::info!(
            "Initializing sprite renderer on {} backend ({}x{})",
            backend.name(),
            width,
            height
        );

        let frames = FramePipeline::new(
            &mut backend,
            config.frame_count,
            config.max_descriptors_per_frame,
        )?;
        let sprites = SpritePipeline::new(
            &mut backend,
            shaders,
            config.frame_count,
            config.max_draw_commands,
            config.thread_group_size,
            config.clear_color,
        )?;

        Ok(Self {
            batch: SpriteBatch::new(config.max_draw_commands as usize),
            backend,
            config,
            frames,
            textures: TextureRegistry::new(),
            uploads: TextureUploadQueue::new(),
            sprites,
            matrices: MatrixStack::new(),
            last_flush: FlushStats::default(),
        })
    }

    /// Wait for the GPU, release every resource and hand the backend back.
    pub fn destroy(mut self) -> RenderResult<B> {
        self.frames.wait_for_all(&mut self.backend)?;
        self.backend.wait_idle()?;

        self.sprites.destroy(&mut self.backend);
        for texture in self.textures.drain() {
            if let Some(staging) = texture.staging {
                buffer::destroy_buffer(&mut self.backend, staging);
            }
            self.backend.destroy_texture(texture.id);
        }
        self.frames.destroy(&mut self.backend)?;
        log::info!("Sprite renderer destroyed");
        Ok(self.backend)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn frames(&self) -> &FramePipeline {
        &self.frames
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture> {
        self.textures.get(handle)
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Sprites recorded since the last reset.
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    pub fn last_flush(&self) -> FlushStats {
        self.last_flush
    }

    // Frames

    /// Start the next frame. Blocks while the ring slot is in flight.
    pub fn begin_frame(&mut self) -> RenderResult<FrameHandle> {
        self.frames
            .begin_frame(&mut self.backend, &mut self.textures, &mut self.uploads)
    }

    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.frames.end_frame(&mut self.backend)
    }

    /// Present the frame. Blocks while all backbuffers are queued.
    pub fn present(&mut self, vsync: bool) -> RenderResult<()> {
        self.frames.present(&mut self.backend, vsync)
    }

    pub fn wait_for_frame(&mut self, index: usize) -> RenderResult<()> {
        self.frames.wait_for_frame(&mut self.backend, index)
    }

    pub fn wait_for_all(&mut self) -> RenderResult<()> {
        self.frames.wait_for_all(&mut self.backend)
    }

    // Sprites

    pub fn reset_sprite_batch(&mut self) {
        self.batch.reset(&mut self.textures);
    }

    /// Queue a `width` x `height` sprite at local position (`x`, `y`) under
    /// the current transform.
    pub fn draw_sprite(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: u32,
        texture: TextureHandle,
    ) -> RenderResult<()> {
        self.batch.push(
            &mut self.textures,
            Rect::new(x, y, width, height),
            self.matrices.current(),
            color,
            texture,
        )
    }

    /// Cull, generate and draw the batch into the frame's backbuffer.
    pub fn flush(&mut self, frame: FrameHandle) -> RenderResult<FlushStats> {
        let ctx = self.frames.recording(frame)?;
        let stats = self
            .sprites
            .flush(
                &mut self.backend,
                ctx,
                frame.serial(),
                &mut self.batch,
                &mut self.textures,
            )?;
        self.last_flush = stats;
        Ok(stats)
    }

    // Transform stack

    pub fn push_matrix(&mut self) {
        self.matrices.push();
    }

    pub fn pop_matrix(&mut self) {
        self.matrices.pop();
    }

    pub fn load_identity(&mut self) {
        self.matrices.load_identity();
    }

    pub fn translate(&mut self, x: f32, y: f32) {
        self.matrices.translate(x, y);
    }

    pub fn rotate(&mut self, radians: f32) {
        self.matrices.rotate(radians);
    }

    /// Set the uniform scale.
    pub fn scale(&mut self, scale: f32) {
        self.matrices.scale(scale);
    }

    pub fn current_transform(&self) -> Transform2D {
        self.matrices.current()
    }

    // Resources

    /// Create a sampled texture, optionally with initial pixels.
    ///
    /// `pixels` must be tightly packed rows of `format`. They are copied to
    /// the GPU by the next [`begin_frame`](Self::begin_frame).
    pub fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        pixels: Option<&[u8]>,
        format: TextureFormat,
    ) -> RenderResult<TextureHandle> {
        if let Some(pixels) = pixels {
            let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
            if pixels.len() != expected {
                log::error!("Texture {name}: pixel data size mismatch");
                return Err(RenderError::PixelDataSizeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: pixels.len(),
                });
            }
        }

        let id = self.backend.create_texture(&TextureDesc {
            label: name.to_string(),
            width,
            height,
            format,
            initial_state: TEXTURE_STEADY_STATE,
        })?;
        let mut texture = Texture::new(name, width, height, format, id);

        if let Some(pixels) = pixels {
            let footprint = self.backend.texture_footprint(id)?;
            texture.staging = Some(buffer::create_buffer(
                &mut self.backend,
                &format!("{name}.staging"),
                BufferKind::Upload,
                footprint.total_bytes,
                false,
            )?);
            texture.pixels = Some(pixels.to_vec());
        }

        let has_pixels = texture.has_pending_upload();
        let handle = self.textures.insert(texture);
        if has_pixels {
            self.uploads.enqueue(handle);
        }
        log::debug!("Created texture {name} ({width}x{height}) as {handle}");
        Ok(handle)
    }

    /// Destroy a texture once every frame that may sample it completed.
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> RenderResult<()> {
        let texture = self.textures.remove(handle)?;
        if let Some(staging) = texture.staging {
            self.frames.retire(Retired::Buffer(staging));
        }
        self.frames.retire(Retired::Texture(texture.id));
        log::debug!("Destroyed texture {}", texture.name);
        Ok(())
    }

    /// Create a buffer whose heap, initial state and flags follow `kind`.
    pub fn create_buffer(
        &mut self,
        label: &str,
        kind: BufferKind,
        size: u64,
        zero_init: bool,
    ) -> RenderResult<GpuBuffer> {
        buffer::create_buffer(&mut self.backend, label, kind, size, zero_init)
    }

    /// Destroy a buffer once every frame that may use it completed.
    pub fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        self.frames.retire(Retired::Buffer(buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::WHITE;

    fn renderer() -> Renderer<SoftwareBackend> {
        let config = RendererConfig {
            max_draw_commands: 64,
            max_descriptors_per_frame: 32,
            thread_group_size: 16,
            validation: true,
            ..Default::default()
        };
        Renderer::software(128, 128, config).unwrap()
    }

    #[test]
    fn test_pixel_size_is_checked() {
        let mut r = renderer();
        let err = r
            .create_texture("bad", 2, 2, Some(&[0; 15]), TextureFormat::Rgba8Unorm)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::PixelDataSizeMismatch {
                expected: 16,
                actual: 15,
                ..
            }
        ));
    }

    #[test]
    fn test_texture_without_pixels_is_not_queued() {
        let mut r = renderer();
        r.create_texture("empty", 4, 4, None, TextureFormat::Rgba8Unorm)
            .unwrap();
        assert_eq!(r.pending_uploads(), 0);
    }

    #[test]
    fn test_draw_stamps_current_transform() {
        let mut r = renderer();
        let tex = r
            .create_texture("t", 1, 1, None, TextureFormat::Rgba8Unorm)
            .unwrap();
        r.translate(10.0, 20.0);
        r.scale(2.0);
        r.draw_sprite(0.0, 0.0, 4.0, 4.0, WHITE, tex).unwrap();
        assert_eq!(r.batch_len(), 1);
        assert_eq!(r.current_transform().translation, [10.0, 20.0]);
        r.reset_sprite_batch();
        assert_eq!(r.batch_len(), 0);
    }

    #[test]
    fn test_destroyed_texture_released_after_frame() {
        let mut r = renderer();
        let tex = r
            .create_texture("t", 1, 1, None, TextureFormat::Rgba8Unorm)
            .unwrap();
        let id = r.texture(tex).unwrap().id();

        let frame = r.begin_frame().unwrap();
        r.destroy_texture(tex).unwrap();
        r.end_frame().unwrap();
        assert!(r.backend().texture_state(id).is_some());

        r.wait_for_all().unwrap();
        assert!(r.backend().texture_state(id).is_none());
        assert!(r.flush(frame).is_err());
    }

    #[test]
    fn test_destroy_returns_backend() {
        let r = renderer();
        let backend = r.destroy().unwrap();
        assert!(backend.validation_errors().is_empty());
    }
}
