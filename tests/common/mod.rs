//! Shared helpers for the software-backend integration tests.

#![allow(dead_code)]

use std::collections::HashSet;

use sprite_engine::backend::software::DrawCapture;
use sprite_engine::color;
use sprite_engine::{
    FrameHandle, Renderer, RendererConfig, SoftwareBackend, SpriteVertex, TextureFormat,
    TextureHandle,
};

pub const VIEWPORT_WIDTH: u32 = 800;
pub const VIEWPORT_HEIGHT: u32 = 600;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small capacities and group size, validation on.
pub fn test_config() -> RendererConfig {
    RendererConfig {
        max_draw_commands: 256,
        max_descriptors_per_frame: 64,
        thread_group_size: 16,
        validation: true,
        ..Default::default()
    }
}

pub fn renderer(config: RendererConfig) -> Renderer<SoftwareBackend> {
    init_logger();
    Renderer::software(VIEWPORT_WIDTH, VIEWPORT_HEIGHT, config)
        .expect("software renderer should initialize")
}

/// A 1x1 white texture.
pub fn white_texture(renderer: &mut Renderer<SoftwareBackend>) -> TextureHandle {
    renderer
        .create_texture(
            "white",
            1,
            1,
            Some(&[255, 255, 255, 255]),
            TextureFormat::Rgba8Unorm,
        )
        .expect("texture creation should succeed")
}

/// Color uniquely identifying sprite `index` in captured vertices.
pub fn sprite_color(index: usize) -> u32 {
    color::pack_rgba(index as u8, (index >> 8) as u8, 0x40, 0xff)
}

/// A `size` x `size` sprite centered on (`x`, `y`), tagged with `index`.
pub fn draw_centered(
    renderer: &mut Renderer<SoftwareBackend>,
    index: usize,
    x: f32,
    y: f32,
    size: f32,
    texture: TextureHandle,
) {
    renderer.push_matrix();
    renderer.translate(x, y);
    renderer
        .draw_sprite(
            -size / 2.0,
            -size / 2.0,
            size,
            size,
            sprite_color(index),
            texture,
        )
        .expect("sprite should fit in the batch");
    renderer.pop_matrix();
}

/// Flush the batch into a fresh frame, submit it and wait for the GPU.
pub fn render_frame(renderer: &mut Renderer<SoftwareBackend>) -> FrameHandle {
    let frame = renderer.begin_frame().expect("begin_frame");
    renderer.flush(frame).expect("flush");
    renderer.end_frame().expect("end_frame");
    renderer.present(false).expect("present");
    renderer.wait_for_all().expect("wait_for_all");
    frame
}

pub fn vertices(draw: &DrawCapture) -> Vec<SpriteVertex> {
    bytemuck::pod_collect_to_vec(&draw.vertices)
}

/// Indices of the sprites whose vertices appear in `draw`.
pub fn survivors(draw: &DrawCapture) -> HashSet<usize> {
    vertices(draw)
        .iter()
        .map(|v| {
            let [r, g, _, _] = color::unpack_rgba(v.color);
            r as usize | (g as usize) << 8
        })
        .collect()
}
