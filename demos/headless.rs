//! Headless sprite renderer driver.
//!
//! Renders a field of drifting, spinning sprites on the software backend and
//! reports what the GPU culled and drew each frame.
//!
//! ```bash
//! cargo run --example headless -- --sprites 100000 --frames 120
//! ```

use std::time::Instant;

use clap::Parser;

use sprite_engine::color::pack_rgba_f32;
use sprite_engine::{OrFatal, Renderer, RendererConfig, TextureFormat};

/// Headless GPU-driven sprite renderer demo.
#[derive(Parser, Debug)]
#[command(name = "headless", version)]
struct Args {
    /// Viewport width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Viewport height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Sprites submitted per frame.
    #[arg(long, default_value = "20000")]
    sprites: u32,

    /// Frames to render before exiting.
    #[arg(long, default_value = "60")]
    frames: u64,

    /// Frames the CPU may record ahead of the GPU.
    #[arg(long, default_value = "3")]
    frames_in_flight: usize,

    /// Swap-chain images.
    #[arg(long, default_value = "2")]
    backbuffers: usize,

    /// Validate every executed command against resource states.
    #[arg(long)]
    validation: bool,

    /// Present with vertical sync.
    #[arg(long)]
    vsync: bool,
}

/// 8x8 checkerboard in two greys.
fn checkerboard() -> Vec<u8> {
    (0..64)
        .flat_map(|i| {
            let light = ((i % 8) + (i / 8)) % 2 == 0;
            let v = if light { 0xe0 } else { 0x60 };
            [v, v, v, 0xff]
        })
        .collect()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RendererConfig {
        frame_count: args.frames_in_flight,
        backbuffer_count: args.backbuffers,
        max_draw_commands: args.sprites.max(1),
        validation: args.validation,
        ..Default::default()
    };
    let mut renderer =
        Renderer::software(args.width, args.height, config).or_fatal("renderer init");

    let checker = renderer
        .create_texture("checker", 8, 8, Some(&checkerboard()), TextureFormat::Rgba8Unorm)
        .or_fatal("checker texture");
    let white = renderer
        .create_texture("white", 1, 1, Some(&[0xff; 4]), TextureFormat::Rgba8Unorm)
        .or_fatal("white texture");

    // Spread sprites over three times the viewport so most are culled.
    let span_x = args.width as f32 * 3.0;
    let span_y = args.height as f32 * 3.0;
    let start = Instant::now();
    let mut drawn_vertices = 0u64;

    for frame_number in 0..args.frames {
        let t = frame_number as f32 / 60.0;
        let frame = renderer.begin_frame().or_fatal("begin_frame");

        renderer.reset_sprite_batch();
        for i in 0..args.sprites {
            let seed = i as f32 * 0.618_034;
            let x = (seed * 7919.0 + t * 40.0) % span_x - args.width as f32;
            let y = (seed * 104_729.0 + t * 25.0) % span_y - args.height as f32;
            let texture = if i % 3 == 0 { white } else { checker };
            let color = pack_rgba_f32(seed.fract(), (seed * 3.0).fract(), 0.8, 1.0);

            renderer.load_identity();
            renderer.translate(x, y);
            renderer.rotate(t + seed);
            renderer.scale(1.0 + (i % 4) as f32 * 0.5);
            renderer
                .draw_sprite(-8.0, -8.0, 16.0, 16.0, color, texture)
                .or_fatal("draw_sprite");
        }

        let stats = renderer.flush(frame).or_fatal("flush");
        renderer.end_frame().or_fatal("end_frame");
        renderer.present(args.vsync).or_fatal("present");

        // Draws of earlier frames are complete once their slot is reused.
        for draw in renderer.backend_mut().take_draws() {
            drawn_vertices += draw.vertex_count as u64;
        }
        log::debug!(
            "Frame {}: {} sprites in {} groups, {} descriptors",
            frame_number,
            stats.commands,
            stats.groups,
            stats.descriptors
        );
    }

    renderer.wait_for_all().or_fatal("wait_for_all");
    for draw in renderer.backend_mut().take_draws() {
        drawn_vertices += draw.vertex_count as u64;
    }

    let elapsed = start.elapsed();
    let backend_stats = renderer.backend().stats();
    let errors = renderer.backend().validation_errors();
    log::info!(
        "{} frames in {:.2?} ({:.1} fps)",
        args.frames,
        elapsed,
        args.frames as f64 / elapsed.as_secs_f64()
    );
    log::info!(
        "{} of {} sprites visible on average",
        drawn_vertices / 6 / args.frames.max(1),
        args.sprites
    );
    log::info!(
        "{} submissions, {} dispatches, {} draws, {} barriers",
        backend_stats.submissions,
        backend_stats.dispatches,
        backend_stats.draws,
        backend_stats.barriers
    );
    for error in &errors {
        log::error!("{error}");
    }

    renderer.destroy().or_fatal("destroy");
    if !errors.is_empty() {
        std::process::exit(1);
    }
}
