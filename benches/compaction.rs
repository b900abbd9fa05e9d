use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sprite_engine::sprite::{quad_vertices, Transform2D};
use sprite_engine::{color, DrawCommand, Renderer, RendererConfig, TextureFormat};

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

// ---------------------------------------------------------------------------
// CPU side
// ---------------------------------------------------------------------------

fn bench_batch_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_push");
    for count in [1_000u32, 100_000] {
        let config = RendererConfig {
            max_draw_commands: count,
            ..Default::default()
        };
        let mut renderer = Renderer::software(WIDTH, HEIGHT, config).unwrap();
        let texture = renderer
            .create_texture("white", 1, 1, None, TextureFormat::Rgba8Unorm)
            .unwrap();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                renderer.reset_sprite_batch();
                for i in 0..count {
                    renderer.load_identity();
                    renderer.translate(i as f32, i as f32 * 0.5);
                    renderer.rotate(0.01);
                    renderer
                        .draw_sprite(-4.0, -4.0, 8.0, 8.0, color::WHITE, texture)
                        .unwrap();
                }
                black_box(renderer.batch_len());
            });
        });
    }
    group.finish();
}

fn bench_quad_vertices(c: &mut Criterion) {
    let command = DrawCommand {
        rect: [-8.0, -8.0, 16.0, 16.0],
        transform: Transform2D {
            translation: [300.0, 200.0],
            rotation: 0.7,
            scale: 1.5,
        }
        .to_array(),
        color: color::WHITE,
        texture_id: 0,
    };
    c.bench_function("quad_vertices", |b| {
        b.iter(|| black_box(quad_vertices(black_box(&command), 5)));
    });
}

// ---------------------------------------------------------------------------
// Full frame on the software backend
// ---------------------------------------------------------------------------

fn bench_software_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("software_frame");
    group.sample_size(20);
    for count in [1_000u32, 50_000] {
        let config = RendererConfig {
            max_draw_commands: count,
            validation: false,
            ..Default::default()
        };
        let mut renderer = Renderer::software(WIDTH, HEIGHT, config).unwrap();
        let texture = renderer
            .create_texture("white", 1, 1, Some(&[0xff; 4]), TextureFormat::Rgba8Unorm)
            .unwrap();

        // Half the sprites fall outside the viewport.
        for i in 0..count {
            let x = (i % 400) as f32 * 9.6 - WIDTH as f32 / 2.0;
            let y = (i / 400) as f32 * 8.0 % (HEIGHT as f32 * 2.0) - HEIGHT as f32 / 2.0;
            renderer.load_identity();
            renderer.translate(x, y);
            renderer
                .draw_sprite(-4.0, -4.0, 8.0, 8.0, color::WHITE, texture)
                .unwrap();
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let frame = renderer.begin_frame().unwrap();
                black_box(renderer.flush(frame).unwrap());
                renderer.end_frame().unwrap();
                renderer.present(false).unwrap();
                renderer.wait_for_all().unwrap();
                renderer.backend_mut().take_draws();
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_batch_push,
    bench_quad_vertices,
    bench_software_frame,
);
criterion_main!(benches);
