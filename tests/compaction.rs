//! End-to-end tests of the cull / generate / indirect draw pipeline on the
//! software backend.

mod common;

use std::collections::HashSet;
use std::f32::consts::FRAC_PI_4;

use rstest::rstest;

use common::*;
use sprite_engine::sprite::{overlaps_viewport, Transform2D, COMPUTE_VIEW_COUNT};
use sprite_engine::{DrawCommand, RenderError, RendererConfig, TextureFormat};

#[rstest]
#[case::submitted_in_order(&[0, 1, 2])]
#[case::reversed(&[2, 1, 0])]
#[case::culled_first(&[2, 0, 1])]
fn test_three_sprite_scenario(#[case] order: &[usize]) {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);
    let centers = [(100.0, 100.0), (700.0, 500.0), (10_000.0, 10_000.0)];

    for &index in order {
        let (x, y) = centers[index];
        draw_centered(&mut r, index, x, y, 32.0, texture);
    }
    render_frame(&mut r);

    let draws = r.backend_mut().take_draws();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].vertex_count, 12);
    assert_eq!(draws[0].instance_count, 1);
    assert_eq!(survivors(&draws[0]), HashSet::from([0, 1]));
    assert!(r.backend().validation_errors().is_empty());
}

/// Sprites straddling, touching and missing every viewport edge, plus
/// rotated ones whose bounding box differs from their local rectangle.
fn edge_commands() -> Vec<(f32, f32, f32, Transform2D)> {
    let at = |x: f32, y: f32| Transform2D {
        translation: [x, y],
        ..Transform2D::IDENTITY
    };
    let rotated = |x: f32, y: f32| Transform2D {
        translation: [x, y],
        rotation: -FRAC_PI_4,
        scale: 1.0,
    };
    vec![
        // Fully inside.
        (0.0, 0.0, 50.0, at(10.0, 10.0)),
        // Straddling the left and top edges.
        (0.0, 0.0, 50.0, at(-25.0, -25.0)),
        // Touching the left edge from outside: zero-area overlap.
        (0.0, 0.0, 50.0, at(-50.0, 100.0)),
        // Touching the right edge from outside.
        (0.0, 0.0, 50.0, at(800.0, 100.0)),
        // Touching the bottom edge from outside.
        (0.0, 0.0, 50.0, at(100.0, 600.0)),
        // Straddling the bottom-right corner.
        (0.0, 0.0, 50.0, at(790.0, 590.0)),
        // Far away in every direction.
        (0.0, 0.0, 50.0, at(-5000.0, 300.0)),
        (0.0, 0.0, 50.0, at(300.0, 5000.0)),
        // Rotated: local rect misses, rotated bounding box reaches in.
        (0.0, 0.0, 40.0, rotated(-45.0, 300.0)),
        // Rotated and fully outside.
        (0.0, 0.0, 40.0, rotated(-100.0, 300.0)),
        // Scaled up from far outside into view.
        (-10.0, -10.0, 20.0, Transform2D {
            translation: [-50.0, 300.0],
            rotation: 0.0,
            scale: 10.0,
        }),
    ]
}

#[rstest]
#[case::one_group_per_sprite(1)]
#[case::partial_last_group(4)]
#[case::single_group(64)]
fn test_culling_matches_bounding_box_overlap(#[case] group_size: u32) {
    let mut r = renderer(RendererConfig {
        thread_group_size: group_size,
        ..test_config()
    });
    let texture = white_texture(&mut r);

    let mut expected = HashSet::new();
    for (index, (x, y, size, transform)) in edge_commands().into_iter().enumerate() {
        r.load_identity();
        r.translate(transform.translation[0], transform.translation[1]);
        r.rotate(transform.rotation);
        r.scale(transform.scale);
        r.draw_sprite(x, y, size, size, sprite_color(index), texture)
            .unwrap();

        let command = DrawCommand {
            rect: [x, y, size, size],
            transform: transform.to_array(),
            color: sprite_color(index),
            texture_id: 0,
        };
        if overlaps_viewport(&command, VIEWPORT_WIDTH as f32, VIEWPORT_HEIGHT as f32) {
            expected.insert(index);
        }
    }
    assert_eq!(expected, HashSet::from([0, 1, 5, 8, 10]));

    render_frame(&mut r);
    let draws = r.backend_mut().take_draws();
    assert_eq!(draws[0].vertex_count as usize, expected.len() * 6);
    assert_eq!(survivors(&draws[0]), expected);
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_count_conservation_on_dense_grid() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);

    // 16 x 16 grid of 20px sprites spanning -400..1200 x -300..900.
    let mut expected = HashSet::new();
    for row in 0..16 {
        for col in 0..16 {
            let index = row * 16 + col;
            let x = -400.0 + col as f32 * 100.0;
            let y = -300.0 + row as f32 * 75.0;
            draw_centered(&mut r, index, x, y, 20.0, texture);
            if x + 10.0 > 0.0 && x - 10.0 < 800.0 && y + 10.0 > 0.0 && y - 10.0 < 600.0 {
                expected.insert(index);
            }
        }
    }

    render_frame(&mut r);
    let draws = r.backend_mut().take_draws();
    assert_eq!(draws[0].vertex_count as usize, 6 * expected.len());
    assert_eq!(survivors(&draws[0]), expected);
}

#[test]
fn test_every_survivor_emits_one_full_quad() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);
    for index in 0..40 {
        draw_centered(&mut r, index, 20.0 * index as f32, 300.0, 16.0, texture);
    }
    render_frame(&mut r);

    let draws = r.backend_mut().take_draws();
    let draw = &draws[0];
    let vertices = vertices(draw);
    for quad in vertices.chunks_exact(6) {
        assert!(quad.iter().all(|v| v.color == quad[0].color));
    }
    let colors: HashSet<u32> = vertices.iter().map(|v| v.color).collect();
    assert_eq!(colors.len(), vertices.len() / 6);
}

#[test]
fn test_generated_quads_map_back_to_local_rects() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);

    let sprites = [
        ([-8.0, -4.0, 16.0, 8.0], [200.0, 150.0], 0.3, 2.0),
        ([0.0, 0.0, 30.0, 10.0], [400.0, 300.0], -1.2, 0.5),
        ([-5.0, -5.0, 10.0, 10.0], [600.0, 450.0], 3.0, 4.0),
    ];
    for (index, (rect, translation, rotation, scale)) in sprites.iter().enumerate() {
        r.load_identity();
        r.translate(translation[0], translation[1]);
        r.rotate(*rotation);
        r.scale(*scale);
        r.draw_sprite(rect[0], rect[1], rect[2], rect[3], sprite_color(index), texture)
            .unwrap();
    }
    render_frame(&mut r);

    let draws = r.backend_mut().take_draws();
    let draw = &draws[0];
    let vertices = vertices(draw);
    assert_eq!(vertices.len(), 18);
    for quad in vertices.chunks_exact(6) {
        let index = (0..sprites.len())
            .find(|&i| sprite_color(i) == quad[0].color)
            .unwrap();
        let (rect, translation, rotation, scale) = sprites[index];
        let transform = Transform2D {
            translation,
            rotation,
            scale,
        };

        // Triangle order is TL TR BR, TL BR BL.
        let local: Vec<[f32; 2]> = [0, 1, 2, 5]
            .iter()
            .map(|&i| transform.inverse_apply(quad[i].position))
            .collect();
        let expected = [
            [rect[0], rect[1]],
            [rect[0] + rect[2], rect[1]],
            [rect[0] + rect[2], rect[1] + rect[3]],
            [rect[0], rect[1] + rect[3]],
        ];
        for (corner, want) in local.iter().zip(expected) {
            assert!((corner[0] - want[0]).abs() < 1e-3, "{corner:?} vs {want:?}");
            assert!((corner[1] - want[1]).abs() < 1e-3, "{corner:?} vs {want:?}");
        }
        assert_eq!(
            [quad[0].uv, quad[1].uv, quad[2].uv, quad[5].uv],
            [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]
        );
    }
}

#[test]
fn test_vertex_texture_ids_address_bound_table() {
    let mut r = renderer(test_config());
    let first = white_texture(&mut r);
    let second = r
        .create_texture("second", 2, 2, Some(&[128; 16]), TextureFormat::Rgba8Unorm)
        .unwrap();

    draw_centered(&mut r, 0, 100.0, 100.0, 10.0, second);
    draw_centered(&mut r, 1, 200.0, 100.0, 10.0, first);
    draw_centered(&mut r, 2, 300.0, 100.0, 10.0, second);
    render_frame(&mut r);

    let stats = r.last_flush();
    assert_eq!(stats.textures, 2);
    assert_eq!(stats.descriptors, COMPUTE_VIEW_COUNT + 2);

    let draws = r.backend_mut().take_draws();
    let draw = &draws[0];
    for vertex in vertices(draw) {
        let bind = if vertex.color == sprite_color(1) { 1 } else { 0 };
        assert_eq!(vertex.texture_id, COMPUTE_VIEW_COUNT + bind);
    }
    assert!(r.backend().validation_errors().is_empty());

    // Bindings do not leak into the next batch.
    assert_eq!(r.texture(first).unwrap().bind_index(), None);
    assert_eq!(r.texture(second).unwrap().bind_index(), None);
}

#[test]
fn test_capacity_boundary() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);
    let capacity = r.config().max_draw_commands as usize;

    for index in 0..capacity {
        draw_centered(&mut r, index, 400.0, 300.0, 4.0, texture);
    }
    let err = r
        .draw_sprite(0.0, 0.0, 4.0, 4.0, sprite_color(0), texture)
        .unwrap_err();
    assert!(matches!(
        err,
        RenderError::DrawCommandCapacityExceeded { capacity: 256 }
    ));
    assert_eq!(r.batch_len(), capacity);

    render_frame(&mut r);
    let draws = r.backend_mut().take_draws();
    assert_eq!(draws[0].vertex_count as usize, capacity * 6);
    assert_eq!(r.last_flush().groups, 16);
}

#[test]
fn test_empty_flush_records_nothing() {
    let mut r = renderer(test_config());
    let frame = r.begin_frame().unwrap();
    let list = r.frames().frame(frame.index()).command_list();
    let recorded = r.backend().recorded_command_count(list);
    let backbuffer = r.frames().backbuffer_state(r.frames().present_index());

    let stats = r.flush(frame).unwrap();
    assert_eq!(stats.commands, 0);
    assert_eq!(r.backend().recorded_command_count(list), recorded);
    assert_eq!(
        r.frames().backbuffer_state(r.frames().present_index()),
        backbuffer
    );

    r.end_frame().unwrap();
    r.wait_for_all().unwrap();
    let backend_stats = r.backend().stats();
    assert_eq!(backend_stats.dispatches, 0);
    assert_eq!(backend_stats.draws, 0);
}

#[test]
fn test_batch_is_reset_between_frames() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);

    draw_centered(&mut r, 0, 100.0, 100.0, 10.0, texture);
    render_frame(&mut r);
    r.reset_sprite_batch();
    draw_centered(&mut r, 1, 200.0, 100.0, 10.0, texture);
    draw_centered(&mut r, 2, 300.0, 100.0, 10.0, texture);
    render_frame(&mut r);

    let draws = r.backend_mut().take_draws();
    assert_eq!(draws.len(), 2);
    assert_eq!(survivors(&draws[0]), HashSet::from([0]));
    assert_eq!(survivors(&draws[1]), HashSet::from([1, 2]));
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_draw_with_unknown_texture_fails() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);
    r.destroy_texture(texture).unwrap();
    assert!(matches!(
        r.draw_sprite(0.0, 0.0, 1.0, 1.0, 0, texture),
        Err(RenderError::InvalidTexture(_))
    ));
    assert_eq!(r.batch_len(), 0);
}

#[test]
fn test_two_flushes_in_one_frame() {
    let mut r = renderer(RendererConfig {
        max_draw_commands: 4,
        ..test_config()
    });
    let texture = white_texture(&mut r);

    let frame = r.begin_frame().unwrap();
    draw_centered(&mut r, 0, 100.0, 100.0, 10.0, texture);
    draw_centered(&mut r, 1, 200.0, 100.0, 10.0, texture);
    r.flush(frame).unwrap();
    r.reset_sprite_batch();
    draw_centered(&mut r, 2, 300.0, 100.0, 10.0, texture);
    r.flush(frame).unwrap();

    // Three of the four command slots of the frame are already staged.
    r.reset_sprite_batch();
    draw_centered(&mut r, 3, 400.0, 100.0, 10.0, texture);
    draw_centered(&mut r, 4, 500.0, 100.0, 10.0, texture);
    assert!(matches!(
        r.flush(frame),
        Err(RenderError::DrawCommandCapacityExceeded { capacity: 4 })
    ));
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();

    let draws = r.backend_mut().take_draws();
    assert_eq!(draws.len(), 2);
    assert_eq!(survivors(&draws[0]), HashSet::from([0, 1]));
    assert_eq!(survivors(&draws[1]), HashSet::from([2]));
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_init_rejects_kernel_group_size_mismatch() {
    use std::sync::Arc;

    use sprite_engine::backend::BackendError;
    use sprite_engine::shader::{CULL_SHADER, GENERATE_SHADER};
    use sprite_engine::sprite::{CullKernel, GenerateKernel};
    use sprite_engine::{Renderer, ShaderSet, SoftwareBackend};

    init_logger();
    let mut backend = SoftwareBackend::new(VIEWPORT_WIDTH, VIEWPORT_HEIGHT).unwrap();
    backend.register_kernel(CULL_SHADER, Arc::new(CullKernel::new(1024)));
    backend.register_kernel(GENERATE_SHADER, Arc::new(GenerateKernel::new(1024)));

    // Dispatch counts would assume 2048 threads per group.
    let config = RendererConfig {
        thread_group_size: 2048,
        ..test_config()
    };
    let result = Renderer::init(backend, config, &ShaderSet::builtin());
    assert!(matches!(
        result,
        Err(RenderError::Backend(BackendError::PipelineCreationFailed(_)))
    ));
}

#[test]
fn test_flush_with_destroyed_texture_leaves_frame_untouched() {
    let mut r = renderer(RendererConfig {
        max_draw_commands: 2,
        ..test_config()
    });
    let white = white_texture(&mut r);
    let doomed = white_texture(&mut r);

    let frame = r.begin_frame().unwrap();
    let list = r.frames().frame(frame.index()).command_list();
    let recorded = r.backend().recorded_command_count(list);

    draw_centered(&mut r, 0, 100.0, 100.0, 10.0, white);
    draw_centered(&mut r, 1, 200.0, 100.0, 10.0, doomed);
    r.destroy_texture(doomed).unwrap();
    assert!(matches!(r.flush(frame), Err(RenderError::InvalidTexture(_))));
    assert_eq!(r.backend().recorded_command_count(list), recorded);
    assert_eq!(r.texture(white).unwrap().bind_index(), None);

    // The failed flush staged nothing, so the full capacity is still free.
    r.reset_sprite_batch();
    draw_centered(&mut r, 2, 300.0, 100.0, 10.0, white);
    draw_centered(&mut r, 3, 400.0, 100.0, 10.0, white);
    r.flush(frame).unwrap();
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();

    let draws = r.backend_mut().take_draws();
    assert_eq!(draws.len(), 1);
    assert_eq!(survivors(&draws[0]), HashSet::from([2, 3]));
    let errors = r.backend().validation_errors();
    assert!(errors.is_empty(), "{errors:?}");
}

#[test]
fn test_descriptor_exhaustion_records_nothing() {
    let mut r = renderer(RendererConfig {
        max_descriptors_per_frame: COMPUTE_VIEW_COUNT * 2 + 2,
        ..test_config()
    });
    let a = white_texture(&mut r);
    let b = white_texture(&mut r);

    let frame = r.begin_frame().unwrap();
    draw_centered(&mut r, 0, 100.0, 100.0, 10.0, a);
    draw_centered(&mut r, 1, 200.0, 100.0, 10.0, b);
    r.flush(frame).unwrap();

    let list = r.frames().frame(frame.index()).command_list();
    let recorded = r.backend().recorded_command_count(list);
    r.reset_sprite_batch();
    draw_centered(&mut r, 2, 300.0, 100.0, 10.0, a);
    draw_centered(&mut r, 3, 400.0, 100.0, 10.0, b);
    assert!(matches!(
        r.flush(frame),
        Err(RenderError::DescriptorCapacityExceeded { .. })
    ));
    assert_eq!(r.backend().recorded_command_count(list), recorded);
    assert_eq!(r.texture(a).unwrap().bind_index(), None);
    assert_eq!(r.texture(b).unwrap().bind_index(), None);

    r.reset_sprite_batch();
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();
    assert_eq!(r.backend_mut().take_draws().len(), 1);
    assert!(r.backend().validation_errors().is_empty());
}
