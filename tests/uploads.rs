//! Texture uploads through the frame ring.

mod common;

use rstest::rstest;

use common::*;
use sprite_engine::backend::ResourceState;
use sprite_engine::TextureFormat;

fn gradient(width: u32, height: u32) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| [i as u8, (i >> 8) as u8, 0x80, 0xff])
        .collect()
}

#[test]
fn test_texture_uploads_exactly_once() {
    let mut r = renderer(test_config());
    let pixels = gradient(3, 5);
    let texture = r
        .create_texture("gradient", 3, 5, Some(&pixels), TextureFormat::Rgba8Unorm)
        .unwrap();
    assert_eq!(r.pending_uploads(), 1);
    assert!(!r.texture(texture).unwrap().is_uploaded());

    r.begin_frame().unwrap();
    assert_eq!(r.pending_uploads(), 0);
    assert!(r.texture(texture).unwrap().is_uploaded());
    r.end_frame().unwrap();

    for _ in 0..4 {
        r.begin_frame().unwrap();
        r.end_frame().unwrap();
    }
    r.wait_for_all().unwrap();

    assert_eq!(r.backend().stats().texture_copies, 1);
    let id = r.texture(texture).unwrap().id();
    assert_eq!(r.backend().texture_data(id).unwrap(), pixels);
    assert_eq!(
        r.backend().texture_state(id),
        Some(ResourceState::PixelShaderResource)
    );
    assert!(r.backend().validation_errors().is_empty());
}

#[rstest]
#[case::single_batch(3)]
#[case::exactly_one_batch(10)]
#[case::several_batches(23)]
fn test_many_uploads_in_one_frame(#[case] count: u32) {
    let mut r = renderer(test_config());
    let textures: Vec<_> = (0..count)
        .map(|i| {
            let pixels = vec![i as u8; 4 * 4 * 4];
            r.create_texture(&format!("t{i}"), 4, 4, Some(&pixels), TextureFormat::Rgba8Unorm)
                .unwrap()
        })
        .collect();

    r.begin_frame().unwrap();
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();

    assert_eq!(r.backend().stats().texture_copies, count as u64);
    for (i, &texture) in textures.iter().enumerate() {
        let id = r.texture(texture).unwrap().id();
        assert!(r.backend().texture_data(id).unwrap().iter().all(|&b| b == i as u8));
    }
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_texture_created_mid_frame_uploads_next_frame() {
    let mut r = renderer(test_config());
    r.begin_frame().unwrap();
    let texture = white_texture(&mut r);
    r.end_frame().unwrap();
    assert_eq!(r.pending_uploads(), 1);

    r.begin_frame().unwrap();
    assert!(r.texture(texture).unwrap().is_uploaded());
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();
    assert_eq!(r.backend().stats().texture_copies, 1);
}

#[test]
fn test_destroyed_before_upload_is_skipped() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);
    r.destroy_texture(texture).unwrap();

    r.begin_frame().unwrap();
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();

    assert_eq!(r.backend().stats().texture_copies, 0);
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_staging_buffer_released_after_upload() {
    let mut r = renderer(test_config());
    let before = r.backend().buffer_count();
    white_texture(&mut r);
    assert_eq!(r.backend().buffer_count(), before + 1);

    r.begin_frame().unwrap();
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();
    assert_eq!(r.backend().buffer_count(), before);
}

#[test]
fn test_uploaded_texture_is_drawable_in_same_frame() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);
    draw_centered(&mut r, 0, 400.0, 300.0, 16.0, texture);
    render_frame(&mut r);

    let draws = r.backend_mut().take_draws();
    assert_eq!(draws[0].vertex_count, 6);
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_wait_inside_frame_keeps_staging_alive() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);

    r.begin_frame().unwrap();
    r.wait_for_all().unwrap();
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();

    let id = r.texture(texture).unwrap().id();
    assert_eq!(r.backend().texture_data(id).unwrap(), vec![0xff; 4]);
    assert_eq!(r.backend().stats().texture_copies, 1);
    let errors = r.backend().validation_errors();
    assert!(errors.is_empty(), "{errors:?}");
}
