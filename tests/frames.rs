//! Frame ring and present synchronisation on the software backend.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::rstest;

use common::*;
use sprite_engine::backend::software::GpuGate;
use sprite_engine::backend::ResourceState;
use sprite_engine::frame::FrameState;
use sprite_engine::{GpuBackend, RenderError, RendererConfig, TextureFormat};

/// Resume `gate` after a delay, raising `resumed` first.
fn resume_later(gate: GpuGate, resumed: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        resumed.store(true, Ordering::SeqCst);
        gate.resume();
    })
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(4)]
fn test_slot_reuse_waits_for_previous_use(#[case] frame_count: usize) {
    let mut r = renderer(RendererConfig {
        frame_count,
        ..test_config()
    });
    let texture = white_texture(&mut r);

    for serial in 0..3 * frame_count {
        let frame = r.begin_frame().unwrap();
        assert_eq!(frame.index(), serial % frame_count);
        assert_eq!(frame.serial(), serial as u64 + 1);

        let slot = r.frames().frame(frame.index());
        let completed = r.backend().completed_value(slot.fence());
        assert!(completed >= slot.wait_value());
        assert_eq!(slot.state(), FrameState::Recording);

        draw_centered(&mut r, serial, 400.0, 300.0, 8.0, texture);
        r.flush(frame).unwrap();
        r.reset_sprite_batch();
        r.end_frame().unwrap();
        r.present(false).unwrap();
    }
    r.wait_for_all().unwrap();

    for index in 0..frame_count {
        assert_eq!(r.frames().frame(index).wait_value(), 3);
        assert_eq!(r.frames().frame(index).state(), FrameState::Idle);
    }
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_begin_blocks_while_slot_in_flight() {
    let mut r = renderer(test_config());
    let gate = r.backend().gate();
    gate.pause();

    // Fill the ring; none of these submissions can complete.
    for _ in 0..3 {
        r.begin_frame().unwrap();
        r.end_frame().unwrap();
    }
    let fence = r.frames().frame(0).fence();
    assert_eq!(r.backend().completed_value(fence), 0);

    let resumed = Arc::new(AtomicBool::new(false));
    let resumer = resume_later(gate, resumed.clone());

    let frame = r.begin_frame().unwrap();
    assert!(resumed.load(Ordering::SeqCst));
    assert_eq!(frame.index(), 0);
    assert!(r.backend().completed_value(fence) >= 1);

    resumer.join().unwrap();
    r.end_frame().unwrap();
    r.wait_for_all().unwrap();
}

#[test]
fn test_present_blocks_while_all_backbuffers_queued() {
    let mut r = renderer(test_config());
    let gate = r.backend().gate();
    gate.pause();

    // Two backbuffers: two presents may be outstanding.
    r.present(true).unwrap();
    r.present(true).unwrap();
    assert_eq!(r.frames().present_fence_value(), 2);

    let resumed = Arc::new(AtomicBool::new(false));
    let resumer = resume_later(gate, resumed.clone());

    r.present(true).unwrap();
    assert!(resumed.load(Ordering::SeqCst));
    assert_eq!(r.frames().present_fence_value(), 3);

    resumer.join().unwrap();
    r.wait_for_all().unwrap();
    assert_eq!(r.backend().stats().presents, 3);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
fn test_present_index_cycles_backbuffers(#[case] backbuffer_count: usize) {
    let mut r = renderer(RendererConfig {
        backbuffer_count,
        ..test_config()
    });
    for presented in 1..=7u64 {
        r.begin_frame().unwrap();
        r.end_frame().unwrap();
        r.present(false).unwrap();
        assert_eq!(r.frames().present_fence_value(), presented);
        assert_eq!(
            r.frames().present_index(),
            (presented % backbuffer_count as u64) as usize
        );
    }
    r.wait_for_all().unwrap();
    assert!(r.backend().validation_errors().is_empty());
}

#[test]
fn test_backbuffer_returns_to_present_state() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);

    let frame = r.begin_frame().unwrap();
    draw_centered(&mut r, 0, 10.0, 10.0, 4.0, texture);
    r.flush(frame).unwrap();
    let index = r.frames().present_index();
    assert_eq!(r.frames().backbuffer_state(index), ResourceState::RenderTarget);

    r.end_frame().unwrap();
    assert_eq!(r.frames().backbuffer_state(index), ResourceState::Present);

    r.wait_for_all().unwrap();
    let target = r.backend().backbuffer(index);
    assert_eq!(r.backend().texture_state(target), Some(ResourceState::Present));
}

#[test]
fn test_each_frame_draws_its_own_batch() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);

    for frame_number in 0..6 {
        r.reset_sprite_batch();
        for index in 0..=frame_number {
            draw_centered(&mut r, index, 50.0 + 60.0 * index as f32, 300.0, 8.0, texture);
        }
        let frame = r.begin_frame().unwrap();
        r.flush(frame).unwrap();
        r.end_frame().unwrap();
        r.present(false).unwrap();
    }
    r.wait_for_all().unwrap();

    let draws = r.backend_mut().take_draws();
    assert_eq!(draws.len(), 6);
    for (frame_number, draw) in draws.iter().enumerate() {
        assert_eq!(draw.vertex_count as usize, 6 * (frame_number + 1));
        assert_eq!(survivors(draw), (0..=frame_number).collect::<HashSet<_>>());
    }
}

#[test]
fn test_long_run_stays_validation_clean() {
    let mut r = renderer(test_config());
    let mut textures = vec![white_texture(&mut r)];

    for frame_number in 0..24usize {
        if frame_number % 5 == 0 {
            let shade = (frame_number * 10) as u8;
            textures.push(
                r.create_texture(
                    &format!("shade{frame_number}"),
                    2,
                    2,
                    Some(&[shade; 16]),
                    TextureFormat::Rgba8Unorm,
                )
                .unwrap(),
            );
        }
        if frame_number % 7 == 6 && textures.len() > 1 {
            let texture = textures.remove(0);
            r.destroy_texture(texture).unwrap();
        }

        let frame = r.begin_frame().unwrap();
        r.reset_sprite_batch();
        for index in 0..32 {
            let texture = textures[index % textures.len()];
            let x = (index * 37 + frame_number * 13) as f32 % 900.0 - 50.0;
            let y = (index * 53 + frame_number * 7) as f32 % 700.0 - 50.0;
            draw_centered(&mut r, index, x, y, 24.0, texture);
        }
        r.flush(frame).unwrap();
        r.end_frame().unwrap();
        r.present(frame_number % 2 == 0).unwrap();
    }
    r.wait_for_all().unwrap();

    let errors = r.backend().validation_errors();
    assert!(errors.is_empty(), "{errors:?}");
    let stats = r.backend().stats();
    assert_eq!(stats.draws, 24);
    assert_eq!(stats.dispatches, 48);
    assert_eq!(stats.presents, 24);

    let backend = r.destroy().unwrap();
    assert_eq!(backend.buffer_count(), 0);
    assert!(backend.validation_errors().is_empty());
}

#[test]
fn test_flush_outside_frame_is_rejected() {
    let mut r = renderer(test_config());
    let frame = r.begin_frame().unwrap();
    r.end_frame().unwrap();
    assert!(matches!(r.flush(frame), Err(RenderError::FrameNotRecording)));
    assert!(matches!(r.end_frame(), Err(RenderError::FrameNotRecording)));
}

#[test]
fn test_wait_inside_frame_defers_destruction() {
    let mut r = renderer(test_config());
    let texture = white_texture(&mut r);
    render_frame(&mut r);
    let id = r.texture(texture).unwrap().id();

    let frame = r.begin_frame().unwrap();
    draw_centered(&mut r, 0, 400.0, 300.0, 16.0, texture);
    r.flush(frame).unwrap();
    r.destroy_texture(texture).unwrap();
    r.wait_for_all().unwrap();
    assert!(r.backend().texture_state(id).is_some());

    r.end_frame().unwrap();
    r.wait_for_all().unwrap();
    assert!(r.backend().texture_state(id).is_none());

    let draws = r.backend_mut().take_draws();
    assert_eq!(draws.last().unwrap().vertex_count, 6);
    let errors = r.backend().validation_errors();
    assert!(errors.is_empty(), "{errors:?}");
}
