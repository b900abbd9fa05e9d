//! One-time CPU to GPU texture uploads.
//!
//! Textures created with pixel data are queued here and copied to the GPU by
//! the next `begin_frame`. Each texture goes through the queue exactly once:
//! its scratch pixels are taken when processed, so a second pass finds
//! nothing to do.

use crate::backend::{CommandListId, GpuBackend, ResourceState};
use crate::barrier::{BarrierBatcher, DEFAULT_BATCH_CAPACITY};
use crate::error::RenderResult;
use crate::frame::Retired;
use crate::texture::{TextureHandle, TextureRegistry, TextureStates, TEXTURE_STEADY_STATE};

/// Textures waiting for their first upload.
#[derive(Debug, Default)]
pub struct TextureUploadQueue {
    pending: Vec<TextureHandle>,
    uploaded: u64,
}

impl TextureUploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, texture: TextureHandle) {
        self.pending.push(texture);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total textures uploaded over the queue's lifetime.
    pub fn uploaded_count(&self) -> u64 {
        self.uploaded
    }

    /// Record the uploads of every pending texture into `list`.
    ///
    /// Staging buffers are handed to `retired` so they outlive the copy.
    /// Returns the number of textures uploaded.
    pub fn process<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        list: CommandListId,
        textures: &mut TextureRegistry,
        retired: &mut Vec<Retired>,
    ) -> RenderResult<usize> {
        let pending: Vec<TextureHandle> = self
            .pending
            .drain(..)
            .filter(|&handle| match textures.get(handle) {
                Some(texture) => texture.has_pending_upload(),
                None => {
                    log::debug!("Dropping upload of destroyed texture {handle}");
                    false
                }
            })
            .collect();

        // Barriers for a chunk must fit in one batch.
        let mut barriers: BarrierBatcher = BarrierBatcher::new();
        for chunk in pending.chunks(DEFAULT_BATCH_CAPACITY) {
            for &handle in chunk {
                let texture = textures.expect_mut(handle)?;
                let Some(pixels) = texture.pixels.as_deref() else {
                    continue;
                };
                let Some(staging) = texture.staging.as_ref() else {
                    continue;
                };
                let footprint = backend.texture_footprint(texture.id)?;
                let row_size = footprint.row_size as usize;
                for row in 0..footprint.row_count as usize {
                    let src = &pixels[row * row_size..(row + 1) * row_size];
                    backend.write_buffer(staging.id(), row as u64 * footprint.row_pitch, src)?;
                }
                barriers.transition(&mut texture.resource, ResourceState::CopyDest)?;
            }
            barriers.flush(backend, list);

            for &handle in chunk {
                let texture = textures.expect_mut(handle)?;
                let Some(staging) = texture.staging.take() else {
                    continue;
                };
                let footprint = backend.texture_footprint(texture.id)?;
                backend.cmd_copy_buffer_to_texture(list, texture.id, staging.id(), footprint);
                barriers.transition(&mut texture.resource, TEXTURE_STEADY_STATE)?;
                texture.pixels = None;
                texture.states.insert(TextureStates::UPLOADED);
                retired.push(Retired::Buffer(staging));
                log::debug!(
                    "Uploaded texture {} ({}x{})",
                    texture.name,
                    texture.width,
                    texture.height
                );
            }
            barriers.flush(backend, list);
        }

        self.uploaded += pending.len() as u64;
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::backend::{TextureDesc, TextureFormat};
    use crate::buffer::{create_buffer, BufferKind};
    use crate::texture::Texture;

    fn setup() -> (SoftwareBackend, CommandListId) {
        let mut backend = SoftwareBackend::new(64, 64).unwrap();
        let list = backend.create_command_list("uploads").unwrap();
        backend.reset_command_list(list).unwrap();
        (backend, list)
    }

    fn texture_with_pixels(backend: &mut SoftwareBackend, name: &str) -> Texture {
        let id = backend
            .create_texture(&TextureDesc {
                label: name.to_string(),
                width: 2,
                height: 2,
                format: TextureFormat::Rgba8Unorm,
                initial_state: TEXTURE_STEADY_STATE,
            })
            .unwrap();
        let footprint = backend.texture_footprint(id).unwrap();
        let mut texture = Texture::new(name, 2, 2, TextureFormat::Rgba8Unorm, id);
        texture.staging = Some(
            create_buffer(backend, name, BufferKind::Upload, footprint.total_bytes, false)
                .unwrap(),
        );
        texture.pixels = Some(vec![0x7f; 16]);
        texture
    }

    #[test]
    fn test_copy_recorded_between_barriers() {
        let (mut backend, list) = setup();
        let mut textures = TextureRegistry::new();
        let mut queue = TextureUploadQueue::new();
        let mut retired = Vec::new();
        let handle = textures.insert(texture_with_pixels(&mut backend, "a"));
        queue.enqueue(handle);

        let uploaded = queue
            .process(&mut backend, list, &mut textures, &mut retired)
            .unwrap();
        assert_eq!(uploaded, 1);
        assert_eq!(backend.recorded_command_count(list), 3);
        assert_eq!(retired.len(), 1);

        let texture = textures.get(handle).unwrap();
        assert!(texture.is_uploaded());
        assert!(!texture.has_pending_upload());
        assert_eq!(texture.state(), TEXTURE_STEADY_STATE);
        assert!(queue.is_empty());
        assert_eq!(queue.uploaded_count(), 1);

        // Nothing left for a second pass.
        let again = queue
            .process(&mut backend, list, &mut textures, &mut retired)
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(backend.recorded_command_count(list), 3);
    }

    #[test]
    fn test_barriers_chunked_to_batch_capacity() {
        let (mut backend, list) = setup();
        let mut textures = TextureRegistry::new();
        let mut queue = TextureUploadQueue::new();
        let mut retired = Vec::new();
        for i in 0..DEFAULT_BATCH_CAPACITY + 2 {
            let handle = textures.insert(texture_with_pixels(&mut backend, &format!("t{i}")));
            queue.enqueue(handle);
        }

        queue
            .process(&mut backend, list, &mut textures, &mut retired)
            .unwrap();
        // Per chunk: one barrier batch, one copy per texture, one barrier batch.
        let expected = (DEFAULT_BATCH_CAPACITY + 2) + 2 * 2;
        assert_eq!(backend.recorded_command_count(list), expected);
        assert_eq!(retired.len(), DEFAULT_BATCH_CAPACITY + 2);
    }

    #[test]
    fn test_destroyed_texture_is_dropped() {
        let (mut backend, list) = setup();
        let mut textures = TextureRegistry::new();
        let mut queue = TextureUploadQueue::new();
        let mut retired = Vec::new();
        let handle = textures.insert(texture_with_pixels(&mut backend, "gone"));
        queue.enqueue(handle);
        textures.remove(handle).unwrap();

        let uploaded = queue
            .process(&mut backend, list, &mut textures, &mut retired)
            .unwrap();
        assert_eq!(uploaded, 0);
        assert_eq!(backend.recorded_command_count(list), 0);
        assert!(retired.is_empty());
    }
}
