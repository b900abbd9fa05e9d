//! CPU-side list of draw commands for the next flush.

use super::{DrawCommand, Rect, Transform2D};
use crate::error::{RenderError, RenderResult};
use crate::texture::{TextureHandle, TextureRegistry, TextureStates};

/// Draw commands plus the textures they reference, in bind order.
///
/// A texture gets its bind index the first time it is drawn after a reset.
/// Bind indices are only meaningful for the flush that consumes the batch.
#[derive(Debug)]
pub struct SpriteBatch {
    commands: Vec<DrawCommand>,
    bound: Vec<TextureHandle>,
    capacity: usize,
}

impl SpriteBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            commands: Vec::new(),
            bound: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    /// Textures in bind-index order.
    pub fn bound_textures(&self) -> &[TextureHandle] {
        &self.bound
    }

    /// Append one sprite.
    ///
    /// Fails when the batch is full or `texture` does not name a live
    /// texture; the batch is unchanged in both cases.
    pub fn push(
        &mut self,
        textures: &mut TextureRegistry,
        rect: Rect,
        transform: Transform2D,
        color: u32,
        texture: TextureHandle,
    ) -> RenderResult<()> {
        if self.commands.len() >= self.capacity {
            log::error!("Reached limit of {} draw commands", self.capacity);
            return Err(RenderError::DrawCommandCapacityExceeded {
                capacity: self.capacity,
            });
        }
        let image = textures.get_mut(texture).ok_or_else(|| {
            log::error!("Draw references unknown texture {texture}");
            RenderError::InvalidTexture(texture.to_string())
        })?;

        let texture_id = match image.bind_index {
            Some(index) if image.states.contains(TextureStates::BOUND) => index,
            _ => {
                let index = self.bound.len() as u32;
                image.bind_index = Some(index);
                image.states.insert(TextureStates::BOUND);
                self.bound.push(texture);
                index
            }
        };

        self.commands.push(DrawCommand {
            rect: rect.to_array(),
            transform: transform.to_array(),
            color,
            texture_id,
        });
        Ok(())
    }

    /// Clear the bound state of every referenced texture. The batch keeps
    /// its commands and bind order.
    pub fn release_bindings(&mut self, textures: &mut TextureRegistry) {
        for &handle in &self.bound {
            if let Some(texture) = textures.get_mut(handle) {
                texture.unbind();
            }
        }
    }

    /// Drop all commands and bindings.
    pub fn reset(&mut self, textures: &mut TextureRegistry) {
        self.release_bindings(textures);
        self.commands.clear();
        self.bound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TextureFormat, TextureId};
    use crate::texture::Texture;

    fn registry_with(count: u64) -> (TextureRegistry, Vec<TextureHandle>) {
        let mut registry = TextureRegistry::new();
        let handles = (0..count)
            .map(|i| {
                registry.insert(Texture::new(
                    "t",
                    1,
                    1,
                    TextureFormat::Rgba8Unorm,
                    TextureId(i + 1),
                ))
            })
            .collect();
        (registry, handles)
    }

    fn push(
        batch: &mut SpriteBatch,
        textures: &mut TextureRegistry,
        texture: TextureHandle,
    ) -> RenderResult<()> {
        batch.push(
            textures,
            Rect::new(0.0, 0.0, 1.0, 1.0),
            Transform2D::IDENTITY,
            0,
            texture,
        )
    }

    #[test]
    fn test_textures_bound_once_in_draw_order() {
        let (mut textures, handles) = registry_with(2);
        let mut batch = SpriteBatch::new(8);
        for &h in &[handles[1], handles[0], handles[1]] {
            push(&mut batch, &mut textures, h).unwrap();
        }

        assert_eq!(batch.bound_textures(), &[handles[1], handles[0]]);
        let ids: Vec<u32> = batch.commands().iter().map(|c| c.texture_id).collect();
        assert_eq!(ids, vec![0, 1, 0]);
        assert_eq!(textures.get(handles[0]).unwrap().bind_index(), Some(1));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let (mut textures, handles) = registry_with(1);
        let mut batch = SpriteBatch::new(2);
        push(&mut batch, &mut textures, handles[0]).unwrap();
        push(&mut batch, &mut textures, handles[0]).unwrap();
        assert!(matches!(
            push(&mut batch, &mut textures, handles[0]),
            Err(RenderError::DrawCommandCapacityExceeded { capacity: 2 })
        ));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_unknown_texture_is_rejected() {
        let (mut textures, handles) = registry_with(1);
        textures.remove(handles[0]).unwrap();
        let mut batch = SpriteBatch::new(2);
        assert!(matches!(
            push(&mut batch, &mut textures, handles[0]),
            Err(RenderError::InvalidTexture(_))
        ));
        assert!(batch.is_empty());
    }

    #[test]
    fn test_reset_unbinds() {
        let (mut textures, handles) = registry_with(1);
        let mut batch = SpriteBatch::new(2);
        push(&mut batch, &mut textures, handles[0]).unwrap();
        batch.reset(&mut textures);

        assert!(batch.is_empty());
        assert!(batch.bound_textures().is_empty());
        let texture = textures.get(handles[0]).unwrap();
        assert!(!texture.states().contains(TextureStates::BOUND));
    }
}
