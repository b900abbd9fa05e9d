//! Sprite textures and their registry.
//!
//! Textures live in a generational arena so callers hold plain copyable
//! [`TextureHandle`]s. A handle to a destroyed texture never aliases a newer
//! one occupying the same slot.

use std::fmt;

use bitflags::bitflags;

use crate::backend::{ResourceId, ResourceState, TextureFormat, TextureId};
use crate::barrier::TrackedResource;
use crate::buffer::GpuBuffer;
use crate::error::{RenderError, RenderResult};

bitflags! {
    /// Lifecycle flags of a texture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureStates: u32 {
        const CREATED = 1 << 0;
        const UPLOADED = 1 << 1;
        /// Referenced by the current sprite batch. Cleared at flush.
        const BOUND = 1 << 2;
    }
}

/// Steady-state access mode of sprite textures.
pub const TEXTURE_STEADY_STATE: ResourceState = ResourceState::PixelShaderResource;

/// Generational reference to a texture in a [`TextureRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// A sampled image plus its pending upload, if any.
#[derive(Debug)]
pub struct Texture {
    pub(crate) name: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: TextureFormat,
    pub(crate) id: TextureId,
    pub(crate) resource: TrackedResource,
    pub(crate) states: TextureStates,
    /// Tightly packed pixels awaiting upload. Freed once uploaded.
    pub(crate) pixels: Option<Vec<u8>>,
    pub(crate) staging: Option<GpuBuffer>,
    /// Transient bind index, valid while [`TextureStates::BOUND`] is set.
    pub(crate) bind_index: Option<u32>,
}

impl Texture {
    pub(crate) fn new(
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        id: TextureId,
    ) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            format,
            id,
            resource: TrackedResource::new(ResourceId::Texture(id), TEXTURE_STEADY_STATE),
            states: TextureStates::CREATED,
            pixels: None,
            staging: None,
            bind_index: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn states(&self) -> TextureStates {
        self.states
    }

    pub fn state(&self) -> ResourceState {
        self.resource.state()
    }

    pub fn is_uploaded(&self) -> bool {
        self.states.contains(TextureStates::UPLOADED)
    }

    pub fn has_pending_upload(&self) -> bool {
        self.pixels.is_some()
    }

    pub fn bind_index(&self) -> Option<u32> {
        self.bind_index
    }

    pub(crate) fn unbind(&mut self) {
        self.states.remove(TextureStates::BOUND);
        self.bind_index = None;
    }
}

struct Slot {
    generation: u32,
    texture: Option<Texture>,
}

/// Arena of live textures.
#[derive(Default)]
pub struct TextureRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl TextureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, texture: Texture) -> TextureHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.texture = Some(texture);
            return TextureHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            texture: Some(texture),
        });
        TextureHandle {
            index,
            generation: 0,
        }
    }

    /// Remove a texture, invalidating every handle to it.
    pub fn remove(&mut self, handle: TextureHandle) -> RenderResult<Texture> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| RenderError::InvalidTexture(handle.to_string()))?;
        let texture = slot
            .texture
            .take()
            .ok_or_else(|| RenderError::InvalidTexture(handle.to_string()))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(texture)
    }

    pub fn get(&self, handle: TextureHandle) -> Option<&Texture> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.texture.as_ref())
    }

    pub fn get_mut(&mut self, handle: TextureHandle) -> Option<&mut Texture> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.texture.as_mut())
    }

    /// Like [`get_mut`](Self::get_mut) but reports unknown handles as errors.
    pub fn expect_mut(&mut self, handle: TextureHandle) -> RenderResult<&mut Texture> {
        self.get_mut(handle)
            .ok_or_else(|| RenderError::InvalidTexture(handle.to_string()))
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Texture> {
        self.slots.iter_mut().filter_map(|slot| slot.texture.as_mut())
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Texture> + '_ {
        self.free.clear();
        self.slots.drain(..).filter_map(|slot| slot.texture)
    }
}
