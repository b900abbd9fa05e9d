//! Resource storage and command execution of the software backend.
//!
//! Commands are checked against the actual state of each resource at the
//! point they execute. Violations are logged and collected as
//! [`ValidationError`]s; the offending command is skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use super::kernel::{ComputeKernel, Dispatch};
use crate::backend::types::*;
use crate::backend::{BufferId, PipelineId, TextureId};

/// A command recorded into a software command list.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Barriers(Vec<Barrier>),
    CopyBuffer {
        dst: BufferId,
        dst_offset: u64,
        src: BufferId,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        dst: TextureId,
        src: BufferId,
        footprint: TextureFootprint,
    },
    SetDescriptorTable(GpuDescriptorHandle),
    SetComputePipeline(PipelineId),
    SetConstants(Vec<u32>),
    Dispatch([u32; 3]),
    BeginRenderPass {
        target: TextureId,
        clear: Option<[f32; 4]>,
    },
    EndRenderPass,
    SetRenderPipeline(PipelineId),
    SetVertexBuffer {
        buffer: BufferId,
        stride: u32,
    },
    DrawIndirect {
        args: BufferId,
        offset: u64,
    },
}

/// A rule broken by executed GPU work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{list}: barrier on {resource:?} expects {expected:?} but resource is {actual:?}")]
    StateMismatch {
        list: String,
        resource: ResourceId,
        expected: ResourceState,
        actual: ResourceState,
    },
    #[error("{list}: {operation} requires {resource:?} in {required}, found {actual:?}")]
    WrongState {
        list: String,
        operation: &'static str,
        resource: ResourceId,
        required: &'static str,
        actual: ResourceState,
    },
    #[error("{list}: dispatch reads {buffer:?} written by an earlier dispatch without a UAV barrier")]
    MissingUavBarrier { list: String, buffer: BufferId },
    #[error("{list}: {detail}")]
    Invalid { list: String, detail: String },
}

/// Counters of executed GPU work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub submissions: u64,
    pub commands: u64,
    pub barrier_commands: u64,
    pub barriers: u64,
    pub buffer_copies: u64,
    pub texture_copies: u64,
    pub dispatches: u64,
    pub draws: u64,
    pub presents: u64,
    pub signals: u64,
}

/// Snapshot of one executed indirect draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCapture {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub start_vertex: u32,
    pub start_instance: u32,
    pub stride: u32,
    pub target: TextureId,
    /// Bytes of the drawn vertex range.
    pub vertices: Vec<u8>,
}

pub(crate) struct SoftBuffer {
    pub label: String,
    pub heap: HeapLocation,
    pub words: Vec<u32>,
    pub state: ResourceState,
}

pub(crate) struct SoftTexture {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub texels: Vec<u8>,
    pub state: ResourceState,
}

pub(crate) enum Pipeline {
    Compute {
        name: String,
        kernel: Arc<dyn ComputeKernel>,
    },
    Render {
        label: String,
        /// Byte offset of the per-vertex texture index, if any.
        texture_attribute: Option<u32>,
    },
}

#[derive(Default)]
struct ExecState {
    table_base: Option<u64>,
    compute: Option<PipelineId>,
    render: Option<PipelineId>,
    constants: Vec<u32>,
    vertex_buffer: Option<(BufferId, u32)>,
    render_target: Option<TextureId>,
    /// Buffers written by a dispatch and not yet ordered by a barrier.
    unflushed_writes: HashSet<BufferId>,
}

#[derive(Default)]
pub(crate) struct DeviceState {
    pub buffers: HashMap<BufferId, SoftBuffer>,
    pub textures: HashMap<TextureId, SoftTexture>,
    pub heap: Vec<Option<DescriptorView>>,
    pub pipelines: HashMap<PipelineId, Pipeline>,
    pub stats: BackendStats,
    pub errors: Vec<ValidationError>,
    pub draws: Vec<DrawCapture>,
    pub validation: bool,
}

fn bytes(words: &[u32]) -> &[u8] {
    bytemuck::cast_slice(words)
}

fn bytes_mut(words: &mut [u32]) -> &mut [u8] {
    bytemuck::cast_slice_mut(words)
}

impl DeviceState {
    pub fn new(validation: bool) -> Self {
        Self {
            validation,
            ..Default::default()
        }
    }

    fn report(&mut self, error: ValidationError) {
        log::error!("Validation: {error}");
        self.errors.push(error);
    }

    fn invalid(&mut self, list: &str, detail: String) {
        self.report(ValidationError::Invalid {
            list: list.to_string(),
            detail,
        });
    }

    fn resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        match resource {
            ResourceId::Buffer(id) => self.buffers.get(&id).map(|b| b.state),
            ResourceId::Texture(id) => self.textures.get(&id).map(|t| t.state),
        }
    }

    fn set_resource_state(&mut self, resource: ResourceId, state: ResourceState) {
        match resource {
            ResourceId::Buffer(id) => {
                if let Some(buffer) = self.buffers.get_mut(&id) {
                    buffer.state = state;
                }
            }
            ResourceId::Texture(id) => {
                if let Some(texture) = self.textures.get_mut(&id) {
                    texture.state = state;
                }
            }
        }
    }

    /// Check `resource` is in one of `allowed`. Reports and returns false
    /// otherwise.
    fn require(
        &mut self,
        list: &str,
        operation: &'static str,
        resource: ResourceId,
        allowed: &[ResourceState],
        required: &'static str,
    ) -> bool {
        let Some(actual) = self.resource_state(resource) else {
            self.invalid(list, format!("{operation} uses unknown resource {resource:?}"));
            return false;
        };
        if !self.validation || allowed.contains(&actual) {
            return true;
        }
        self.report(ValidationError::WrongState {
            list: list.to_string(),
            operation,
            resource,
            required,
            actual,
        });
        false
    }

    pub fn execute(&mut self, list: &str, commands: Vec<Command>) {
        self.stats.submissions += 1;
        let mut exec = ExecState::default();
        for command in commands {
            self.stats.commands += 1;
            match command {
                Command::Barriers(barriers) => self.barriers(list, &mut exec, &barriers),
                Command::CopyBuffer {
                    dst,
                    dst_offset,
                    src,
                    src_offset,
                    size,
                } => self.copy_buffer(list, dst, dst_offset, src, src_offset, size),
                Command::CopyBufferToTexture {
                    dst,
                    src,
                    footprint,
                } => self.copy_buffer_to_texture(list, dst, src, footprint),
                Command::SetDescriptorTable(base) => exec.table_base = Some(base.0),
                Command::SetComputePipeline(pipeline) => exec.compute = Some(pipeline),
                Command::SetConstants(constants) => exec.constants = constants,
                Command::Dispatch(groups) => self.dispatch(list, &mut exec, groups),
                Command::BeginRenderPass { target, clear } => {
                    self.begin_render_pass(list, &mut exec, target, clear)
                }
                Command::EndRenderPass => exec.render_target = None,
                Command::SetRenderPipeline(pipeline) => exec.render = Some(pipeline),
                Command::SetVertexBuffer { buffer, stride } => {
                    exec.vertex_buffer = Some((buffer, stride))
                }
                Command::DrawIndirect { args, offset } => {
                    self.draw_indirect(list, &exec, args, offset)
                }
            }
        }
    }

    fn barriers(&mut self, list: &str, exec: &mut ExecState, barriers: &[Barrier]) {
        self.stats.barrier_commands += 1;
        for barrier in barriers {
            self.stats.barriers += 1;
            match *barrier {
                Barrier::Transition {
                    resource,
                    before,
                    after,
                } => {
                    let Some(actual) = self.resource_state(resource) else {
                        self.invalid(list, format!("barrier on unknown resource {resource:?}"));
                        continue;
                    };
                    if self.validation && actual != before {
                        self.report(ValidationError::StateMismatch {
                            list: list.to_string(),
                            resource,
                            expected: before,
                            actual,
                        });
                    }
                    self.set_resource_state(resource, after);
                    if let ResourceId::Buffer(id) = resource {
                        exec.unflushed_writes.remove(&id);
                    }
                }
                Barrier::UnorderedAccess { resource } => match resource {
                    Some(ResourceId::Buffer(id)) => {
                        exec.unflushed_writes.remove(&id);
                    }
                    Some(ResourceId::Texture(_)) => {}
                    None => exec.unflushed_writes.clear(),
                },
            }
        }
    }

    fn copy_buffer(
        &mut self,
        list: &str,
        dst: BufferId,
        dst_offset: u64,
        src: BufferId,
        src_offset: u64,
        size: u64,
    ) {
        let dst_ok = self.require(
            list,
            "copy",
            ResourceId::Buffer(dst),
            &[ResourceState::CopyDest],
            "CopyDest",
        );
        let src_ok = self.require(
            list,
            "copy",
            ResourceId::Buffer(src),
            &[ResourceState::CopySource, ResourceState::GenericRead],
            "CopySource or GenericRead",
        );
        if !(dst_ok && src_ok) {
            return;
        }
        if dst == src {
            self.invalid(list, format!("copy from {src:?} onto itself"));
            return;
        }

        let (src_start, dst_start, len) = (src_offset as usize, dst_offset as usize, size as usize);
        let Some(data) = self
            .buffers
            .get(&src)
            .and_then(|b| bytes(&b.words).get(src_start..src_start + len))
            .map(<[u8]>::to_vec)
        else {
            self.invalid(list, format!("copy source range out of bounds on {src:?}"));
            return;
        };
        let Some(target) = self
            .buffers
            .get_mut(&dst)
            .and_then(|b| bytes_mut(&mut b.words).get_mut(dst_start..dst_start + len))
        else {
            self.invalid(list, format!("copy destination range out of bounds on {dst:?}"));
            return;
        };
        target.copy_from_slice(&data);
        self.stats.buffer_copies += 1;
    }

    fn copy_buffer_to_texture(
        &mut self,
        list: &str,
        dst: TextureId,
        src: BufferId,
        footprint: TextureFootprint,
    ) {
        let dst_ok = self.require(
            list,
            "texture copy",
            ResourceId::Texture(dst),
            &[ResourceState::CopyDest],
            "CopyDest",
        );
        let src_ok = self.require(
            list,
            "texture copy",
            ResourceId::Buffer(src),
            &[ResourceState::CopySource, ResourceState::GenericRead],
            "CopySource or GenericRead",
        );
        if !(dst_ok && src_ok) {
            return;
        }
        let (Some(buffer), Some(texture)) = (self.buffers.get(&src), self.textures.get_mut(&dst))
        else {
            return;
        };
        let staged = bytes(&buffer.words);
        if (staged.len() as u64) < footprint.total_bytes {
            let detail = format!(
                "staging buffer {} holds {} bytes, footprint needs {}",
                buffer.label,
                staged.len(),
                footprint.total_bytes
            );
            self.invalid(list, detail);
            return;
        }
        let row_size = footprint.row_size as usize;
        for row in 0..footprint.row_count as usize {
            let src_start = row * footprint.row_pitch as usize;
            let dst_start = row * row_size;
            texture.texels[dst_start..dst_start + row_size]
                .copy_from_slice(&staged[src_start..src_start + row_size]);
        }
        self.stats.texture_copies += 1;
    }

    fn dispatch(&mut self, list: &str, exec: &mut ExecState, groups: [u32; 3]) {
        self.stats.dispatches += 1;
        let Some(base) = exec.table_base else {
            self.invalid(list, "dispatch without a descriptor table".into());
            return;
        };
        let kernel = match exec.compute.and_then(|p| self.pipelines.get(&p)) {
            Some(Pipeline::Compute { name, kernel }) => {
                log::trace!("Dispatch {name} {groups:?}");
                kernel.clone()
            }
            _ => {
                self.invalid(list, "dispatch without a compute pipeline".into());
                return;
            }
        };

        // Resolve bindings to buffer ranges.
        let mut resolved: Vec<(BufferId, usize, usize)> = Vec::new();
        for binding in kernel.bindings() {
            let slot = (base + binding.slot as u64) as usize;
            let Some(Some(DescriptorView::StorageBuffer {
                buffer,
                offset,
                size,
            })) = self.heap.get(slot).copied()
            else {
                self.invalid(list, format!("descriptor slot {slot} is not a storage buffer"));
                return;
            };
            if !self.require(
                list,
                "dispatch",
                ResourceId::Buffer(buffer),
                &[ResourceState::UnorderedAccess],
                "UnorderedAccess",
            ) {
                return;
            }
            if self.validation && exec.unflushed_writes.contains(&buffer) {
                self.report(ValidationError::MissingUavBarrier {
                    list: list.to_string(),
                    buffer,
                });
            }
            if resolved.iter().any(|(b, _, _)| *b == buffer) {
                self.invalid(list, format!("buffer {buffer:?} bound twice in one dispatch"));
                return;
            }
            resolved.push((buffer, offset as usize / 4, size as usize / 4));
        }

        // Move the bound storage out of the map so the kernel can borrow
        // every view mutably at once.
        let mut storage: Vec<(BufferId, Vec<u32>)> = resolved
            .iter()
            .map(|(id, _, _)| {
                let words = self
                    .buffers
                    .get_mut(id)
                    .map(|b| std::mem::take(&mut b.words))
                    .unwrap_or_default();
                (*id, words)
            })
            .collect();

        let mut views = Vec::with_capacity(storage.len());
        let mut in_bounds = true;
        for ((_, words), (_, first, len)) in storage.iter_mut().zip(&resolved) {
            match words.get_mut(*first..*first + *len) {
                Some(view) => views.push(view),
                None => {
                    in_bounds = false;
                    break;
                }
            }
        }
        let result = if in_bounds {
            kernel.dispatch(Dispatch {
                groups,
                constants: &exec.constants,
                views,
            })
        } else {
            drop(views);
            Err("storage view exceeds its buffer".to_string())
        };

        for (id, words) in storage.drain(..) {
            if let Some(buffer) = self.buffers.get_mut(&id) {
                buffer.words = words;
            }
        }
        if let Err(detail) = result {
            self.invalid(list, detail);
            return;
        }
        for (binding, (buffer, _, _)) in kernel.bindings().iter().zip(&resolved) {
            if binding.writes {
                exec.unflushed_writes.insert(*buffer);
            }
        }
    }

    fn begin_render_pass(
        &mut self,
        list: &str,
        exec: &mut ExecState,
        target: TextureId,
        clear: Option<[f32; 4]>,
    ) {
        exec.render_target = Some(target);
        if !self.require(
            list,
            "render pass",
            ResourceId::Texture(target),
            &[ResourceState::RenderTarget],
            "RenderTarget",
        ) {
            return;
        }
        let Some(clear) = clear else {
            return;
        };
        if let Some(texture) = self.textures.get_mut(&target) {
            let texel = clear.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
            let bpp = texture.format.bytes_per_pixel() as usize;
            for pixel in texture.texels.chunks_exact_mut(bpp) {
                pixel.copy_from_slice(&texel[..bpp]);
            }
        }
    }

    fn draw_indirect(&mut self, list: &str, exec: &ExecState, args: BufferId, offset: u64) {
        self.stats.draws += 1;
        let Some(target) = exec.render_target else {
            self.invalid(list, "draw outside a render pass".into());
            return;
        };
        let texture_attribute = match exec.render.and_then(|p| self.pipelines.get(&p)) {
            Some(Pipeline::Render {
                label,
                texture_attribute,
            }) => {
                log::trace!("Draw with {label}");
                *texture_attribute
            }
            _ => {
                self.invalid(list, "draw without a render pipeline".into());
                return;
            }
        };
        let Some((vertex_buffer, stride)) = exec.vertex_buffer else {
            self.invalid(list, "draw without a vertex buffer".into());
            return;
        };
        let checks = [
            self.require(
                list,
                "draw",
                ResourceId::Buffer(args),
                &[ResourceState::IndirectArgument],
                "IndirectArgument",
            ),
            self.require(
                list,
                "draw",
                ResourceId::Buffer(vertex_buffer),
                &[ResourceState::VertexAndConstantBuffer],
                "VertexAndConstantBuffer",
            ),
            self.require(
                list,
                "draw",
                ResourceId::Texture(target),
                &[ResourceState::RenderTarget],
                "RenderTarget",
            ),
        ];
        if checks.contains(&false) {
            return;
        }

        let first = offset as usize / 4;
        let Some(words) = self
            .buffers
            .get(&args)
            .and_then(|b| b.words.get(first..first + 4))
        else {
            self.invalid(list, "indirect arguments out of bounds".into());
            return;
        };
        let (vertex_count, instance_count, start_vertex, start_instance) =
            (words[0], words[1], words[2], words[3]);

        let start = start_vertex as usize * stride as usize;
        let end = start + vertex_count as usize * stride as usize;
        let Some(vertices) = self
            .buffers
            .get(&vertex_buffer)
            .and_then(|b| bytes(&b.words).get(start..end))
            .map(<[u8]>::to_vec)
        else {
            self.invalid(list, format!("draw of {vertex_count} vertices overruns vertex buffer"));
            return;
        };

        if let (Some(attribute), Some(base)) = (texture_attribute, exec.table_base) {
            self.validate_vertex_textures(list, &vertices, stride, attribute, base);
        }

        log::trace!("Draw indirect: {vertex_count} vertices, {instance_count} instances");
        self.draws.push(DrawCapture {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
            stride,
            target,
            vertices,
        });
    }

    /// Every texture index carried by a drawn vertex must resolve to a
    /// shader-readable texture in the bound table.
    fn validate_vertex_textures(
        &mut self,
        list: &str,
        vertices: &[u8],
        stride: u32,
        attribute: u32,
        base: u64,
    ) {
        if !self.validation || stride == 0 {
            return;
        }
        let indices: HashSet<u32> = vertices
            .chunks_exact(stride as usize)
            .filter_map(|v| v.get(attribute as usize..attribute as usize + 4))
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        for index in indices {
            let slot = (base + index as u64) as usize;
            match self.heap.get(slot).copied().flatten() {
                Some(DescriptorView::Texture(texture)) => {
                    self.require(
                        list,
                        "sample",
                        ResourceId::Texture(texture),
                        &[
                            ResourceState::PixelShaderResource,
                            ResourceState::AllShaderResource,
                        ],
                        "a shader resource state",
                    );
                }
                _ => self.invalid(
                    list,
                    format!("vertex texture index {index} (slot {slot}) is not a texture view"),
                ),
            }
        }
    }

    pub fn present(&mut self, backbuffer: TextureId) {
        self.stats.presents += 1;
        self.require(
            "present",
            "present",
            ResourceId::Texture(backbuffer),
            &[ResourceState::Present],
            "Present",
        );
    }
}
