//! The sprite compaction pipeline: upload, cull, generate, indirect draw.
//!
//! Every ring slot owns its own set of flush buffers, so recording frame
//! `k + 1` never touches memory the GPU may still read for frame `k`. Within
//! a frame the passes are ordered purely by barriers:
//!
//! ```text
//! copy commands / clear counter + args   (CopyDest)
//!   -> cull                              (UnorderedAccess)
//!   -> UAV barrier
//!   -> generate                          (UnorderedAccess)
//!   -> draw indirect                     (VertexAndConstantBuffer, IndirectArgument)
//! ```
//!
//! The CPU never reads the survivor count back.

use super::kernels::PassConstants;
use super::{
    slots, DrawCommand, IndirectDrawArgs, SpriteBatch, SpriteVertex, COMPUTE_VIEW_COUNT,
    SPRITE_VERTEX_COUNT,
};
use crate::backend::{
    DescriptorView, GpuBackend, PipelineId, RenderPipelineDesc, ResourceId,
    ResourceState, VertexAttribute, VertexFormat,
};
use crate::barrier::BarrierBatcher;
use crate::buffer::{create_buffer, destroy_buffer, BufferKind, GpuBuffer};
use crate::error::{RenderError, RenderResult};
use crate::frame::RecordingContext;
use crate::shader::ShaderSet;
use crate::texture::TextureRegistry;

const COMMAND_SIZE: u64 = std::mem::size_of::<DrawCommand>() as u64;
const QUAD_SIZE: u64 = SPRITE_VERTEX_COUNT as u64 * SpriteVertex::SIZE as u64;
const COUNTER_SIZE: u64 = 4;

/// What the CPU recorded for one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStats {
    pub commands: u32,
    pub textures: u32,
    pub groups: u32,
    pub descriptors: u32,
}

/// Flush buffers of one ring slot.
#[derive(Debug)]
struct FlushBuffers {
    /// Frame serial the upload cursor belongs to.
    serial: u64,
    /// Commands already staged in `upload` by earlier flushes of the frame.
    staged: u32,
    upload: GpuBuffer,
    commands: GpuBuffer,
    visible: GpuBuffer,
    counter: GpuBuffer,
    args: GpuBuffer,
    vertices: GpuBuffer,
}

impl FlushBuffers {
    fn create<B: GpuBackend>(backend: &mut B, index: usize, capacity: u64) -> RenderResult<Self> {
        let label = |name: &str| format!("sprites.{name}[{index}]");
        Ok(Self {
            serial: 0,
            staged: 0,
            upload: create_buffer(
                backend,
                &label("upload"),
                BufferKind::Upload,
                capacity * COMMAND_SIZE,
                false,
            )?,
            commands: create_buffer(
                backend,
                &label("commands"),
                BufferKind::Unordered,
                capacity * COMMAND_SIZE,
                false,
            )?,
            visible: create_buffer(
                backend,
                &label("visible"),
                BufferKind::Unordered,
                capacity * 4,
                false,
            )?,
            counter: create_buffer(
                backend,
                &label("counter"),
                BufferKind::Unordered,
                COUNTER_SIZE,
                true,
            )?,
            args: create_buffer(
                backend,
                &label("args"),
                BufferKind::Unordered,
                IndirectDrawArgs::SIZE,
                true,
            )?,
            vertices: create_buffer(
                backend,
                &label("vertices"),
                BufferKind::Unordered,
                capacity * QUAD_SIZE,
                false,
            )?,
        })
    }

    fn destroy<B: GpuBackend>(self, backend: &mut B) {
        for buffer in [
            self.upload,
            self.commands,
            self.visible,
            self.counter,
            self.args,
            self.vertices,
        ] {
            destroy_buffer(backend, buffer);
        }
    }
}

/// GPU objects of the compaction pipeline.
pub struct SpritePipeline {
    frames: Vec<FlushBuffers>,
    counter_zero: GpuBuffer,
    args_template: GpuBuffer,
    cull: PipelineId,
    generate: PipelineId,
    render: PipelineId,
    capacity: u32,
    group_size: u32,
    clear_color: [f32; 4],
}

impl SpritePipeline {
    /// Create pipelines and per-frame buffers sized for `capacity` sprites.
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        shaders: &ShaderSet,
        frame_count: usize,
        capacity: u32,
        group_size: u32,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let cull = backend.create_compute_pipeline(&shaders.cull, group_size)?;
        let generate = backend.create_compute_pipeline(&shaders.generate, group_size)?;
        let render = backend.create_render_pipeline(&RenderPipelineDesc {
            label: "sprites.render".into(),
            vertex: shaders.vertex.clone(),
            pixel: shaders.pixel.clone(),
            vertex_stride: SpriteVertex::SIZE,
            vertex_attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x2,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x2,
                    offset: 8,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Unorm8x4,
                    offset: 16,
                },
                VertexAttribute {
                    location: 3,
                    format: VertexFormat::Uint32,
                    offset: 20,
                },
            ],
            target_format: backend.backbuffer_format(),
            alpha_blend: true,
        })?;

        // Templates are written once and only ever copied from.
        let counter_zero = create_buffer(
            backend,
            "sprites.counter_zero",
            BufferKind::Upload,
            COUNTER_SIZE,
            true,
        )?;
        let args_template = create_buffer(
            backend,
            "sprites.args_template",
            BufferKind::Upload,
            IndirectDrawArgs::SIZE,
            true,
        )?;
        backend.write_buffer(
            args_template.id(),
            0,
            bytemuck::bytes_of(&IndirectDrawArgs::CLEARED),
        )?;

        let frames = (0..frame_count)
            .map(|index| FlushBuffers::create(backend, index, capacity as u64))
            .collect::<RenderResult<Vec<_>>>()?;

        log::info!(
            "Sprite pipeline: {} sprites per flush, {} threads per group",
            capacity,
            group_size
        );

        Ok(Self {
            frames,
            counter_zero,
            args_template,
            cull,
            generate,
            render,
            capacity,
            group_size,
            clear_color,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Record the whole compaction pipeline for `batch` into the recording
    /// frame `serial`.
    ///
    /// An empty batch records nothing. Texture bindings of the batch are
    /// released afterwards. All flushes of one frame stage their commands in
    /// the slot's upload buffer, so together they are bounded by the
    /// capacity.
    pub fn flush<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        ctx: RecordingContext<'_>,
        serial: u64,
        batch: &mut SpriteBatch,
        textures: &mut TextureRegistry,
    ) -> RenderResult<FlushStats> {
        let count = batch.len() as u32;
        if count == 0 {
            return Ok(FlushStats::default());
        }

        let list = ctx.frame.command_list();
        let buffers = &mut self.frames[ctx.frame.index()];
        if buffers.serial != serial {
            buffers.serial = serial;
            buffers.staged = 0;
        }
        if buffers.staged + count > self.capacity {
            log::error!(
                "Flush of {} sprites exceeds capacity {} ({} already staged this frame)",
                count,
                self.capacity,
                buffers.staged
            );
            return Err(RenderError::DrawCommandCapacityExceeded {
                capacity: self.capacity as usize,
            });
        }

        // Resolve textures and reserve descriptors before recording anything.
        let bound = batch.bound_textures();
        let texture_count = bound.len() as u32;
        let prepared = bound
            .iter()
            .map(|&handle| {
                textures
                    .get(handle)
                    .map(|texture| texture.id())
                    .ok_or_else(|| RenderError::InvalidTexture(handle.to_string()))
            })
            .collect::<RenderResult<Vec<_>>>()
            .and_then(|ids| {
                let range = ctx
                    .frame
                    .table_mut()?
                    .allocate(COMPUTE_VIEW_COUNT + texture_count)?;
                Ok((ids, range))
            });
        let (texture_ids, range) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                log::error!("Flush of {count} sprites failed: {e}");
                batch.release_bindings(textures);
                return Err(e);
            }
        };

        let staging_offset = buffers.staged as u64 * COMMAND_SIZE;
        buffers.staged += count;
        let command_bytes = count as u64 * COMMAND_SIZE;
        let mut barriers: BarrierBatcher = BarrierBatcher::new();

        // Upload and reset.
        backend.write_buffer(
            buffers.upload.id(),
            staging_offset,
            bytemuck::cast_slice(batch.commands()),
        )?;
        barriers.transition(buffers.commands.tracked_mut(), ResourceState::CopyDest)?;
        barriers.transition(buffers.counter.tracked_mut(), ResourceState::CopyDest)?;
        barriers.transition(buffers.args.tracked_mut(), ResourceState::CopyDest)?;
        barriers.flush(backend, list);
        backend.cmd_copy_buffer(
            list,
            buffers.commands.id(),
            0,
            buffers.upload.id(),
            staging_offset,
            command_bytes,
        );
        backend.cmd_copy_buffer(
            list,
            buffers.counter.id(),
            0,
            self.counter_zero.id(),
            0,
            COUNTER_SIZE,
        );
        backend.cmd_copy_buffer(
            list,
            buffers.args.id(),
            0,
            self.args_template.id(),
            0,
            IndirectDrawArgs::SIZE,
        );
        for buffer in [
            &mut buffers.commands,
            &mut buffers.visible,
            &mut buffers.counter,
            &mut buffers.args,
            &mut buffers.vertices,
        ] {
            barriers.transition(buffer.tracked_mut(), ResourceState::UnorderedAccess)?;
        }
        barriers.flush(backend, list);

        // Descriptors: compute views, then one slot per bound texture.
        let capacity = self.capacity as u64;
        let views = [
            (slots::COMMANDS, &buffers.commands, command_bytes),
            (slots::VISIBLE, &buffers.visible, capacity * 4),
            (slots::COUNTER, &buffers.counter, COUNTER_SIZE),
            (slots::ARGS, &buffers.args, IndirectDrawArgs::SIZE),
            (slots::VERTICES, &buffers.vertices, capacity * QUAD_SIZE),
        ];
        for (slot, buffer, size) in views {
            backend.write_descriptor(
                range.slot(slot).cpu,
                DescriptorView::StorageBuffer {
                    buffer: buffer.id(),
                    offset: 0,
                    size,
                },
            )?;
        }
        for (i, &id) in texture_ids.iter().enumerate() {
            backend.write_descriptor(
                range.slot(COMPUTE_VIEW_COUNT + i as u32).cpu,
                DescriptorView::Texture(id),
            )?;
        }

        // Cull, then generate.
        let (width, height) = backend.viewport();
        let constants = PassConstants {
            viewport: [width as f32, height as f32],
            command_count: count,
            texture_base: COMPUTE_VIEW_COUNT,
        }
        .to_words();
        let groups = count.div_ceil(self.group_size);
        backend.cmd_set_descriptor_table(list, range.slot(0).gpu);
        backend.cmd_set_compute_pipeline(list, self.cull);
        backend.cmd_set_constants(list, &constants);
        backend.cmd_dispatch(list, groups, 1, 1);
        barriers.uav(None)?;
        barriers.flush(backend, list);
        backend.cmd_set_compute_pipeline(list, self.generate);
        backend.cmd_set_constants(list, &constants);
        backend.cmd_dispatch(list, groups, 1, 1);

        // Draw.
        let clear =
            (ctx.backbuffer.state() == ResourceState::Present).then_some(self.clear_color);
        barriers.transition(
            buffers.vertices.tracked_mut(),
            ResourceState::VertexAndConstantBuffer,
        )?;
        barriers.transition(buffers.args.tracked_mut(), ResourceState::IndirectArgument)?;
        barriers.transition(&mut *ctx.backbuffer, ResourceState::RenderTarget)?;
        barriers.flush(backend, list);

        let ResourceId::Texture(target) = ctx.backbuffer.id() else {
            return Err(RenderError::InvalidTexture(format!("{:?}", ctx.backbuffer.id())));
        };
        backend.cmd_begin_render_pass(list, target, clear);
        backend.cmd_set_render_pipeline(list, self.render);
        backend.cmd_set_constants(list, &constants);
        backend.cmd_set_vertex_buffer(list, buffers.vertices.id(), SpriteVertex::SIZE);
        backend.cmd_draw_indirect(list, buffers.args.id(), 0);
        backend.cmd_end_render_pass(list);

        batch.release_bindings(textures);

        let stats = FlushStats {
            commands: count,
            textures: texture_count,
            groups,
            descriptors: range.len(),
        };
        log::trace!("Flushed {stats:?}");
        Ok(stats)
    }

    /// Destroy pipelines and buffers. The GPU must be idle.
    pub fn destroy<B: GpuBackend>(self, backend: &mut B) {
        for frame in self.frames {
            frame.destroy(backend);
        }
        destroy_buffer(backend, self.counter_zero);
        destroy_buffer(backend, self.args_template);
        for pipeline in [self.cull, self.generate, self.render] {
            backend.destroy_pipeline(pipeline);
        }
    }
}
