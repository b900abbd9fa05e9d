//! CPU implementation of [`GpuBackend`].
//!
//! Commands are recorded into in-memory lists and executed by a worker
//! thread standing in for the GPU queue, so CPU and "GPU" genuinely run
//! concurrently. Resource states are validated at execution time and
//! compute shaders are replaced by registered [`ComputeKernel`]s.

mod device;
mod kernel;
mod queue;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::shader::ShaderBlob;

pub use device::{BackendStats, DrawCapture, ValidationError};
pub use kernel::{ComputeKernel, Dispatch, KernelBinding};
pub use queue::GpuGate;

use device::{Command, DeviceState, Pipeline, SoftBuffer, SoftTexture};
use queue::{Fence, Queue, QueueOp};

/// Byte pattern filling buffers created without zero initialisation.
const UNINITIALIZED_WORD: u32 = 0xcdcd_cdcd;

const DEFAULT_BACKBUFFER_COUNT: usize = 2;

struct CommandList {
    label: String,
    commands: Vec<Command>,
    open: bool,
}

/// Software GPU device.
pub struct SoftwareBackend {
    device: Arc<Mutex<DeviceState>>,
    queue: Queue,
    gate: GpuGate,
    lists: HashMap<u64, CommandList>,
    fences: HashMap<u64, Arc<Fence>>,
    kernels: HashMap<String, Arc<dyn ComputeKernel>>,
    next_id: u64,
    width: u32,
    height: u32,
    backbuffers: Vec<TextureId>,
    present_count: u64,
    idle_fence: Arc<Fence>,
    idle_value: u64,
}

impl SoftwareBackend {
    /// Device rendering into two `width` x `height` backbuffers.
    pub fn new(width: u32, height: u32) -> BackendResult<Self> {
        Self::with_backbuffers(width, height, DEFAULT_BACKBUFFER_COUNT)
    }

    pub fn with_backbuffers(width: u32, height: u32, count: usize) -> BackendResult<Self> {
        if count == 0 {
            return Err(BackendError::SwapchainCreationFailed(
                "backbuffer count must be at least 1".into(),
            ));
        }

        let device = Arc::new(Mutex::new(DeviceState::new(true)));
        let gate = GpuGate::default();
        let queue = Queue::spawn(device.clone(), gate.clone())
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let mut backend = Self {
            device,
            queue,
            gate,
            lists: HashMap::new(),
            fences: HashMap::new(),
            kernels: HashMap::new(),
            next_id: 1,
            width,
            height,
            backbuffers: Vec::with_capacity(count),
            present_count: 0,
            idle_fence: Arc::new(Fence::default()),
            idle_value: 0,
        };

        for index in 0..count {
            let id = backend.create_texture(&TextureDesc {
                label: format!("backbuffer{index}"),
                width,
                height,
                format: TextureFormat::Rgba8Unorm,
                initial_state: ResourceState::Present,
            })?;
            backend.backbuffers.push(id);
        }

        log::info!(
            "Software backend initialized: {}x{}, {} backbuffers",
            width,
            height,
            count
        );
        Ok(backend)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Make `kernel` the implementation of compute shaders named `name`.
    pub fn register_kernel(&mut self, name: &str, kernel: Arc<dyn ComputeKernel>) {
        log::debug!("Registered compute kernel {name}");
        self.kernels.insert(name.to_string(), kernel);
    }

    /// Enable or disable state validation of executed commands.
    pub fn set_validation(&mut self, enabled: bool) {
        self.device.lock().validation = enabled;
    }

    /// Handle for pausing GPU execution.
    pub fn gate(&self) -> GpuGate {
        self.gate.clone()
    }

    pub fn stats(&self) -> BackendStats {
        self.device.lock().stats
    }

    /// Every rule violation seen so far.
    pub fn validation_errors(&self) -> Vec<ValidationError> {
        self.device.lock().errors.clone()
    }

    pub fn draws(&self) -> Vec<DrawCapture> {
        self.device.lock().draws.clone()
    }

    pub fn take_draws(&mut self) -> Vec<DrawCapture> {
        std::mem::take(&mut self.device.lock().draws)
    }

    pub fn recorded_command_count(&self, list: CommandListId) -> usize {
        self.lists.get(&list.0).map_or(0, |l| l.commands.len())
    }

    /// State of `buffer` on the GPU timeline.
    pub fn buffer_state(&self, buffer: BufferId) -> Option<ResourceState> {
        self.device.lock().buffers.get(&buffer).map(|b| b.state)
    }

    pub fn texture_state(&self, texture: TextureId) -> Option<ResourceState> {
        self.device.lock().textures.get(&texture).map(|t| t.state)
    }

    /// Current contents of `buffer`.
    pub fn read_buffer(&self, buffer: BufferId) -> Option<Vec<u8>> {
        let device = self.device.lock();
        let words = &device.buffers.get(&buffer)?.words;
        Some(bytemuck::cast_slice(words).to_vec())
    }

    /// Tightly packed texels of `texture`.
    pub fn texture_data(&self, texture: TextureId) -> Option<Vec<u8>> {
        self.device
            .lock()
            .textures
            .get(&texture)
            .map(|t| t.texels.clone())
    }

    pub fn buffer_count(&self) -> usize {
        self.device.lock().buffers.len()
    }

    fn record(&mut self, list: CommandListId, command: Command) {
        match self.lists.get_mut(&list.0) {
            Some(recording) if recording.open => recording.commands.push(command),
            Some(recording) => {
                let detail = format!("{command:?} recorded into closed list");
                let label = recording.label.clone();
                self.reject(&label, detail);
            }
            None => self.reject("unknown", format!("{command:?} recorded into unknown list")),
        }
    }

    fn reject(&self, list: &str, detail: String) {
        log::error!("Validation: {list}: {detail}");
        self.device.lock().errors.push(ValidationError::Invalid {
            list: list.to_string(),
            detail,
        });
    }

    fn fence(&self, fence: FenceId) -> BackendResult<&Arc<Fence>> {
        self.fences.get(&fence.0).ok_or(BackendError::InvalidHandle {
            kind: "fence",
            id: fence.0,
        })
    }

    fn push(&self, op: QueueOp) -> BackendResult<()> {
        if self.queue.push(op) {
            Ok(())
        } else {
            Err(BackendError::DeviceLost)
        }
    }
}

impl Drop for SoftwareBackend {
    fn drop(&mut self) {
        // A paused worker would never drain the queue.
        self.gate.resume();
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn viewport(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> BackendResult<BufferId> {
        if desc.size == 0 || desc.size % 4 != 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{}: size {} is not a positive multiple of 4",
                desc.label, desc.size
            )));
        }
        let fill = if desc.flags.contains(BufferFlags::NOT_ZEROED) {
            UNINITIALIZED_WORD
        } else {
            0
        };
        let id = BufferId(self.next_id());
        self.device.lock().buffers.insert(
            id,
            SoftBuffer {
                label: desc.label.clone(),
                heap: desc.heap,
                words: vec![fill; (desc.size / 4) as usize],
                state: desc.initial_state,
            },
        );
        log::trace!("Created buffer {} ({} bytes)", desc.label, desc.size);
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.device.lock().buffers.remove(&buffer).is_none() {
            log::warn!("Destroying unknown buffer {buffer:?}");
        }
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut device = self.device.lock();
        let target = device
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        if target.heap != HeapLocation::Upload {
            return Err(BackendError::RecordingFailed(format!(
                "{} is not CPU visible",
                target.label
            )));
        }
        let start = offset as usize;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut target.words);
        let range = bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| {
                BackendError::RecordingFailed(format!(
                    "write of {} bytes at {} overruns {}",
                    data.len(),
                    offset,
                    target.label
                ))
            })?;
        range.copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> BackendResult<TextureId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}: empty extent {}x{}",
                desc.label, desc.width, desc.height
            )));
        }
        let id = TextureId(self.next_id());
        let size = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel() as usize;
        self.device.lock().textures.insert(
            id,
            SoftTexture {
                label: desc.label.clone(),
                width: desc.width,
                height: desc.height,
                format: desc.format,
                texels: vec![0; size],
                state: desc.initial_state,
            },
        );
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.device.lock().textures.remove(&texture).is_none() {
            log::warn!("Destroying unknown texture {texture:?}");
        }
    }

    fn texture_footprint(&self, texture: TextureId) -> BackendResult<TextureFootprint> {
        let device = self.device.lock();
        let texture = device
            .textures
            .get(&texture)
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            })?;
        log::trace!("Footprint of {}", texture.label);
        Ok(TextureFootprint::for_texture(
            texture.width,
            texture.height,
            texture.format,
        ))
    }

    fn backbuffer_count(&self) -> usize {
        self.backbuffers.len()
    }

    fn backbuffer(&self, index: usize) -> TextureId {
        self.backbuffers[index]
    }

    fn backbuffer_format(&self) -> TextureFormat {
        TextureFormat::Rgba8Unorm
    }

    fn create_descriptor_heap(&mut self, capacity: u32) -> BackendResult<DescriptorHeapInfo> {
        let mut device = self.device.lock();
        let start = device.heap.len() as u64;
        device.heap.resize(start as usize + capacity as usize, None);
        Ok(DescriptorHeapInfo {
            cpu_start: CpuDescriptorHandle(start),
            gpu_start: GpuDescriptorHandle(start),
            increment: 1,
            capacity,
        })
    }

    fn write_descriptor(
        &mut self,
        slot: CpuDescriptorHandle,
        view: DescriptorView,
    ) -> BackendResult<()> {
        let mut device = self.device.lock();
        let entry = device
            .heap
            .get_mut(slot.0 as usize)
            .ok_or(BackendError::InvalidHandle {
                kind: "descriptor",
                id: slot.0,
            })?;
        *entry = Some(view);
        Ok(())
    }

    fn create_compute_pipeline(
        &mut self,
        shader: &ShaderBlob,
        group_size: u32,
    ) -> BackendResult<PipelineId> {
        let kernel = self.kernels.get(&shader.name).cloned().ok_or_else(|| {
            BackendError::PipelineCreationFailed(format!(
                "no compute kernel registered for {}",
                shader.name
            ))
        })?;
        if kernel.group_size() != group_size {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{} runs {} threads per group, {} requested",
                shader.name,
                kernel.group_size(),
                group_size
            )));
        }
        let id = PipelineId(self.next_id());
        self.device.lock().pipelines.insert(
            id,
            Pipeline::Compute {
                name: shader.name.clone(),
                kernel,
            },
        );
        Ok(id)
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc) -> BackendResult<PipelineId> {
        if desc.vertex_stride == 0 {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{}: zero vertex stride",
                desc.label
            )));
        }
        let texture_attribute = desc
            .vertex_attributes
            .iter()
            .find(|a| a.format == VertexFormat::Uint32)
            .map(|a| a.offset);
        let id = PipelineId(self.next_id());
        self.device.lock().pipelines.insert(
            id,
            Pipeline::Render {
                label: desc.label.clone(),
                texture_attribute,
            },
        );
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.device.lock().pipelines.remove(&pipeline);
    }

    fn create_command_list(&mut self, label: &str) -> BackendResult<CommandListId> {
        let id = self.next_id();
        self.lists.insert(
            id,
            CommandList {
                label: label.to_string(),
                commands: Vec::new(),
                open: false,
            },
        );
        Ok(CommandListId(id))
    }

    fn reset_command_list(&mut self, list: CommandListId) -> BackendResult<()> {
        let recording = self
            .lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "command list",
                id: list.0,
            })?;
        recording.commands.clear();
        recording.open = true;
        Ok(())
    }

    fn close_command_list(&mut self, list: CommandListId) -> BackendResult<()> {
        let recording = self
            .lists
            .get_mut(&list.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "command list",
                id: list.0,
            })?;
        if !recording.open {
            return Err(BackendError::RecordingFailed(format!(
                "{} is already closed",
                recording.label
            )));
        }
        recording.open = false;
        Ok(())
    }

    fn cmd_barriers(&mut self, list: CommandListId, barriers: &[Barrier]) {
        if !barriers.is_empty() {
            self.record(list, Command::Barriers(barriers.to_vec()));
        }
    }

    fn cmd_copy_buffer(
        &mut self,
        list: CommandListId,
        dst: BufferId,
        dst_offset: u64,
        src: BufferId,
        src_offset: u64,
        size: u64,
    ) {
        self.record(
            list,
            Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            },
        );
    }

    fn cmd_copy_buffer_to_texture(
        &mut self,
        list: CommandListId,
        dst: TextureId,
        src: BufferId,
        footprint: TextureFootprint,
    ) {
        self.record(
            list,
            Command::CopyBufferToTexture {
                dst,
                src,
                footprint,
            },
        );
    }

    fn cmd_set_descriptor_table(&mut self, list: CommandListId, base: GpuDescriptorHandle) {
        self.record(list, Command::SetDescriptorTable(base));
    }

    fn cmd_set_compute_pipeline(&mut self, list: CommandListId, pipeline: PipelineId) {
        self.record(list, Command::SetComputePipeline(pipeline));
    }

    fn cmd_set_constants(&mut self, list: CommandListId, constants: &[u32]) {
        self.record(list, Command::SetConstants(constants.to_vec()));
    }

    fn cmd_dispatch(&mut self, list: CommandListId, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.record(list, Command::Dispatch([groups_x, groups_y, groups_z]));
    }

    fn cmd_begin_render_pass(
        &mut self,
        list: CommandListId,
        target: TextureId,
        clear: Option<[f32; 4]>,
    ) {
        self.record(list, Command::BeginRenderPass { target, clear });
    }

    fn cmd_end_render_pass(&mut self, list: CommandListId) {
        self.record(list, Command::EndRenderPass);
    }

    fn cmd_set_render_pipeline(&mut self, list: CommandListId, pipeline: PipelineId) {
        self.record(list, Command::SetRenderPipeline(pipeline));
    }

    fn cmd_set_vertex_buffer(&mut self, list: CommandListId, buffer: BufferId, stride: u32) {
        self.record(list, Command::SetVertexBuffer { buffer, stride });
    }

    fn cmd_draw_indirect(&mut self, list: CommandListId, args: BufferId, offset: u64) {
        self.record(list, Command::DrawIndirect { args, offset });
    }

    fn create_fence(&mut self, label: &str) -> BackendResult<FenceId> {
        let id = self.next_id();
        self.fences.insert(id, Arc::new(Fence::default()));
        log::trace!("Created fence {label}");
        Ok(FenceId(id))
    }

    fn submit(&mut self, list: CommandListId) -> BackendResult<()> {
        let recording = self.lists.get(&list.0).ok_or(BackendError::InvalidHandle {
            kind: "command list",
            id: list.0,
        })?;
        if recording.open {
            return Err(BackendError::SubmitFailed(format!(
                "{} is still open",
                recording.label
            )));
        }
        let op = QueueOp::Execute {
            label: recording.label.clone(),
            commands: recording.commands.clone(),
        };
        self.push(op)
    }

    fn signal(&mut self, fence: FenceId, value: u64) -> BackendResult<()> {
        let fence = self.fence(fence)?.clone();
        self.push(QueueOp::Signal { fence, value })
    }

    fn completed_value(&self, fence: FenceId) -> u64 {
        self.fences.get(&fence.0).map_or(0, |f| f.completed())
    }

    fn wait_fence(&self, fence: FenceId, value: u64) -> BackendResult<()> {
        self.fence(fence)?.wait(value);
        Ok(())
    }

    fn present(&mut self, vsync: bool) -> BackendResult<()> {
        let index = (self.present_count % self.backbuffers.len() as u64) as usize;
        self.present_count += 1;
        log::trace!("Present backbuffer {index} (vsync {vsync})");
        self.push(QueueOp::Present {
            backbuffer: self.backbuffers[index],
        })
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.idle_value += 1;
        self.push(QueueOp::Signal {
            fence: self.idle_fence.clone(),
            value: self.idle_value,
        })?;
        self.idle_fence.wait(self.idle_value);
        Ok(())
    }
}
