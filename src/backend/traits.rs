//! Core backend abstraction traits
//!
//! A backend models one GPU device with a single in-order submission queue.
//! Commands are recorded into command lists and execute in submission order;
//! fences are monotonically increasing counters signalled on the queue.

use crate::backend::types::*;
use crate::shader::ShaderBlob;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create descriptor heap: {0}")]
    DescriptorHeapCreationFailed(String),
    #[error("Command recording failed: {0}")]
    RecordingFailed(String),
    #[error("Queue submission failed: {0}")]
    SubmitFailed(String),
    #[error("Fence wait failed: {0}")]
    FenceWaitFailed(String),
    #[error("Unknown {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub(crate) u64);

/// Handle to a compute or render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub(crate) u64);

/// Handle to a command list together with its backing allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandListId(pub(crate) u64);

/// Handle to a timeline fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub(crate) u64);

impl BufferId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl TextureId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// GPU device abstraction used by the renderer core.
///
/// Failures of any call are reported as [`BackendError`]; the renderer treats
/// them as fatal.
pub trait GpuBackend: Send {
    /// Human readable backend name, used in logs.
    fn name(&self) -> &'static str;

    /// Size of the render target in pixels.
    fn viewport(&self) -> (u32, u32);

    // Resources

    fn create_buffer(&mut self, desc: &BufferDesc) -> BackendResult<BufferId>;
    fn destroy_buffer(&mut self, buffer: BufferId);
    /// Map an upload-heap buffer, copy `data` at `offset`, unmap.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()>;

    fn create_texture(&mut self, desc: &TextureDesc) -> BackendResult<TextureId>;
    fn destroy_texture(&mut self, texture: TextureId);
    /// Copyable footprint of `texture`, used to lay out staging data.
    fn texture_footprint(&self, texture: TextureId) -> BackendResult<TextureFootprint>;

    /// Number of swap-chain backbuffers.
    fn backbuffer_count(&self) -> usize;
    /// Backbuffer texture for present slot `index`. Backbuffers start in
    /// [`ResourceState::Present`].
    fn backbuffer(&self, index: usize) -> TextureId;
    fn backbuffer_format(&self) -> TextureFormat;

    // Descriptors

    fn create_descriptor_heap(&mut self, capacity: u32) -> BackendResult<DescriptorHeapInfo>;
    fn write_descriptor(&mut self, slot: CpuDescriptorHandle, view: DescriptorView)
        -> BackendResult<()>;

    // Pipelines

    /// Compute pipeline launching `group_size` threads per group along x.
    fn create_compute_pipeline(
        &mut self,
        shader: &ShaderBlob,
        group_size: u32,
    ) -> BackendResult<PipelineId>;
    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc) -> BackendResult<PipelineId>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId);

    // Command recording

    fn create_command_list(&mut self, label: &str) -> BackendResult<CommandListId>;
    /// Reset the list's allocator and reopen it for recording. The caller
    /// guarantees the GPU no longer executes the previous contents.
    fn reset_command_list(&mut self, list: CommandListId) -> BackendResult<()>;
    fn close_command_list(&mut self, list: CommandListId) -> BackendResult<()>;

    fn cmd_barriers(&mut self, list: CommandListId, barriers: &[Barrier]);
    fn cmd_copy_buffer(
        &mut self,
        list: CommandListId,
        dst: BufferId,
        dst_offset: u64,
        src: BufferId,
        src_offset: u64,
        size: u64,
    );
    fn cmd_copy_buffer_to_texture(
        &mut self,
        list: CommandListId,
        dst: TextureId,
        src: BufferId,
        footprint: TextureFootprint,
    );
    /// Bind the descriptor table starting at `base` for both compute and
    /// graphics work.
    fn cmd_set_descriptor_table(&mut self, list: CommandListId, base: GpuDescriptorHandle);
    fn cmd_set_compute_pipeline(&mut self, list: CommandListId, pipeline: PipelineId);
    /// Set 32-bit root constants visible to the bound pipeline.
    fn cmd_set_constants(&mut self, list: CommandListId, constants: &[u32]);
    fn cmd_dispatch(&mut self, list: CommandListId, groups_x: u32, groups_y: u32, groups_z: u32);
    /// Begin rendering into `target`, clearing it to `clear` or keeping its
    /// contents when `None`.
    fn cmd_begin_render_pass(
        &mut self,
        list: CommandListId,
        target: TextureId,
        clear: Option<[f32; 4]>,
    );
    fn cmd_end_render_pass(&mut self, list: CommandListId);
    fn cmd_set_render_pipeline(&mut self, list: CommandListId, pipeline: PipelineId);
    fn cmd_set_vertex_buffer(&mut self, list: CommandListId, buffer: BufferId, stride: u32);
    /// Draw with vertex and instance counts read from `args` at execution time.
    fn cmd_draw_indirect(&mut self, list: CommandListId, args: BufferId, offset: u64);

    // Queue

    fn create_fence(&mut self, label: &str) -> BackendResult<FenceId>;
    fn submit(&mut self, list: CommandListId) -> BackendResult<()>;
    fn signal(&mut self, fence: FenceId, value: u64) -> BackendResult<()>;
    fn completed_value(&self, fence: FenceId) -> u64;
    /// Block the calling thread until `fence` reaches `value`.
    fn wait_fence(&self, fence: FenceId, value: u64) -> BackendResult<()>;
    fn present(&mut self, vsync: bool) -> BackendResult<()>;
    fn wait_idle(&mut self) -> BackendResult<()>;
}
