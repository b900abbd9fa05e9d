//! Frame pipelining and present synchronisation.
//!
//! # Ring of frames
//!
//! The pipeline owns `N` [`Frame`] slots created once at init. Each slot has
//! its own command list, descriptor region and fence, and moves through
//!
//! ```text
//! Idle -> Recording -> Submitted -> (GPU executes) -> Idle
//! ```
//!
//! `begin_frame` on a slot blocks until the fence value signalled by that
//! slot's previous `end_frame` is reached, so the CPU never resets a command
//! list the GPU may still execute. Frame `k + N` therefore cannot start
//! recording before frame `k` completed.
//!
//! # Present
//!
//! Presents are tracked by a separate fence. At most `M` presents
//! (backbuffer count) are outstanding, and the backbuffer to render into is
//! `present_fence_value % M`.

use crate::backend::{CommandListId, FenceId, GpuBackend, ResourceId, ResourceState, TextureId};
use crate::barrier::{BarrierBatcher, TrackedResource};
use crate::buffer::{destroy_buffer, GpuBuffer};
use crate::descriptor::{DescriptorAllocator, DescriptorHeap, DescriptorTable};
use crate::error::{RenderError, RenderResult};
use crate::texture::TextureRegistry;
use crate::upload::TextureUploadQueue;

/// Lifecycle state of a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
}

/// A GPU resource whose destruction waits for in-flight frames.
#[derive(Debug)]
pub enum Retired {
    Buffer(GpuBuffer),
    Texture(TextureId),
}

impl Retired {
    fn release<B: GpuBackend>(self, backend: &mut B) {
        match self {
            Retired::Buffer(buffer) => destroy_buffer(backend, buffer),
            Retired::Texture(texture) => backend.destroy_texture(texture),
        }
    }
}

/// Identifies the frame being recorded. Returned by `begin_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    index: usize,
    serial: u64,
}

impl FrameHandle {
    /// Ring slot of the frame.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of frames begun before and including this one.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// One slot of the frame ring.
#[derive(Debug)]
pub struct Frame {
    index: usize,
    command_list: CommandListId,
    fence: FenceId,
    /// Value the fence reaches once this slot's last submission completed.
    wait_value: u64,
    descriptors: DescriptorAllocator,
    table: Option<DescriptorTable>,
    state: FrameState,
    retired: Vec<Retired>,
}

impl Frame {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn command_list(&self) -> CommandListId {
        self.command_list
    }

    pub fn fence(&self) -> FenceId {
        self.fence
    }

    pub fn wait_value(&self) -> u64 {
        self.wait_value
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// The frame's full-capacity descriptor table.
    pub fn table_mut(&mut self) -> RenderResult<&mut DescriptorTable> {
        self.table.as_mut().ok_or(RenderError::FrameNotRecording)
    }

    fn release_retired<B: GpuBackend>(&mut self, backend: &mut B) {
        for resource in self.retired.drain(..) {
            resource.release(backend);
        }
    }
}

/// Mutable access to the recording frame and its target backbuffer.
pub struct RecordingContext<'a> {
    pub frame: &'a mut Frame,
    pub backbuffer: &'a mut TrackedResource,
}

/// Ring of frames plus present bookkeeping.
pub struct FramePipeline {
    frames: Vec<Frame>,
    current: usize,
    serial: u64,
    descriptors_per_frame: u32,
    present_fence: FenceId,
    present_fence_value: u64,
    backbuffers: Vec<TrackedResource>,
    present_index: usize,
}

impl FramePipeline {
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        frame_count: usize,
        descriptors_per_frame: u32,
    ) -> RenderResult<Self> {
        let heap = DescriptorHeap::create(backend, frame_count as u32 * descriptors_per_frame)?;

        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            frames.push(Frame {
                index,
                command_list: backend.create_command_list(&format!("frame{index}"))?,
                fence: backend.create_fence(&format!("frame{index}"))?,
                wait_value: 0,
                descriptors: heap.region(index as u32, descriptors_per_frame)?,
                table: None,
                state: FrameState::Idle,
                retired: Vec::new(),
            });
        }

        let backbuffers = (0..backend.backbuffer_count())
            .map(|i| {
                TrackedResource::new(
                    ResourceId::Texture(backend.backbuffer(i)),
                    ResourceState::Present,
                )
            })
            .collect();

        log::info!(
            "Frame pipeline: {} frames in flight, {} backbuffers, {} descriptors per frame",
            frame_count,
            backend.backbuffer_count(),
            descriptors_per_frame
        );

        Ok(Self {
            frames,
            current: 0,
            serial: 0,
            descriptors_per_frame,
            present_fence: backend.create_fence("present")?,
            present_fence_value: 0,
            backbuffers,
            present_index: 0,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Ring slot the next `begin_frame` (or the open frame) uses.
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    pub fn present_fence_value(&self) -> u64 {
        self.present_fence_value
    }

    /// Backbuffer that is safe to render into.
    pub fn present_index(&self) -> usize {
        self.present_index
    }

    pub fn backbuffer_state(&self, index: usize) -> ResourceState {
        self.backbuffers[index].state()
    }

    pub fn is_recording(&self) -> bool {
        self.frames[self.current].state == FrameState::Recording
    }

    /// Start recording the current ring slot.
    ///
    /// Blocks until the GPU finished the slot's previous submission, resets
    /// its command list and descriptor region, and records pending texture
    /// uploads.
    pub fn begin_frame<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        textures: &mut TextureRegistry,
        uploads: &mut TextureUploadQueue,
    ) -> RenderResult<FrameHandle> {
        let frame = &mut self.frames[self.current];
        if frame.state == FrameState::Recording {
            return Err(RenderError::FrameAlreadyRecording(frame.index));
        }

        if backend.completed_value(frame.fence) < frame.wait_value {
            log::trace!(
                "Frame {} waiting for fence value {}",
                frame.index,
                frame.wait_value
            );
            backend.wait_fence(frame.fence, frame.wait_value)?;
        }
        frame.state = FrameState::Idle;
        frame.release_retired(backend);

        backend.reset_command_list(frame.command_list)?;
        frame.descriptors.reset();
        frame.table = Some(frame.descriptors.allocate(self.descriptors_per_frame)?);
        frame.state = FrameState::Recording;
        self.serial += 1;

        let uploaded = uploads.process(backend, frame.command_list, textures, &mut frame.retired)?;
        log::debug!(
            "Begin frame {} (slot {}, {} uploads)",
            self.serial,
            frame.index,
            uploaded
        );

        Ok(FrameHandle {
            index: frame.index,
            serial: self.serial,
        })
    }

    /// Close and submit the recording frame, then advance the ring.
    ///
    /// A backbuffer rendered to during the frame is returned to
    /// [`ResourceState::Present`] first.
    pub fn end_frame<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<()> {
        let frame = &mut self.frames[self.current];
        if frame.state != FrameState::Recording {
            return Err(RenderError::FrameNotRecording);
        }

        let backbuffer = &mut self.backbuffers[self.present_index];
        if backbuffer.state() != ResourceState::Present {
            let mut barriers: BarrierBatcher = BarrierBatcher::new();
            barriers.transition(backbuffer, ResourceState::Present)?;
            barriers.flush(backend, frame.command_list);
        }

        backend.close_command_list(frame.command_list)?;
        backend.submit(frame.command_list)?;
        frame.wait_value += 1;
        backend.signal(frame.fence, frame.wait_value)?;
        frame.state = FrameState::Submitted;
        frame.table = None;
        log::debug!(
            "End frame {} (slot {}, fence value {})",
            self.serial,
            frame.index,
            frame.wait_value
        );

        self.current = (self.current + 1) % self.frames.len();
        Ok(())
    }

    /// Present the current backbuffer.
    ///
    /// Blocks while `M` presents are still outstanding.
    pub fn present<B: GpuBackend>(&mut self, backend: &mut B, vsync: bool) -> RenderResult<()> {
        let count = self.backbuffers.len() as u64;
        let target = self.present_fence_value.saturating_sub(count - 1);
        if backend.completed_value(self.present_fence) < target {
            backend.wait_fence(self.present_fence, target)?;
        }

        backend.present(vsync)?;
        self.present_fence_value += 1;
        backend.signal(self.present_fence, self.present_fence_value)?;
        self.present_index = (self.present_fence_value % count) as usize;
        log::trace!(
            "Presented (value {}, next backbuffer {})",
            self.present_fence_value,
            self.present_index
        );
        Ok(())
    }

    /// Block until ring slot `index` has no GPU work outstanding.
    pub fn wait_for_frame<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        index: usize,
    ) -> RenderResult<()> {
        let frame = &mut self.frames[index];
        backend.wait_fence(frame.fence, frame.wait_value)?;
        match frame.state {
            FrameState::Submitted => frame.state = FrameState::Idle,
            // The open command list still references what this slot retired.
            FrameState::Recording => return Ok(()),
            FrameState::Idle => {}
        }
        frame.release_retired(backend);
        Ok(())
    }

    /// Block until every frame and present completed.
    pub fn wait_for_all<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<()> {
        for index in 0..self.frames.len() {
            self.wait_for_frame(backend, index)?;
        }
        backend.wait_fence(self.present_fence, self.present_fence_value)?;
        Ok(())
    }

    /// Defer destruction of `resource` until every frame that may use it
    /// has completed.
    pub fn retire(&mut self, resource: Retired) {
        let n = self.frames.len();
        let index = if self.is_recording() {
            self.current
        } else {
            (self.current + n - 1) % n
        };
        self.frames[index].retired.push(resource);
    }

    /// The frame named by `handle`, which must be the one recording.
    pub fn recording(&mut self, handle: FrameHandle) -> RenderResult<RecordingContext<'_>> {
        if !self.is_recording() {
            return Err(RenderError::FrameNotRecording);
        }
        if handle.serial != self.serial || handle.index != self.current {
            return Err(RenderError::StaleFrameHandle {
                serial: handle.serial,
                current: self.serial,
            });
        }
        Ok(RecordingContext {
            frame: &mut self.frames[self.current],
            backbuffer: &mut self.backbuffers[self.present_index],
        })
    }

    /// Wait for the GPU and release everything still retired.
    pub fn destroy<B: GpuBackend>(mut self, backend: &mut B) -> RenderResult<()> {
        self.wait_for_all(backend)?;
        for frame in &mut self.frames {
            frame.release_retired(backend);
        }
        Ok(())
    }
}
