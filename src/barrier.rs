//! Resource state tracking and barrier batching.
//!
//! Every GPU resource owned by the renderer carries its current access state
//! in a [`TrackedResource`]. Transitions are collected in a [`BarrierBatcher`]
//! and emitted as a single barrier command per flush.
//!
//! The tracked state is updated as soon as a transition is queued, not when
//! the barrier executes. A batch must therefore be flushed before any command
//! that depends on the new state is recorded.

use crate::backend::{Barrier, CommandListId, GpuBackend, ResourceId, ResourceState};
use crate::error::{RenderError, RenderResult};

/// Default number of transitions a batch can hold.
pub const DEFAULT_BATCH_CAPACITY: usize = 10;

/// A GPU resource handle paired with its current access state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedResource {
    id: ResourceId,
    state: ResourceState,
}

impl TrackedResource {
    pub fn new(id: ResourceId, state: ResourceState) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }
}

/// Collects up to `N` barriers and records them as one command.
#[derive(Debug)]
pub struct BarrierBatcher<const N: usize = DEFAULT_BATCH_CAPACITY> {
    pending: Vec<Barrier>,
}

impl<const N: usize> Default for BarrierBatcher<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BarrierBatcher<N> {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(N),
        }
    }

    /// Queue a transition of `resource` into `after`.
    ///
    /// No-op when the resource is already in `after`. Otherwise the
    /// resource's tracked state becomes `after` immediately.
    pub fn transition(
        &mut self,
        resource: &mut TrackedResource,
        after: ResourceState,
    ) -> RenderResult<()> {
        if resource.state == after {
            return Ok(());
        }
        self.push(Barrier::Transition {
            resource: resource.id,
            before: resource.state,
            after,
        })?;
        resource.state = after;
        Ok(())
    }

    /// Queue an unordered-access barrier. `None` orders all UAV writes.
    pub fn uav(&mut self, resource: Option<&TrackedResource>) -> RenderResult<()> {
        self.push(Barrier::UnorderedAccess {
            resource: resource.map(|r| r.id),
        })
    }

    /// Record all queued barriers as one command and clear the batch.
    pub fn flush<B: GpuBackend>(&mut self, backend: &mut B, list: CommandListId) {
        if self.pending.is_empty() {
            return;
        }
        backend.cmd_barriers(list, &self.pending);
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Queued barriers in recording order.
    pub fn pending(&self) -> &[Barrier] {
        &self.pending
    }

    fn push(&mut self, barrier: Barrier) -> RenderResult<()> {
        if self.pending.len() == N {
            log::error!("Barrier batch overflow while queueing {barrier:?}");
            return Err(RenderError::BarrierBatchFull { capacity: N });
        }
        self.pending.push(barrier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferId, TextureId};

    fn buffer(id: u64, state: ResourceState) -> TrackedResource {
        TrackedResource::new(ResourceId::Buffer(BufferId(id)), state)
    }

    #[test]
    fn test_same_state_is_noop() {
        let mut batch = BarrierBatcher::<4>::new();
        let mut res = buffer(1, ResourceState::UnorderedAccess);
        batch
            .transition(&mut res, ResourceState::UnorderedAccess)
            .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_transition_updates_state_immediately() {
        let mut batch = BarrierBatcher::<4>::new();
        let mut res = buffer(1, ResourceState::UnorderedAccess);
        batch.transition(&mut res, ResourceState::CopyDest).unwrap();

        assert_eq!(res.state(), ResourceState::CopyDest);
        assert_eq!(
            batch.pending(),
            &[Barrier::Transition {
                resource: ResourceId::Buffer(BufferId(1)),
                before: ResourceState::UnorderedAccess,
                after: ResourceState::CopyDest,
            }]
        );
    }

    #[test]
    fn test_chained_transitions_record_each_step() {
        let mut batch = BarrierBatcher::<4>::new();
        let mut tex = TrackedResource::new(
            ResourceId::Texture(TextureId(9)),
            ResourceState::PixelShaderResource,
        );
        batch.transition(&mut tex, ResourceState::CopyDest).unwrap();
        batch
            .transition(&mut tex, ResourceState::PixelShaderResource)
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(tex.state(), ResourceState::PixelShaderResource);
    }

    #[test]
    fn test_overflow_is_reported_and_state_kept() {
        let mut batch = BarrierBatcher::<2>::new();
        let mut a = buffer(1, ResourceState::Common);
        let mut b = buffer(2, ResourceState::Common);
        let mut c = buffer(3, ResourceState::Common);
        batch.transition(&mut a, ResourceState::CopyDest).unwrap();
        batch.transition(&mut b, ResourceState::CopyDest).unwrap();

        let err = batch.transition(&mut c, ResourceState::CopyDest).unwrap_err();
        assert!(matches!(err, RenderError::BarrierBatchFull { capacity: 2 }));
        assert_eq!(c.state(), ResourceState::Common);
    }

    #[test]
    fn test_uav_barrier() {
        let mut batch = BarrierBatcher::<2>::new();
        let res = buffer(5, ResourceState::UnorderedAccess);
        batch.uav(Some(&res)).unwrap();
        batch.uav(None).unwrap();
        assert_eq!(
            batch.pending(),
            &[
                Barrier::UnorderedAccess {
                    resource: Some(ResourceId::Buffer(BufferId(5)))
                },
                Barrier::UnorderedAccess { resource: None },
            ]
        );
    }
}
