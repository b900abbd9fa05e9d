//! GPU buffers and the buffer-kind lookup table.

use crate::backend::{
    align_up, BufferDesc, BufferFlags, BufferId, GpuBackend, HeapLocation, ResourceId,
    ResourceState, BUFFER_SIZE_ALIGNMENT,
};
use crate::barrier::TrackedResource;
use crate::error::RenderResult;

/// Intended use of a buffer. Each kind fixes the heap, initial state and
/// allocation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Index,
    Vertex,
    Constant,
    Unordered,
    Upload,
    ShaderResource,
}

/// Heap, initial state and flags of one [`BufferKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferKindDesc {
    pub heap: HeapLocation,
    pub initial_state: ResourceState,
    pub flags: BufferFlags,
}

const fn kind_desc(
    heap: HeapLocation,
    initial_state: ResourceState,
    flags: BufferFlags,
) -> BufferKindDesc {
    BufferKindDesc {
        heap,
        initial_state,
        flags,
    }
}

/// Indexed by `BufferKind as usize`.
const BUFFER_KIND_TABLE: [BufferKindDesc; 6] = [
    kind_desc(
        HeapLocation::Default,
        ResourceState::IndexBuffer,
        BufferFlags::empty(),
    ),
    kind_desc(
        HeapLocation::Default,
        ResourceState::VertexAndConstantBuffer,
        BufferFlags::empty(),
    ),
    kind_desc(
        HeapLocation::Default,
        ResourceState::VertexAndConstantBuffer,
        BufferFlags::empty(),
    ),
    kind_desc(
        HeapLocation::Default,
        ResourceState::UnorderedAccess,
        BufferFlags::ALLOW_UNORDERED_ACCESS.union(BufferFlags::INDIRECT),
    ),
    kind_desc(
        HeapLocation::Upload,
        ResourceState::GenericRead,
        BufferFlags::empty(),
    ),
    kind_desc(
        HeapLocation::Default,
        ResourceState::AllShaderResource,
        BufferFlags::empty(),
    ),
];

impl BufferKind {
    pub const ALL: [BufferKind; 6] = [
        BufferKind::Index,
        BufferKind::Vertex,
        BufferKind::Constant,
        BufferKind::Unordered,
        BufferKind::Upload,
        BufferKind::ShaderResource,
    ];

    pub const fn desc(self) -> BufferKindDesc {
        BUFFER_KIND_TABLE[self as usize]
    }
}

/// A buffer owned by the renderer, with its tracked access state.
#[derive(Debug)]
pub struct GpuBuffer {
    id: BufferId,
    kind: BufferKind,
    size: u64,
    resource: TrackedResource,
}

impl GpuBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Allocated size, a multiple of 256 bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> ResourceState {
        self.resource.state()
    }

    pub fn tracked(&self) -> &TrackedResource {
        &self.resource
    }

    pub fn tracked_mut(&mut self) -> &mut TrackedResource {
        &mut self.resource
    }
}

/// Create a buffer of `kind`, at least `size` bytes.
///
/// Contents are zeroed only when `zero_init` is set.
pub fn create_buffer<B: GpuBackend>(
    backend: &mut B,
    label: &str,
    kind: BufferKind,
    size: u64,
    zero_init: bool,
) -> RenderResult<GpuBuffer> {
    let desc = kind.desc();
    let size = align_up(size.max(1), BUFFER_SIZE_ALIGNMENT);
    let mut flags = desc.flags;
    if !zero_init {
        flags |= BufferFlags::NOT_ZEROED;
    }
    let id = backend.create_buffer(&BufferDesc {
        label: label.to_string(),
        size,
        heap: desc.heap,
        initial_state: desc.initial_state,
        flags,
    })?;
    log::trace!("Created {kind:?} buffer {label} ({size} bytes)");
    Ok(GpuBuffer {
        id,
        kind,
        size,
        resource: TrackedResource::new(ResourceId::Buffer(id), desc.initial_state),
    })
}

pub fn destroy_buffer<B: GpuBackend>(backend: &mut B, buffer: GpuBuffer) {
    backend.destroy_buffer(buffer.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BufferKind::Index, HeapLocation::Default, ResourceState::IndexBuffer)]
    #[case(BufferKind::Vertex, HeapLocation::Default, ResourceState::VertexAndConstantBuffer)]
    #[case(BufferKind::Constant, HeapLocation::Default, ResourceState::VertexAndConstantBuffer)]
    #[case(BufferKind::Unordered, HeapLocation::Default, ResourceState::UnorderedAccess)]
    #[case(BufferKind::Upload, HeapLocation::Upload, ResourceState::GenericRead)]
    #[case(BufferKind::ShaderResource, HeapLocation::Default, ResourceState::AllShaderResource)]
    fn test_kind_table(
        #[case] kind: BufferKind,
        #[case] heap: HeapLocation,
        #[case] state: ResourceState,
    ) {
        let desc = kind.desc();
        assert_eq!(desc.heap, heap);
        assert_eq!(desc.initial_state, state);
    }

    #[test]
    fn test_only_unordered_allows_uav() {
        for kind in BufferKind::ALL {
            assert_eq!(
                kind.desc().flags.contains(BufferFlags::ALLOW_UNORDERED_ACCESS),
                kind == BufferKind::Unordered
            );
        }
    }
}
