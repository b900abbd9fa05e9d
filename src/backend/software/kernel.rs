//! CPU compute kernels executed by the software backend.

/// A storage-buffer binding read by a kernel, relative to the bound
/// descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBinding {
    pub slot: u32,
    /// Whether the kernel writes the buffer.
    pub writes: bool,
}

/// Inputs of one dispatch.
pub struct Dispatch<'a> {
    pub groups: [u32; 3],
    /// Root constants set before the dispatch.
    pub constants: &'a [u32],
    /// Buffer views in the order of [`ComputeKernel::bindings`], as words.
    pub views: Vec<&'a mut [u32]>,
}

impl Dispatch<'_> {
    /// Constant `index`, or 0 when unset.
    pub fn constant(&self, index: usize) -> u32 {
        self.constants.get(index).copied().unwrap_or(0)
    }
}

/// Stand-in for a compiled compute shader.
///
/// Kernels may run thread groups concurrently; like GPU threads, they must
/// not rely on any ordering between groups.
pub trait ComputeKernel: Send + Sync {
    /// Threads per group along x.
    fn group_size(&self) -> u32;
    fn bindings(&self) -> &[KernelBinding];
    fn dispatch(&self, dispatch: Dispatch<'_>) -> Result<(), String>;
}
