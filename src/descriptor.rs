//! Descriptor heap partitioning and per-frame bump allocation.
//!
//! One shader-visible heap is created at init and split statically into one
//! region per frame in flight, so frames never contend for slots. Each
//! frame's [`DescriptorAllocator`] hands out a full-capacity
//! [`DescriptorTable`] at `begin_frame`, and flush code bump-allocates
//! contiguous slot ranges from that table. Both levels reset by moving their
//! cursor back to zero.

use crate::backend::{CpuDescriptorHandle, DescriptorHeapInfo, GpuBackend, GpuDescriptorHandle};
use crate::error::{RenderError, RenderResult};

/// The single shader-visible descriptor heap.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeap {
    info: DescriptorHeapInfo,
}

impl DescriptorHeap {
    pub fn create<B: GpuBackend>(backend: &mut B, capacity: u32) -> RenderResult<Self> {
        let info = backend.create_descriptor_heap(capacity)?;
        log::debug!(
            "Created descriptor heap with {} slots (increment {})",
            info.capacity,
            info.increment
        );
        Ok(Self { info })
    }

    pub fn capacity(&self) -> u32 {
        self.info.capacity
    }

    /// Allocator over slots `[index * len, (index + 1) * len)`.
    pub fn region(&self, index: u32, len: u32) -> RenderResult<DescriptorAllocator> {
        let start = index * len;
        if start + len > self.info.capacity {
            return Err(RenderError::DescriptorCapacityExceeded {
                requested: len,
                available: self.info.capacity.saturating_sub(start),
                capacity: self.info.capacity,
            });
        }
        Ok(DescriptorAllocator {
            cursor: Cursor::new(
                self.info.cpu_start.offset(start, self.info.increment),
                self.info.gpu_start.offset(start, self.info.increment),
                self.info.increment,
                len,
            ),
        })
    }
}

/// Linear cursor shared by the allocator and its tables.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    cpu_base: CpuDescriptorHandle,
    gpu_base: GpuDescriptorHandle,
    increment: u32,
    capacity: u32,
    allocated: u32,
}

impl Cursor {
    fn new(
        cpu_base: CpuDescriptorHandle,
        gpu_base: GpuDescriptorHandle,
        increment: u32,
        capacity: u32,
    ) -> Self {
        Self {
            cpu_base,
            gpu_base,
            increment,
            capacity,
            allocated: 0,
        }
    }

    /// Advance by `count`, returning the first slot index.
    fn bump(&mut self, count: u32) -> RenderResult<u32> {
        let available = self.capacity - self.allocated;
        if count > available {
            log::error!(
                "Descriptor allocation of {count} slots failed ({available} of {} left)",
                self.capacity
            );
            return Err(RenderError::DescriptorCapacityExceeded {
                requested: count,
                available,
                capacity: self.capacity,
            });
        }
        let first = self.allocated;
        self.allocated += count;
        Ok(first)
    }
}

/// Per-frame allocator over a static region of the heap.
#[derive(Debug, Clone)]
pub struct DescriptorAllocator {
    cursor: Cursor,
}

impl DescriptorAllocator {
    /// Carve the next `count` slots out as a table.
    pub fn allocate(&mut self, count: u32) -> RenderResult<DescriptorTable> {
        let first = self.cursor.bump(count)?;
        Ok(DescriptorTable {
            cursor: Cursor::new(
                self.cursor.cpu_base.offset(first, self.cursor.increment),
                self.cursor.gpu_base.offset(first, self.cursor.increment),
                self.cursor.increment,
                count,
            ),
        })
    }

    pub fn reset(&mut self) {
        self.cursor.allocated = 0;
    }

    pub fn capacity(&self) -> u32 {
        self.cursor.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.cursor.allocated
    }
}

/// A contiguous run of descriptor slots with its own bump cursor.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    cursor: Cursor,
}

impl DescriptorTable {
    /// Next `count` contiguous slots of this table.
    pub fn allocate(&mut self, count: u32) -> RenderResult<DescriptorRange> {
        let first = self.cursor.bump(count)?;
        Ok(DescriptorRange {
            cpu_start: self.cursor.cpu_base.offset(first, self.cursor.increment),
            gpu_start: self.cursor.gpu_base.offset(first, self.cursor.increment),
            first,
            count,
            increment: self.cursor.increment,
        })
    }

    pub fn reset(&mut self) {
        self.cursor.allocated = 0;
    }

    /// Handle shaders index from when this table is bound.
    pub fn gpu_base(&self) -> GpuDescriptorHandle {
        self.cursor.gpu_base
    }

    pub fn cpu_base(&self) -> CpuDescriptorHandle {
        self.cursor.cpu_base
    }

    pub fn capacity(&self) -> u32 {
        self.cursor.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.cursor.allocated
    }

    pub fn remaining(&self) -> u32 {
        self.cursor.capacity - self.cursor.allocated
    }
}

/// Slots returned by [`DescriptorTable::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    cpu_start: CpuDescriptorHandle,
    gpu_start: GpuDescriptorHandle,
    first: u32,
    count: u32,
    increment: u32,
}

/// One slot: where the CPU writes the view and where the GPU reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub cpu: CpuDescriptorHandle,
    pub gpu: GpuDescriptorHandle,
    /// Index relative to the owning table's base.
    pub index: u32,
}

impl DescriptorRange {
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Table-relative index of the first slot.
    pub fn first_index(&self) -> u32 {
        self.first
    }

    /// Slot `i` of the range.
    ///
    /// # Panics
    ///
    /// Panics if `i` is outside the range.
    pub fn slot(&self, i: u32) -> DescriptorSlot {
        assert!(i < self.count, "descriptor slot {i} out of range {}", self.count);
        DescriptorSlot {
            cpu: self.cpu_start.offset(i, self.increment),
            gpu: self.gpu_start.offset(i, self.increment),
            index: self.first + i,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = DescriptorSlot> + '_ {
        (0..self.count).map(move |i| self.slot(i))
    }
}
