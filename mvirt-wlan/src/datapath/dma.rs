//! Buffer allocation and DMA mapping contract
//!
//! The datapath never touches platform memory APIs directly; it goes through
//! a [`BufferAllocator`]. [`HeapAllocator`] is the software implementation
//! used by the emulator and tests: buffers come from the heap and the device
//! address is the identity mapping of the data start.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use super::buffer::RxBuffer;

/// Device-visible address of a mapped buffer
pub type DmaAddr = u64;

/// DMA transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    FromDevice,
    ToDevice,
}

/// Mapping errors
#[derive(Debug, Error)]
pub enum DmaError {
    #[error("DMA mapping failed")]
    MapFailed,

    #[error("buffer already mapped at {0:#x}")]
    AlreadyMapped(DmaAddr),

    #[error("buffer allocation failed")]
    AllocFailed,
}

/// Allocates receive buffers and maps them for device access
pub trait BufferAllocator: Send + Sync {
    /// Allocate a buffer; `None` under memory pressure, never blocks
    fn alloc(&self, size: usize, reserve: usize, align: usize) -> Option<RxBuffer>;

    /// Map `buf` for device access and record its device address
    fn map(&self, buf: &mut RxBuffer, dir: DmaDirection) -> Result<DmaAddr, DmaError>;

    /// Tear down the device mapping of `buf`
    fn unmap(&self, buf: &mut RxBuffer, dir: DmaDirection);

    /// Release a buffer
    fn free(&self, buf: RxBuffer) {
        drop(buf);
    }

    /// Merge the extension chain of `buf` into one contiguous buffer
    fn linearize(&self, buf: &mut RxBuffer) -> Result<(), DmaError> {
        buf.linearize().map_err(|_| DmaError::AllocFailed)
    }
}

/// Heap-backed allocator with identity mapping
#[derive(Debug, Default)]
pub struct HeapAllocator {
    mapped: AtomicU64,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers currently mapped
    pub fn mapped(&self) -> u64 {
        self.mapped.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for HeapAllocator {
    fn alloc(&self, size: usize, reserve: usize, align: usize) -> Option<RxBuffer> {
        Some(RxBuffer::new(size, reserve, align))
    }

    fn map(&self, buf: &mut RxBuffer, _dir: DmaDirection) -> Result<DmaAddr, DmaError> {
        if let Some(addr) = buf.dma_addr() {
            return Err(DmaError::AlreadyMapped(addr));
        }
        let addr = buf.data_ptr_addr();
        buf.set_dma_addr(Some(addr));
        self.mapped.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn unmap(&self, buf: &mut RxBuffer, _dir: DmaDirection) {
        if buf.dma_addr().is_some() {
            buf.set_dma_addr(None);
            self.mapped.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
