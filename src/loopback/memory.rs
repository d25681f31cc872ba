//! Accelerator-side memory of the loopback node.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::memory::{HeapSegment, MemorySegment};
use crate::runtime::{AddressSpace, RemoteAddr};

const BASE: u64 = 0x6000_0000_0000;

/// Allocations are placed at this granularity, leaving a gap after each.
const GRANULE: u64 = 4096;

#[derive(Debug, Default)]
struct Heap {
    blocks: BTreeMap<u64, HeapSegment>,
    next: u64,
}

/// Bump-allocated memory standing in for the accelerator's own RAM.
///
/// User buffers that transfers read from or write to live here; tests
/// allocate them, fill them and check them through [`AddressSpace`].
#[derive(Debug)]
pub struct AcceleratorMemory {
    heap: RwLock<Heap>,
}

impl AcceleratorMemory {
    /// Empty memory.
    pub fn new() -> Self {
        Self {
            heap: RwLock::new(Heap {
                blocks: BTreeMap::new(),
                next: BASE,
            }),
        }
    }

    /// Allocate `len` zeroed bytes.
    pub fn alloc(&self, len: usize) -> Result<RemoteAddr> {
        let block = HeapSegment::new(len)?;
        let mut heap = self.heap.write().unwrap_or_else(|e| e.into_inner());
        let addr = heap.next;
        heap.next += (len as u64).div_ceil(GRANULE) * GRANULE + GRANULE;
        heap.blocks.insert(addr, block);
        Ok(RemoteAddr(addr))
    }

    /// Release an allocation made by [`alloc`](Self::alloc).
    pub fn free(&self, addr: RemoteAddr) -> Result<()> {
        let mut heap = self.heap.write().unwrap_or_else(|e| e.into_inner());
        heap.blocks
            .remove(&addr.0)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidSegment(format!("{addr} is not an allocation")))
    }

    /// Bytes currently allocated.
    pub fn allocated(&self) -> usize {
        let heap = self.heap.read().unwrap_or_else(|e| e.into_inner());
        heap.blocks.values().map(|b| b.len()).sum()
    }

    fn with_block<T>(
        &self,
        addr: RemoteAddr,
        len: usize,
        f: impl FnOnce(&HeapSegment, usize) -> Result<T>,
    ) -> Result<T> {
        let heap = self.heap.read().unwrap_or_else(|e| e.into_inner());
        let (&start, block) = heap
            .blocks
            .range(..=addr.0)
            .next_back()
            .ok_or_else(|| Error::InvalidSegment(format!("{addr} is not allocated")))?;
        let offset = (addr.0 - start) as usize;
        if offset.checked_add(len).is_none_or(|end| end > block.len()) {
            return Err(Error::InvalidSegment(format!(
                "{addr}+{len} overruns an allocation of {} bytes",
                block.len()
            )));
        }
        f(block, offset)
    }
}

impl Default for AcceleratorMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for AcceleratorMemory {
    fn read(&self, addr: RemoteAddr, buf: &mut [u8]) -> Result<()> {
        self.with_block(addr, buf.len(), |block, offset| block.read_at(offset, buf))
    }

    fn write(&self, addr: RemoteAddr, data: &[u8]) -> Result<()> {
        self.with_block(addr, data.len(), |block, offset| block.write_at(offset, data))
    }
}
