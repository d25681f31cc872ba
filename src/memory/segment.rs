//! Memory segment trait and types.

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Process-private heap memory (remote mirrors, accelerator buffers).
    Heap,
    /// memfd-backed memory that a second mapping can alias.
    SharedMemory,
}

impl MemoryType {
    /// Can another mapping of this memory be created by file descriptor?
    #[inline]
    pub fn supports_sharing(&self) -> bool {
        match self {
            MemoryType::Heap => false,
            MemoryType::SharedMemory => true,
        }
    }
}

/// Trait for memory segment backends.
///
/// A segment is a contiguous, fixed-size region whose address never changes
/// while the segment is alive. Channel views and DMA registrations keep raw
/// pointers into segments, so this stability is load-bearing.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid for the lifetime of the segment
/// - The region is at least 8-byte aligned so mailbox words can be accessed atomically
pub trait MemorySegment: Send + Sync {
    /// Pointer to the first byte.
    fn as_ptr(&self) -> *const u8;

    /// Mutable pointer to the first byte.
    ///
    /// Writers synchronize among themselves; the segment hands out the
    /// pointer from `&self` because the region is shared.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure nothing writes to this memory while the slice lives.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no concurrent writers.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}

impl std::fmt::Debug for dyn MemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySegment")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("type", &self.memory_type())
            .finish()
    }
}
