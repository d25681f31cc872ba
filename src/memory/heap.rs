//! Heap-backed memory segment.

use std::alloc::Layout;
use std::ptr::NonNull;

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};

/// Alignment used when none is requested.
pub const DEFAULT_ALIGN: usize = 64;

/// A zeroed, fixed-address heap allocation.
///
/// Used for remote mirror buffers (registered with the block-transfer
/// engine) and for accelerator-side user memory in the loopback node.
///
/// # Example
///
/// ```rust
/// use udma::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024).unwrap();
/// assert_eq!(segment.len(), 1024);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapSegment {
    /// Allocate `size` zeroed bytes aligned to [`DEFAULT_ALIGN`].
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0 or allocation fails.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_alignment(size, DEFAULT_ALIGN)
    }

    /// Allocate `size` zeroed bytes with a specific alignment.
    ///
    /// # Arguments
    ///
    /// * `size` - Size in bytes.
    /// * `align` - Required alignment (must be a power of 2).
    pub fn with_alignment(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::AllocationFailed(format!("bad layout: {e}")))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::AllocationFailed(format!("could not allocate {size} bytes"))
        })?;

        Ok(Self { ptr, layout })
    }

    /// Copy `data` into the segment at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked; segment memory is never handed out as a reference.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: range checked.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// Nothing may write the range while the slice lives.
    pub unsafe fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        // SAFETY: range checked; caller excludes writers.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    /// Mutably borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// Nothing else may read or write the range while the slice lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_range(offset, len)?;
        // SAFETY: range checked; caller guarantees exclusive access.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) })
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.layout.size() => Ok(()),
            _ => Err(Error::InvalidSegment(format!(
                "range {offset}+{len} outside segment of {} bytes",
                self.layout.size()
            ))),
        }
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}

impl std::fmt::Debug for HeapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapSegment")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        // SAFETY: allocated in with_alignment with this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the allocation is owned by the segment and only reached through
// raw pointers whose users synchronize externally.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}
