//! Shared memory segment using Linux memfd.
//!
//! A peer's channel region lives in one of these. The local role maps it
//! once; an in-process accelerator maps it a second time through a
//! duplicated descriptor, so both views alias the same pages.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// A memory segment backed by Linux memfd (anonymous shared memory).
///
/// # Example
///
/// ```rust,ignore
/// use udma::memory::{SharedMemorySegment, MemorySegment};
///
/// let segment = SharedMemorySegment::new("udma-peer-0", 2 * 64 * 1024 * 1024)?;
/// let alias = segment.duplicate()?;
/// assert_eq!(alias.len(), segment.len());
/// ```
pub struct SharedMemorySegment {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the segment.
    len: usize,
    /// Debug name; `None` for mappings opened from a descriptor.
    name: Option<String>,
}

impl SharedMemorySegment {
    /// Create a new zero-filled shared memory segment.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name for the segment (visible in `/proc/self/fd/`).
    /// * `size` - Size in bytes. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        // SAFETY: fd is a fresh memfd of exactly `size` bytes.
        let mut segment = unsafe { Self::from_fd(fd, size)? };
        segment.name = Some(name.to_string());
        Ok(segment)
    }

    /// Map an existing memfd.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `fd` is a valid memfd and that `size`
    /// matches the actual size of the memfd.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        // SAFETY: a fresh shared mapping; the kernel picks the address.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: None,
        })
    }

    /// Create a second, independent mapping of the same memory.
    pub fn duplicate(&self) -> Result<Self> {
        let dup_fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        // SAFETY: dup_fd refers to our memfd, whose size is self.len.
        unsafe { Self::from_fd(dup_fd, self.len) }
    }

    /// Get the debug name of this segment.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::SharedMemory
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: the mapping is process-wide and may be touched from any thread;
// the descriptor is reference-counted by the kernel.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_memory_creation() {
        let segment = SharedMemorySegment::new("test-segment", 4096).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.memory_type(), MemoryType::SharedMemory);
        assert!(segment.memory_type().supports_sharing());
        assert_eq!(segment.name(), Some("test-segment"));
    }

    #[test]
    fn test_shared_memory_zero_size_fails() {
        assert!(SharedMemorySegment::new("test", 0).is_err());
    }

    #[test]
    fn test_shared_memory_is_zeroed() {
        let segment = SharedMemorySegment::new("test-zero", 64 * 1024).unwrap();
        unsafe {
            assert!(segment.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_duplicate_aliases_pages() {
        let first = SharedMemorySegment::new("test-alias", 4096).unwrap();
        let second = first.duplicate().unwrap();
        assert_ne!(first.as_ptr(), second.as_ptr());
        assert_eq!(second.name(), None);

        unsafe {
            *first.as_mut_ptr() = 77;
            *second.as_mut_ptr().add(100) = 88;
            assert_eq!(*second.as_ptr(), 77);
            assert_eq!(*first.as_ptr().add(100), 88);
        }
    }
}
