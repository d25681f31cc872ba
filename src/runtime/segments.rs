//! Shared-memory segment provider.

use std::sync::Arc;

use super::{DmaAddr, SegmentId, SegmentKey};
use crate::error::Result;
use crate::memory::MemorySegment;

/// Remote-role view of an attached segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// DMA address of the first byte of the segment.
    pub base: DmaAddr,
    /// Segment length in bytes.
    pub len: usize,
}

/// Operating-system shared-memory segments.
///
/// The local role creates a segment and keeps the returned mapping alive for
/// as long as it uses it. The remote role attaches the same segment by id
/// and receives a DMA address instead of a mapping.
pub trait SegmentProvider: Send + Sync {
    /// Create a zeroed segment of `size` bytes and map it locally.
    fn create(&self, key: SegmentKey, size: usize)
    -> Result<(SegmentId, Arc<dyn MemorySegment>)>;

    /// Attach an existing segment for DMA access.
    fn attach(&self, id: SegmentId) -> Result<Attachment>;

    /// Undo an [`attach`](Self::attach).
    fn detach(&self, id: SegmentId, attachment: Attachment) -> Result<()>;

    /// Mark the segment for removal once every mapping is gone.
    fn destroy(&self, id: SegmentId) -> Result<()>;
}
