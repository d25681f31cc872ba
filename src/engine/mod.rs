//! Pipelined split-transfer engine.
//!
//! One logical transfer of `len` bytes is cut into `ceil(len / chunk_size)`
//! chunks spread round-robin over `split` slots of a sub-channel. Each slot
//! has a mailbox word: `0` means the producer may use the slot, any other
//! value is the length of the chunk waiting in it.
//!
//! The two roles drive the same channel differently:
//!
//! - [`local`]: plain loads and stores on the mapped region. The mailbox
//!   store *is* the transfer. Liveness comes from peeking the outstanding
//!   remote call.
//! - [`remote`]: payload through a DMA-registered mirror buffer, mailboxes
//!   through single-word instructions. Liveness comes from an idle timer.
//!
//! Transfers read from a [`ChunkSource`] and write to a [`ChunkSink`], so
//! the same loops serve plain buffers, accelerator memory and packed
//! streams.

pub mod local;
pub mod remote;
mod slot;

pub use local::RemoteCall;
pub use remote::{RemoteChannel, RemoteIo};
pub use slot::{SlotState, SlotTable};

use crate::error::{Error, Result};
use crate::runtime::{AddressSpace, RemoteAddr};

/// A failed transfer and how far it got.
#[derive(Debug)]
pub struct Aborted {
    /// Why the transfer stopped.
    pub error: Error,
    /// Bytes fully delivered before it stopped.
    pub transferred: usize,
}

impl Aborted {
    pub(crate) fn new(error: Error, transferred: usize) -> Self {
        Self { error, transferred }
    }
}

/// Where a sending transfer reads its bytes.
pub trait ChunkSource {
    /// Fill `buf` with the bytes at `offset` of the logical buffer.
    fn fill(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;
}

/// Where a receiving transfer writes its bytes.
pub trait ChunkSink {
    /// Accept the bytes at `offset` of the logical buffer. Offsets arrive in order.
    fn drain(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Called once after the last chunk.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads from a byte slice.
pub struct SliceSource<'a>(pub &'a [u8]);

impl ChunkSource for SliceSource<'_> {
    fn fill(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let src = self
            .0
            .get(offset..offset + buf.len())
            .ok_or_else(|| Error::InvalidSegment(format!("source read past {}", self.0.len())))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// Writes into a byte slice.
pub struct SliceSink<'a>(pub &'a mut [u8]);

impl ChunkSink for SliceSink<'_> {
    fn drain(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let len = self.0.len();
        let dst = self
            .0
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| Error::InvalidSegment(format!("sink write past {len}")))?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

/// Reads from remote-role memory starting at `base`.
pub struct MemorySource<'a> {
    space: &'a dyn AddressSpace,
    base: RemoteAddr,
}

impl<'a> MemorySource<'a> {
    /// Source over `space` starting at `base`.
    pub fn new(space: &'a dyn AddressSpace, base: RemoteAddr) -> Self {
        Self { space, base }
    }
}

impl ChunkSource for MemorySource<'_> {
    fn fill(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.space.read(self.base.offset(offset), buf)
    }
}

/// Writes to remote-role memory starting at `base`.
pub struct MemorySink<'a> {
    space: &'a dyn AddressSpace,
    base: RemoteAddr,
}

impl<'a> MemorySink<'a> {
    /// Sink over `space` starting at `base`.
    pub fn new(space: &'a dyn AddressSpace, base: RemoteAddr) -> Self {
        Self { space, base }
    }
}

impl ChunkSink for MemorySink<'_> {
    fn drain(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.space.write(self.base.offset(offset), data)
    }
}
