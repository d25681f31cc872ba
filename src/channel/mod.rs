//! Shared channel: the memory both roles agree on.
//!
//! A peer owns one segment of `2 * region_len` bytes holding two
//! sub-channels: the send sub-channel (local to remote) at offset 0 and the
//! receive sub-channel (remote to local) at offset `region_len`. Each is laid
//! out by [`ChannelLayout`].
//!
//! The local role accesses a sub-channel through [`SubChannel`], a typed view
//! with two accessors: [`SubChannel::mailbox`] and
//! [`SubChannel::chunk_buffer`]. The remote role never maps the region; it
//! reaches it through DMA addresses (see [`crate::engine::RemoteChannel`]).

mod layout;

pub use layout::{ChannelLayout, WORD_LEN};

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::memory::MemorySegment;

/// Local-role view of one sub-channel.
#[derive(Clone)]
pub struct SubChannel {
    region: Arc<dyn MemorySegment>,
    base: usize,
    layout: ChannelLayout,
}

impl SubChannel {
    /// View `layout.region_len()` bytes of `region` starting at `base`.
    pub fn new(region: Arc<dyn MemorySegment>, base: usize, layout: ChannelLayout) -> Result<Self> {
        let end = base.checked_add(layout.region_len());
        if end.is_none_or(|end| end > region.len()) {
            return Err(Error::InvalidSegment(format!(
                "sub-channel at {base} of {} bytes exceeds segment of {} bytes",
                layout.region_len(),
                region.len()
            )));
        }
        if (region.as_ptr() as usize + base) % WORD_LEN != 0 {
            return Err(Error::InvalidSegment(
                "sub-channel base is not word aligned".into(),
            ));
        }
        Ok(Self {
            region,
            base,
            layout,
        })
    }

    /// Layout of this sub-channel.
    #[inline]
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Local address of the first byte, as handed to the remote role.
    pub fn address(&self) -> u64 {
        self.base_ptr() as u64
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        // SAFETY: base is inside the region (checked in new).
        unsafe { self.region.as_mut_ptr().add(self.base) }
    }

    /// Mailbox word of slot `j`.
    ///
    /// # Panics
    ///
    /// Panics if `j >= max_split`.
    #[inline]
    pub fn mailbox(&self, j: usize) -> &AtomicU64 {
        assert!(j < self.layout.max_split(), "mailbox {j} out of range");
        self.word(self.layout.mailbox_offset(j))
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: offset is a word-aligned position inside the region, which
        // lives as long as self; the word is only ever accessed atomically.
        unsafe { AtomicU64::from_ptr(self.base_ptr().add(offset).cast::<u64>()) }
    }

    /// Data area of slot `j` for chunks of `chunk_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if slot `j` does not fit in the data area.
    #[inline]
    pub fn chunk_buffer(&self, j: usize, chunk_size: usize) -> ChunkBuffer<'_> {
        let offset = j * chunk_size;
        assert!(
            offset + chunk_size <= self.layout.data_len(),
            "slot {j} of {chunk_size} bytes exceeds data area"
        );
        ChunkBuffer {
            // SAFETY: offset..offset+chunk_size is inside the data area.
            ptr: unsafe { self.base_ptr().add(offset) },
            len: chunk_size,
            _region: PhantomData,
        }
    }

    /// Clear every mailbox and write the housekeeping words.
    pub fn initialize(&self) {
        for j in 0..self.layout.max_split() {
            self.mailbox(j).store(0, Ordering::Relaxed);
        }
        self.word(self.layout.capacity_offset())
            .store(self.layout.data_len() as u64, Ordering::Relaxed);
        self.word(self.layout.stamp_offset())
            .store(self.layout.stamp(), Ordering::Release);
    }
}

impl std::fmt::Debug for SubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubChannel")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("layout", &self.layout)
            .finish()
    }
}

/// Data area of one pipeline slot.
///
/// Ownership of the bytes alternates between roles through the slot's
/// mailbox, so the buffer is only ever copied into or out of, never borrowed.
pub struct ChunkBuffer<'a> {
    ptr: *mut u8,
    len: usize,
    _region: PhantomData<&'a SubChannel>,
}

impl ChunkBuffer<'_> {
    /// Capacity of the slot.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slot has zero capacity.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` to the start of the slot.
    pub fn write_from(&self, src: &[u8]) -> Result<()> {
        self.check(src.len())?;
        // SAFETY: src.len() <= slot length; the slot is owned by the caller
        // until it publishes the mailbox.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, src.len()) };
        Ok(())
    }

    /// Copy the first `dst.len()` bytes of the slot into `dst`.
    pub fn read_into(&self, dst: &mut [u8]) -> Result<()> {
        self.check(dst.len())?;
        // SAFETY: dst.len() <= slot length; the producer published the slot.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn check(&self, len: usize) -> Result<()> {
        if len > self.len {
            return Err(Error::InvalidSegment(format!(
                "{len} bytes do not fit a {} byte slot",
                self.len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapSegment;

    fn channel(region_len: usize, max_split: usize) -> SubChannel {
        let layout = ChannelLayout::new(region_len, max_split).unwrap();
        let region: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(2 * region_len).unwrap());
        SubChannel::new(region, region_len, layout).unwrap()
    }

    #[test]
    fn test_mailboxes_sit_after_data() {
        let ch = channel(4096, 4);
        ch.mailbox(3).store(77, Ordering::SeqCst);

        let base = ch.base_ptr();
        let raw = unsafe { *(base.add(ch.layout().mailbox_offset(3)) as *const u64) };
        assert_eq!(raw, 77);
    }

    #[test]
    fn test_chunk_buffers_do_not_overlap() {
        let ch = channel(4096, 4);
        ch.chunk_buffer(0, 1000).write_from(&[1; 1000]).unwrap();
        ch.chunk_buffer(1, 1000).write_from(&[2; 1000]).unwrap();

        let mut out = vec![0u8; 1000];
        ch.chunk_buffer(0, 1000).read_into(&mut out).unwrap();
        assert!(out.iter().all(|&b| b == 1));

        assert!(ch.chunk_buffer(0, 10).write_from(&[0; 11]).is_err());
    }

    #[test]
    #[should_panic(expected = "exceeds data area")]
    fn test_chunk_buffer_bounds() {
        let ch = channel(4096, 4);
        let _ = ch.chunk_buffer(4, 1000);
    }

    #[test]
    fn test_initialize_writes_housekeeping() {
        let ch = channel(4096, 4);
        ch.mailbox(0).store(5, Ordering::SeqCst);
        ch.initialize();
        assert_eq!(ch.mailbox(0).load(Ordering::SeqCst), 0);

        let layout = *ch.layout();
        let stamp = ch.word(layout.stamp_offset()).load(Ordering::SeqCst);
        let cap = ch.word(layout.capacity_offset()).load(Ordering::SeqCst);
        layout.verify(stamp, cap).unwrap();
    }

    #[test]
    fn test_sub_channel_must_fit_segment() {
        let layout = ChannelLayout::new(4096, 4).unwrap();
        let region: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(4096).unwrap());
        assert!(SubChannel::new(region, 8, layout).is_err());
    }
}
