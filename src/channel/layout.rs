//! Deterministic layout of one sub-channel region.

use crate::config::{MAILBOX_HOUSEKEEPING_WORDS, UDMA_MAX_SPLIT};
use crate::error::{Error, Result};

/// Size of one mailbox or housekeeping word.
pub const WORD_LEN: usize = std::mem::size_of::<u64>();

/// Tag in the first housekeeping word.
const LAYOUT_MAGIC: u64 = 0x5544_4d41_0000_0000;

/// Byte layout of a sub-channel of `region_len` bytes with `max_split` mailboxes.
///
/// ```text
/// 0                       data_len          + max_split*8       region_len
/// | data area             | mailbox[0..max_split] | stamp | data_len |
/// ```
///
/// Both roles compute the same layout from `(region_len, max_split)`; the
/// housekeeping words let the remote role confirm that before it moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    region_len: usize,
    max_split: usize,
    data_len: usize,
}

impl ChannelLayout {
    /// Compute the layout, rejecting regions that cannot hold any data.
    pub fn new(region_len: usize, max_split: usize) -> Result<Self> {
        if max_split == 0 || max_split > UDMA_MAX_SPLIT {
            return Err(Error::ConfigInvalid(format!(
                "max split {max_split} outside 1..={UDMA_MAX_SPLIT}"
            )));
        }
        if region_len % WORD_LEN != 0 {
            return Err(Error::ConfigInvalid(format!(
                "region length {region_len} is not a multiple of {WORD_LEN}"
            )));
        }
        let mailbox_area = (max_split + MAILBOX_HOUSEKEEPING_WORDS) * WORD_LEN;
        if region_len <= mailbox_area {
            return Err(Error::ConfigInvalid(format!(
                "region length {region_len} leaves no room for data after {mailbox_area} mailbox bytes"
            )));
        }
        Ok(Self {
            region_len,
            max_split,
            data_len: region_len - mailbox_area,
        })
    }

    /// Total region length.
    #[inline]
    pub fn region_len(&self) -> usize {
        self.region_len
    }

    /// Number of mailboxes.
    #[inline]
    pub fn max_split(&self) -> usize {
        self.max_split
    }

    /// Capacity of the data area; every plan must satisfy `split * chunk <= data_len`.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Bytes taken by mailboxes and housekeeping.
    #[inline]
    pub fn mailbox_area(&self) -> usize {
        self.region_len - self.data_len
    }

    /// Offset of mailbox `j`.
    #[inline]
    pub fn mailbox_offset(&self, j: usize) -> usize {
        debug_assert!(j < self.max_split);
        self.data_len + j * WORD_LEN
    }

    /// Offset of the first housekeeping word.
    #[inline]
    pub fn stamp_offset(&self) -> usize {
        self.data_len + self.max_split * WORD_LEN
    }

    /// Offset of the second housekeeping word.
    #[inline]
    pub fn capacity_offset(&self) -> usize {
        self.stamp_offset() + WORD_LEN
    }

    /// Value of the first housekeeping word.
    #[inline]
    pub fn stamp(&self) -> u64 {
        LAYOUT_MAGIC | self.max_split as u64
    }

    /// Check housekeeping words read back from a region.
    pub fn verify(&self, stamp: u64, capacity: u64) -> Result<()> {
        if stamp != self.stamp() || capacity != self.data_len as u64 {
            return Err(Error::InvalidSegment(format!(
                "channel layout mismatch: stamp {stamp:#x} capacity {capacity}, expected {:#x} and {}",
                self.stamp(),
                self.data_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let layout = ChannelLayout::new(64 * 1024 * 1024, 64).unwrap();
        assert_eq!(layout.mailbox_area(), (64 + 2) * 8);
        assert_eq!(layout.data_len(), 64 * 1024 * 1024 - 528);
        assert_eq!(layout.mailbox_offset(0), layout.data_len());
        assert_eq!(layout.mailbox_offset(63), layout.data_len() + 63 * 8);
        assert_eq!(layout.stamp_offset(), layout.data_len() + 512);
        assert_eq!(layout.capacity_offset() + WORD_LEN, layout.region_len());
    }

    #[test]
    fn test_layout_rejects_bad_shapes() {
        assert!(ChannelLayout::new(4096, 0).is_err());
        assert!(ChannelLayout::new(4096, 65).is_err());
        assert!(ChannelLayout::new(4097, 8).is_err());
        assert!(ChannelLayout::new(528, 64).is_err());
        assert!(ChannelLayout::new(536, 64).is_ok());
    }

    #[test]
    fn test_layout_verify() {
        let layout = ChannelLayout::new(1 << 20, 16).unwrap();
        layout
            .verify(layout.stamp(), layout.data_len() as u64)
            .unwrap();

        let other = ChannelLayout::new(1 << 20, 8).unwrap();
        assert!(layout.verify(other.stamp(), other.data_len() as u64).is_err());
    }
}
