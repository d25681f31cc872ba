//! Small-message packing.
//!
//! Many small transfers cost one remote call each. Packing batches them:
//!
//! - **Send direction**: records `(dst, len, payload)` accumulate in a
//!   per-peer [`PackBuffer`]. A commit ships the whole buffer as one split
//!   transfer; the remote side streams it through an [`Unpacker`] that writes
//!   every payload to its destination.
//! - **Receive direction**: requests `(src, len)` accumulate in a batch. A
//!   commit sends the request list in one call; the remote side gathers the
//!   sources into one staging buffer and returns it as one split transfer,
//!   which the local side scatters back in request order.
//!
//! Record wire format, all integers little-endian:
//!
//! ```text
//! | dst: u64 | len: u64 | payload (len bytes) | zero padding to 8 |
//! ```

mod buffer;
mod gather;
mod unpack;

pub use buffer::PackBuffer;
pub use gather::{
    ENTRY_LEN, GatherSource, RecvEntry, decode_entries, encode_entries, scatter, staged_len,
};
pub use unpack::Unpacker;

use crate::runtime::RemoteAddr;

/// Bytes of a record header.
pub const RECORD_HEADER_LEN: usize = 16;

/// Round `len` up to a multiple of 8.
#[inline]
pub const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Bytes a record with a `len`-byte payload takes in a pack buffer.
#[inline]
pub const fn record_len(len: usize) -> usize {
    RECORD_HEADER_LEN + align8(len)
}

/// Header of one packed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Destination in remote-role memory.
    pub dst: RemoteAddr,
    /// Payload length.
    pub len: u64,
}

impl RecordHeader {
    /// Encode into wire form.
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut out = [0u8; RECORD_HEADER_LEN];
        out[..8].copy_from_slice(&self.dst.0.to_le_bytes());
        out[8..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode from wire form.
    pub fn decode(raw: &[u8; RECORD_HEADER_LEN]) -> Self {
        let mut dst = [0u8; 8];
        let mut len = [0u8; 8];
        dst.copy_from_slice(&raw[..8]);
        len.copy_from_slice(&raw[8..]);
        Self {
            dst: RemoteAddr(u64::from_le_bytes(dst)),
            len: u64::from_le_bytes(len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(33), 40);
        assert_eq!(record_len(32), 48);
    }

    #[test]
    fn test_header_layout() {
        let header = RecordHeader {
            dst: RemoteAddr(0x0102_0304),
            len: 5,
        };
        let raw = header.encode();
        assert_eq!(&raw[..4], &[4, 3, 2, 1]);
        assert_eq!(raw[8], 5);
        assert_eq!(RecordHeader::decode(&raw), header);
    }
}
