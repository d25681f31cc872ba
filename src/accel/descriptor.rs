//! Peer descriptor handed to the remote init entry point.

use crate::error::{Error, Result};

/// Everything the remote role needs to mirror a local peer.
///
/// Addresses are host addresses; the remote side rebases them onto its own
/// attachment of the segment.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct PeerDescriptor {
    /// Local peer index.
    pub peer_id: u64,
    /// Shared segment to attach.
    pub segment_id: u64,
    /// Key the segment was created under.
    pub segment_key: u64,
    /// Segment length in bytes.
    pub segment_len: u64,
    /// Host address of the first byte of the segment.
    pub host_base: u64,
    /// Host address of the host-to-remote sub-channel.
    pub send_channel: u64,
    /// Host address of the remote-to-host sub-channel.
    pub recv_channel: u64,
    /// Bytes per sub-channel region.
    pub region_len: u64,
    /// Mailboxes per sub-channel.
    pub max_split: u64,
    /// Remote liveness bound in nanoseconds.
    pub timeout_ns: u64,
}

impl PeerDescriptor {
    /// Serialize for a by-value call argument.
    pub fn encode(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a call argument produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // Call arguments carry no alignment guarantee.
        let mut aligned = rkyv::util::AlignedVec::<8>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Offset of host address `addr` within the segment, if a region of
    /// `len` bytes starting there lies inside it.
    pub fn segment_offset(&self, addr: u64, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.host_base)?;
        let end = offset.checked_add(len as u64)?;
        (end <= self.segment_len).then_some(offset as usize)
    }
}
