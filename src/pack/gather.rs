//! Receive-direction batching: request lists, remote gather, local scatter.

use super::align8;
use crate::engine::ChunkSource;
use crate::error::{Error, Result};
use crate::runtime::{AddressSpace, RemoteAddr};

/// Bytes of one encoded request.
pub const ENTRY_LEN: usize = 16;

/// One queued receive: `len` bytes from remote-role address `src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvEntry {
    /// Source in remote-role memory.
    pub src: RemoteAddr,
    /// Bytes to fetch.
    pub len: usize,
}

/// Encode a request list as `src: u64 LE, len: u64 LE` pairs.
pub fn encode_entries<'e>(entries: impl IntoIterator<Item = &'e RecvEntry>) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(&entry.src.0.to_le_bytes());
        out.extend_from_slice(&(entry.len as u64).to_le_bytes());
    }
    out
}

/// Decode a request list produced by [`encode_entries`].
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<RecvEntry>> {
    if bytes.len() % ENTRY_LEN != 0 {
        return Err(Error::PackCorrupt(format!(
            "request list of {} bytes is not a multiple of {ENTRY_LEN}",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(ENTRY_LEN)
        .enumerate()
        .map(|(i, raw)| {
            let mut src = [0u8; 8];
            let mut len = [0u8; 8];
            src.copy_from_slice(&raw[..8]);
            len.copy_from_slice(&raw[8..]);
            let entry = RecvEntry {
                src: RemoteAddr(u64::from_le_bytes(src)),
                len: usize::try_from(u64::from_le_bytes(len))
                    .map_err(|_| Error::PackCorrupt(format!("request {i} length overflows")))?,
            };
            if entry.src.is_null() || entry.len == 0 {
                return Err(Error::PackCorrupt(format!(
                    "request {i} is empty or has a null source"
                )));
            }
            Ok(entry)
        })
        .collect()
}

/// Staged size of a request list: every payload padded to 8 bytes.
pub fn staged_len<'e>(entries: impl IntoIterator<Item = &'e RecvEntry>) -> usize {
    entries.into_iter().map(|e| align8(e.len)).sum()
}

/// Streams the gathered sources of a request list, each padded to 8 bytes.
pub struct GatherSource<'a> {
    space: &'a dyn AddressSpace,
    entries: &'a [RecvEntry],
    /// Staged offset of each entry.
    starts: Vec<usize>,
}

impl<'a> GatherSource<'a> {
    /// Gather `entries` from `space`.
    pub fn new(space: &'a dyn AddressSpace, entries: &'a [RecvEntry]) -> Self {
        let mut starts = Vec::with_capacity(entries.len());
        let mut at = 0;
        for entry in entries {
            starts.push(at);
            at += align8(entry.len);
        }
        Self {
            space,
            entries,
            starts,
        }
    }

    /// Total bytes the source produces.
    pub fn len(&self) -> usize {
        staged_len(self.entries)
    }

    /// Whether the request list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChunkSource for GatherSource<'_> {
    fn fill(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut i = match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let mut at = offset;
        let mut out = buf;

        while !out.is_empty() {
            let entry = self.entries.get(i).ok_or_else(|| {
                Error::InvalidSegment(format!("gather read past {} bytes", self.len()))
            })?;
            let within = at - self.starts[i];
            let span = align8(entry.len) - within;
            let take = span.min(out.len());
            let (head, tail) = std::mem::take(&mut out).split_at_mut(take);

            // Payload bytes first, then padding zeros.
            let payload = entry.len.saturating_sub(within).min(take);
            if payload > 0 {
                self.space.read(entry.src.offset(within), &mut head[..payload])?;
            }
            head[payload..].fill(0);

            out = tail;
            at += take;
            i += 1;
        }
        Ok(())
    }
}

/// Copy a staged batch back into its destinations, in request order.
///
/// Returns the payload bytes delivered.
pub fn scatter<'d>(staging: &[u8], dsts: impl IntoIterator<Item = &'d mut [u8]>) -> Result<usize> {
    let mut at = 0;
    let mut delivered = 0;
    for dst in dsts {
        let src = staging.get(at..at + dst.len()).ok_or_else(|| {
            Error::PackCorrupt(format!(
                "staged batch of {} bytes too short at {at}",
                staging.len()
            ))
        })?;
        dst.copy_from_slice(src);
        delivered += dst.len();
        at += align8(dst.len());
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::AcceleratorMemory;

    #[test]
    fn test_entries_encode_little_endian() {
        let entries = [
            RecvEntry {
                src: RemoteAddr(0x10),
                len: 3,
            },
            RecvEntry {
                src: RemoteAddr(0x20),
                len: 9,
            },
        ];
        let bytes = encode_entries(&entries);
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], 0x10);
        assert_eq!(bytes[8], 3);
        assert_eq!(decode_entries(&bytes).unwrap(), entries);
        assert_eq!(staged_len(&entries), 8 + 16);
    }

    #[test]
    fn test_decode_rejects_bad_lists() {
        assert!(decode_entries(&[0; 15]).is_err());
        let null = encode_entries(&[RecvEntry {
            src: RemoteAddr::NULL,
            len: 4,
        }]);
        assert!(matches!(decode_entries(&null), Err(Error::PackCorrupt(_))));
    }

    #[test]
    fn test_gather_then_scatter() {
        let memory = AcceleratorMemory::new();
        let a = memory.alloc(32).unwrap();
        let b = memory.alloc(32).unwrap();
        memory.write(a, b"first").unwrap();
        memory.write(b, &[7u8; 20]).unwrap();
        let entries = [RecvEntry { src: a, len: 5 }, RecvEntry { src: b, len: 20 }];

        let mut source = GatherSource::new(&memory, &entries);
        assert_eq!(source.len(), 8 + 24);

        // Pull the stream in odd-sized pieces.
        let mut staging = vec![0xFFu8; source.len()];
        for (k, piece) in staging.chunks_mut(7).enumerate() {
            source.fill(k * 7, piece).unwrap();
        }
        assert_eq!(&staging[..5], b"first");
        assert_eq!(&staging[5..8], &[0, 0, 0]);
        assert_eq!(&staging[28..], &[0, 0, 0, 0]);

        let mut x = [0u8; 5];
        let mut y = [0u8; 20];
        let delivered = scatter(&staging, [&mut x[..], &mut y[..]]).unwrap();
        assert_eq!(delivered, 25);
        assert_eq!(&x, b"first");
        assert_eq!(y, [7u8; 20]);
    }

    #[test]
    fn test_scatter_short_staging() {
        let mut x = [0u8; 16];
        assert!(scatter(&[0u8; 8], [&mut x[..]]).is_err());
    }
}
