//! Streaming unpack of a committed pack buffer.

use super::{RECORD_HEADER_LEN, RecordHeader, align8};
use crate::engine::ChunkSink;
use crate::error::{Error, Result};
use crate::runtime::{AddressSpace, RemoteAddr};

#[derive(Debug)]
struct Pending {
    dst: RemoteAddr,
    len: usize,
    written: usize,
    padding: usize,
}

/// Writes packed records to their destinations as chunks arrive.
///
/// Chunk boundaries fall anywhere, so a header or payload may be split
/// across chunks; the unpacker carries partial state between calls.
pub struct Unpacker<'a> {
    space: &'a dyn AddressSpace,
    total: usize,
    consumed: usize,
    header: [u8; RECORD_HEADER_LEN],
    header_fill: usize,
    record: Option<Pending>,
    records: usize,
}

impl<'a> Unpacker<'a> {
    /// Unpack a stream of `total` bytes into `space`.
    pub fn new(space: &'a dyn AddressSpace, total: usize) -> Self {
        Self {
            space,
            total,
            consumed: 0,
            header: [0; RECORD_HEADER_LEN],
            header_fill: 0,
            record: None,
            records: 0,
        }
    }

    /// Records fully written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    fn start_record(&mut self) -> Result<()> {
        let header = RecordHeader::decode(&self.header);
        self.header_fill = 0;
        let index = self.records;

        if header.dst.is_null() {
            return Err(Error::PackCorrupt(format!(
                "record {index} has a null destination"
            )));
        }
        if header.len == 0 {
            return Err(Error::PackCorrupt(format!("record {index} has zero length")));
        }
        let remaining = self.total - self.consumed;
        let len = usize::try_from(header.len).unwrap_or(usize::MAX);
        if len > remaining || align8(len) > remaining {
            return Err(Error::PackCorrupt(format!(
                "record {index} of {} bytes overruns the {remaining} bytes left",
                header.len
            )));
        }
        self.record = Some(Pending {
            dst: header.dst,
            len,
            written: 0,
            padding: align8(len) - len,
        });
        Ok(())
    }
}

impl ChunkSink for Unpacker<'_> {
    fn drain(&mut self, _offset: usize, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = match self.record.as_mut() {
                None => {
                    let take = (RECORD_HEADER_LEN - self.header_fill).min(data.len());
                    self.header[self.header_fill..self.header_fill + take]
                        .copy_from_slice(&data[..take]);
                    self.header_fill += take;
                    take
                }
                Some(rec) if rec.written < rec.len => {
                    let take = (rec.len - rec.written).min(data.len());
                    self.space
                        .write(rec.dst.offset(rec.written), &data[..take])?;
                    rec.written += take;
                    take
                }
                Some(rec) => {
                    let take = rec.padding.min(data.len());
                    rec.padding -= take;
                    take
                }
            };
            data = &data[take..];
            self.consumed += take;

            if self.record.is_none() && self.header_fill == RECORD_HEADER_LEN {
                self.start_record()?;
            }
            if self
                .record
                .as_ref()
                .is_some_and(|rec| rec.written == rec.len && rec.padding == 0)
            {
                self.record = None;
                self.records += 1;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.header_fill != 0 || self.record.is_some() {
            return Err(Error::PackCorrupt(format!(
                "stream truncated inside record {}",
                self.records
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::AcceleratorMemory;
    use crate::pack::PackBuffer;

    fn feed(unpacker: &mut Unpacker<'_>, stream: &[u8], chunk: usize) -> Result<()> {
        for (i, piece) in stream.chunks(chunk).enumerate() {
            unpacker.drain(i * chunk, piece)?;
        }
        unpacker.finish()
    }

    #[test]
    fn test_records_split_across_chunks() {
        let memory = AcceleratorMemory::new();
        let a = memory.alloc(64).unwrap();
        let b = memory.alloc(64).unwrap();

        let mut pack = PackBuffer::new(4096);
        pack.push(a, b"hello, accelerator").unwrap();
        pack.push(b.offset(3), &[0xEE; 21]).unwrap();

        // Chunks of 5 bytes split every header and payload.
        let mut unpacker = Unpacker::new(&memory, pack.len());
        feed(&mut unpacker, pack.as_bytes(), 5).unwrap();
        assert_eq!(unpacker.records(), 2);

        let mut out = vec![0u8; 18];
        memory.read(a, &mut out).unwrap();
        assert_eq!(out, b"hello, accelerator");
        let mut out = vec![0u8; 24];
        memory.read(b, &mut out).unwrap();
        assert_eq!(&out[..3], &[0, 0, 0]);
        assert!(out[3..].iter().all(|&x| x == 0xEE));
    }

    #[test]
    fn test_null_destination_is_corrupt() {
        let memory = AcceleratorMemory::new();
        let mut stream = RecordHeader {
            dst: RemoteAddr::NULL,
            len: 8,
        }
        .encode()
        .to_vec();
        stream.extend_from_slice(&[0; 8]);

        let mut unpacker = Unpacker::new(&memory, stream.len());
        let err = feed(&mut unpacker, &stream, 64).unwrap_err();
        assert!(matches!(err, Error::PackCorrupt(_)));
    }

    #[test]
    fn test_oversized_length_is_corrupt() {
        let memory = AcceleratorMemory::new();
        let dst = memory.alloc(8).unwrap();
        let stream = RecordHeader {
            dst,
            len: u64::MAX,
        }
        .encode();

        let mut unpacker = Unpacker::new(&memory, stream.len());
        let err = feed(&mut unpacker, &stream, 64).unwrap_err();
        assert!(err.to_string().contains("overruns"));
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let memory = AcceleratorMemory::new();
        let dst = memory.alloc(64).unwrap();
        let mut pack = PackBuffer::new(4096);
        pack.push(dst, &[1; 40]).unwrap();

        // Announce the full length but stop halfway through the payload.
        let mut unpacker = Unpacker::new(&memory, pack.len());
        unpacker.drain(0, &pack.as_bytes()[..30]).unwrap();
        let err = unpacker.finish().unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_zero_length_is_corrupt() {
        let memory = AcceleratorMemory::new();
        let dst = memory.alloc(8).unwrap();
        let stream = RecordHeader { dst, len: 0 }.encode();
        let mut unpacker = Unpacker::new(&memory, 64);
        assert!(unpacker.drain(0, &stream).is_err());
    }
}
