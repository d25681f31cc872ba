//! Send-direction pack buffer.

use super::{RecordHeader, align8, record_len};
use crate::error::{Error, Result};
use crate::runtime::RemoteAddr;

/// Append-only buffer of packed records.
#[derive(Debug)]
pub struct PackBuffer {
    buf: Vec<u8>,
    capacity: usize,
    records: usize,
}

impl PackBuffer {
    /// An empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            records: 0,
        }
    }

    /// Whether a record with a `len`-byte payload fits the remaining space.
    pub fn fits(&self, len: usize) -> bool {
        self.buf.len() + record_len(len) <= self.capacity
    }

    /// Append one record.
    ///
    /// Fails with [`Error::ResourceExhausted`] if it does not fit; the caller
    /// commits and retries.
    pub fn push(&mut self, dst: RemoteAddr, payload: &[u8]) -> Result<()> {
        if !self.fits(payload.len()) {
            return Err(Error::ResourceExhausted(format!(
                "record of {} bytes does not fit pack buffer ({} of {} used)",
                payload.len(),
                self.buf.len(),
                self.capacity
            )));
        }
        if self.buf.capacity() == 0 {
            self.buf.reserve_exact(self.capacity);
        }
        let header = RecordHeader {
            dst,
            len: payload.len() as u64,
        };
        self.buf.extend_from_slice(&header.encode());
        self.buf.extend_from_slice(payload);
        let padded = self.buf.len() + align8(payload.len()) - payload.len();
        self.buf.resize(padded, 0);
        self.records += 1;
        Ok(())
    }

    /// Encoded records.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes used.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no record is pending.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of pending records.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Maximum size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every pending record, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.records = 0;
    }
}
