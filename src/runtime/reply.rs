//! Reply word returned by the remote transfer entry points.
//!
//! The low 56 bits carry the number of bytes the remote side moved, the
//! high 8 bits a [`ReplyStatus`]. A successful transfer of `len` bytes
//! replies with `ReplyStatus::Ok` and exactly `len`.

use std::time::Duration;

use crate::error::Error;

const BYTES_MASK: u64 = (1 << 56) - 1;
const STATUS_SHIFT: u32 = 56;

/// Outcome reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    /// Transfer completed.
    Ok = 0,
    /// Remote liveness bound exceeded.
    Timeout = 1,
    /// A mailbox announced more than the remaining length.
    InvalidLength = 2,
    /// Block-transfer engine failure.
    Dma = 3,
    /// Malformed packed record.
    PackCorrupt = 4,
    /// No peer initialized on this context.
    NotInitialized = 5,
    /// Arguments could not be decoded.
    BadArgs = 6,
}

impl ReplyStatus {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::Timeout,
            2 => ReplyStatus::InvalidLength,
            3 => ReplyStatus::Dma,
            4 => ReplyStatus::PackCorrupt,
            5 => ReplyStatus::NotInitialized,
            6 => ReplyStatus::BadArgs,
            _ => return None,
        })
    }

    /// Status a remote-side error is reported as.
    pub fn of(error: &Error) -> Self {
        match error {
            Error::Timeout { .. } => ReplyStatus::Timeout,
            Error::InvalidLength { .. } => ReplyStatus::InvalidLength,
            Error::PackCorrupt(_) => ReplyStatus::PackCorrupt,
            Error::Dma(_) => ReplyStatus::Dma,
            _ => ReplyStatus::BadArgs,
        }
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Timeout => "timeout",
            ReplyStatus::InvalidLength => "invalid length",
            ReplyStatus::Dma => "dma failure",
            ReplyStatus::PackCorrupt => "pack corrupt",
            ReplyStatus::NotInitialized => "not initialized",
            ReplyStatus::BadArgs => "bad arguments",
        };
        f.write_str(name)
    }
}

/// Decoded reply of a transfer entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyWord {
    /// Outcome reported by the remote side.
    pub status: ReplyStatus,
    /// Bytes moved before the remote side returned.
    pub transferred: usize,
}

impl ReplyWord {
    /// Successful transfer of `len` bytes.
    pub fn ok(len: usize) -> Self {
        Self {
            status: ReplyStatus::Ok,
            transferred: len,
        }
    }

    /// Encode into the 64-bit call result.
    pub fn encode(self) -> u64 {
        ((self.status as u64) << STATUS_SHIFT) | (self.transferred as u64 & BYTES_MASK)
    }

    /// Decode a 64-bit call result. Unknown status codes decode as `None`.
    pub fn decode(raw: u64) -> Option<Self> {
        let status = ReplyStatus::from_code((raw >> STATUS_SHIFT) as u8)?;
        Some(Self {
            status,
            transferred: (raw & BYTES_MASK) as usize,
        })
    }

    /// Whether this reply reports a complete transfer of `requested` bytes.
    pub fn is_complete(&self, requested: usize) -> bool {
        self.status == ReplyStatus::Ok && self.transferred == requested
    }

    /// Turn a raw call result into the local outcome of a transfer.
    ///
    /// `timeout` is the remote liveness bound, reported as the wait of a
    /// remote-side timeout.
    pub fn check(raw: u64, requested: usize, timeout: Duration) -> crate::Result<usize> {
        let Some(reply) = Self::decode(raw) else {
            return Err(Error::Offload(format!("undecodable reply word {raw:#x}")));
        };
        if reply.is_complete(requested) {
            return Ok(requested);
        }
        let transferred = reply.transferred.min(requested);
        Err(match reply.status {
            ReplyStatus::Timeout => Error::Timeout {
                waited: timeout,
                transferred,
            },
            // The reply word has no room for the announced length.
            ReplyStatus::InvalidLength => Error::InvalidLength {
                announced: 0,
                remaining: requested - transferred,
                transferred,
            },
            ReplyStatus::PackCorrupt => Error::PackCorrupt(format!(
                "remote unpack failed after {transferred} of {requested} bytes"
            )),
            ReplyStatus::Dma => Error::Dma(format!(
                "remote engine failed after {transferred} of {requested} bytes"
            )),
            status => Error::RemoteAborted {
                status,
                transferred,
                requested,
            },
        })
    }
}
