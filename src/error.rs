//! Error types for udma.

use std::time::Duration;

use thiserror::Error;

use crate::runtime::{ContextHandle, ReplyStatus};

/// Result type alias using udma's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Index of a process entry in a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub usize);

/// Index of a peer entry in a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub usize);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Main error type for udma operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared segment or buffer allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Process or peer table is full.
    #[error("{0} table exhausted")]
    Exhausted(&'static str),

    /// A remote entry point could not be located in the loaded code.
    #[error("remote entry point `{entry}` could not be resolved")]
    Resolution {
        /// Symbol name that failed to resolve.
        entry: &'static str,
    },

    /// Remote-side init returned a non-zero status.
    #[error("remote init failed with status {0}")]
    RemoteInitFailed(i64),

    /// Remote-side fini returned a non-zero status.
    #[error("remote fini failed with status {0}")]
    RemoteFiniFailed(i64),

    /// The remote liveness bound was exceeded.
    #[error("timed out after {waited:?} ({transferred} bytes transferred)")]
    Timeout {
        /// How long the stalled wait lasted.
        waited: Duration,
        /// Bytes moved before the abort.
        transferred: usize,
    },

    /// A mailbox announced more bytes than the transfer has left.
    #[error(
        "mailbox announced {announced} bytes but only {remaining} remain ({transferred} bytes transferred)"
    )]
    InvalidLength {
        /// Length read from the mailbox.
        announced: usize,
        /// Bytes still expected by the consumer.
        remaining: usize,
        /// Bytes moved before the abort.
        transferred: usize,
    },

    /// A packed record was malformed.
    #[error("packed record corrupt: {0}")]
    PackCorrupt(String),

    /// The peer lock is held by another caller.
    #[error("{0} is busy with another transfer")]
    PeerBusy(PeerId),

    /// An earlier transfer failed; the peer must be destroyed and re-created.
    #[error("{0} is faulted by an earlier failed transfer")]
    PeerFaulted(PeerId),

    /// A configuration override violates the channel capacity invariant.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The block-transfer engine reported a hard failure.
    #[error("DMA engine failure: {0}")]
    Dma(String),

    /// The offload runtime failed to issue or complete a call.
    #[error("offload runtime failure: {0}")]
    Offload(String),

    /// The remote call finished short of the requested length.
    #[error("remote side aborted ({status}) after {transferred} of {requested} bytes")]
    RemoteAborted {
        /// Status the remote side reported.
        status: ReplyStatus,
        /// Bytes moved before the abort.
        transferred: usize,
        /// Bytes requested.
        requested: usize,
    },

    /// No peer is registered under this id.
    #[error("unknown {0}")]
    UnknownPeer(PeerId),

    /// No process is registered under this id.
    #[error("unknown {0}")]
    UnknownProcess(ProcessId),

    /// The execution context already drives a peer.
    #[error("context {0:?} already drives a peer")]
    ContextInUse(ContextHandle),

    /// Invalid memory segment operation.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Peer descriptor could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Bytes moved before a transfer-aborting error, if this error carries a count.
    pub fn transferred(&self) -> Option<usize> {
        match self {
            Error::Timeout { transferred, .. }
            | Error::InvalidLength { transferred, .. }
            | Error::RemoteAborted { transferred, .. } => Some(*transferred),
            _ => None,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Exhausted(_) => "exhausted",
            Error::Resolution { .. } => "resolution",
            Error::RemoteInitFailed(_) => "remote_init",
            Error::RemoteFiniFailed(_) => "remote_fini",
            Error::Timeout { .. } => "timeout",
            Error::InvalidLength { .. } => "invalid_length",
            Error::PackCorrupt(_) => "pack_corrupt",
            Error::PeerBusy(_) => "peer_busy",
            Error::PeerFaulted(_) => "peer_faulted",
            Error::ConfigInvalid(_) => "config_invalid",
            Error::Dma(_) => "dma",
            Error::Offload(_) => "offload",
            Error::RemoteAborted { .. } => "remote_aborted",
            Error::UnknownPeer(_) => "unknown_peer",
            Error::UnknownProcess(_) => "unknown_process",
            Error::ContextInUse(_) => "context_in_use",
            Error::InvalidSegment(_) => "invalid_segment",
            Error::AllocationFailed(_) => "allocation_failed",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::System(_) => "system",
        }
    }

    /// Whether this error leaves the peer's channel slots in an undefined state.
    pub(crate) fn faults_peer(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::InvalidLength { .. }
                | Error::PackCorrupt(_)
                | Error::Dma(_)
                | Error::Offload(_)
                | Error::RemoteAborted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transferred_is_reported_for_aborts() {
        let err = Error::Timeout {
            waited: Duration::from_millis(5),
            transferred: 42,
        };
        assert_eq!(err.transferred(), Some(42));
        assert!(err.faults_peer());

        let err = Error::PeerBusy(PeerId(3));
        assert_eq!(err.transferred(), None);
        assert!(!err.faults_peer());
        assert_eq!(err.to_string(), "peer#3 is busy with another transfer");
    }

    #[test]
    fn test_invalid_length_message() {
        let err = Error::InvalidLength {
            announced: 4096,
            remaining: 100,
            transferred: 8,
        };
        assert_eq!(err.kind(), "invalid_length");
        assert!(err.to_string().contains("4096"));
    }
}
