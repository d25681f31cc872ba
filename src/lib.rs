//! # udma
//!
//! Split-pipelined bulk transfers between a host process and an
//! accelerator process that share one memory segment per peer.
//!
//! A transfer is cut into chunks that move through a ring of slots in the
//! shared segment. Each slot is handed back and forth through a one-word
//! mailbox, so the host copies chunk *n + 1* while the accelerator's DMA
//! engine moves chunk *n*. Small transfers are packed into one record
//! stream and delivered by a single split transfer.
//!
//! ## Features
//!
//! - **Split pipelining**: slot count and chunk size chosen per transfer
//!   from measured tables, or forced through configuration
//! - **Packing**: many small sends committed as one transfer, many small
//!   receives gathered as one transfer
//! - **Non-blocking peers**: one transfer per peer at a time; contention is
//!   reported as [`Error::PeerBusy`] instead of waiting
//! - **Loopback accelerator**: [`loopback`] runs the remote role in-process
//!   over memfd segments, for tests and benchmarks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use udma::loopback::LoopbackNode;
//! use udma::prelude::*;
//!
//! # fn main() -> udma::Result<()> {
//! let node = LoopbackNode::new();
//! let registry = node.registry(UdmaConfig::from_env())?;
//!
//! let (process, code, ctx) = node.open()?;
//! let pid = registry.register_process(0, process, code)?;
//! let peer = registry.create_peer(pid, ctx)?;
//!
//! let buffer = node.memory.alloc(1 << 20)?;
//! registry.send(peer, &vec![7u8; 1 << 20], buffer)?;
//!
//! let mut back = vec![0u8; 1 << 20];
//! registry.recv(peer, &mut back, buffer)?;
//! registry.destroy_peer(peer)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod accel;
pub mod channel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod memory;
pub mod observability;
pub mod pack;
pub mod peer;
pub mod poll;
pub mod registry;
pub mod runtime;
pub mod split;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::UdmaConfig;
    pub use crate::error::{Error, PeerId, ProcessId, Result};
    pub use crate::peer::{PeerGuard, RecvBatch};
    pub use crate::registry::Registry;
    pub use crate::runtime::{CodeHandle, ContextHandle, ProcessHandle, RemoteAddr};
    pub use crate::split::{Direction, SplitPlan};
}

pub use config::UdmaConfig;
pub use error::{Error, PeerId, ProcessId, Result};
pub use peer::{PeerGuard, RecvBatch};
pub use registry::Registry;
pub use runtime::RemoteAddr;
pub use split::{Direction, SplitPlan, SplitSelector};
