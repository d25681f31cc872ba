//! In-process accelerator.
//!
//! Implements every collaborator trait of [`crate::runtime`] on the host so
//! the full transport, both roles included, runs in one process. The remote
//! role still sees only DMA addresses: payload moves through
//! [`LoopbackDma`] and mailboxes through [`LoopbackWords`], both resolving
//! addresses through a shared [`AddressMap`].
//!
//! # Example
//!
//! ```rust,no_run
//! use udma::loopback::LoopbackNode;
//! use udma::UdmaConfig;
//!
//! # fn main() -> udma::Result<()> {
//! let node = LoopbackNode::new();
//! let registry = node.registry(UdmaConfig::default())?;
//! let (process, code, ctx) = node.open()?;
//! let pid = registry.register_process(0, process, code)?;
//! let peer = registry.create_peer(pid, ctx)?;
//!
//! let buffer = node.memory.alloc(4096)?;
//! registry.send(peer, &[7u8; 4096], buffer)?;
//! # Ok(())
//! # }
//! ```

mod address;
mod dma;
mod memory;
mod runtime;
mod segments;
mod words;

pub use address::AddressMap;
pub use dma::LoopbackDma;
pub use memory::AcceleratorMemory;
pub use runtime::LoopbackRuntime;
pub use segments::MemfdSegments;
pub use words::LoopbackWords;

use std::sync::Arc;

use crate::accel::AccelEnv;
use crate::clock::{Clock, SystemClock};
use crate::config::UdmaConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::runtime::{CodeHandle, ContextHandle, ProcessHandle};

/// Descriptors the loopback engine queues by default.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// A complete loopback accelerator.
#[derive(Debug, Clone)]
pub struct LoopbackNode {
    /// DMA address table.
    pub map: Arc<AddressMap>,
    /// Block-transfer engine.
    pub dma: Arc<LoopbackDma>,
    /// Single-word access.
    pub words: Arc<LoopbackWords>,
    /// Shared segments.
    pub segments: Arc<MemfdSegments>,
    /// Accelerator memory holding user buffers.
    pub memory: Arc<AcceleratorMemory>,
    /// Offload runtime.
    pub runtime: Arc<LoopbackRuntime>,
}

impl LoopbackNode {
    /// A node on the system clock with the default queue depth.
    pub fn new() -> Self {
        Self::with_parts(DEFAULT_QUEUE_DEPTH, Arc::new(SystemClock::new()))
    }

    /// A node with a specific DMA queue depth and remote-role clock.
    pub fn with_parts(queue_depth: usize, clock: Arc<dyn Clock>) -> Self {
        let map = Arc::new(AddressMap::new());
        let dma = Arc::new(LoopbackDma::new(map.clone(), queue_depth));
        let words = Arc::new(LoopbackWords::new(map.clone()));
        let segments = Arc::new(MemfdSegments::new(map.clone()));
        let memory = Arc::new(AcceleratorMemory::new());
        let env = AccelEnv {
            dma: dma.clone(),
            words: words.clone(),
            segments: segments.clone(),
            memory: memory.clone(),
            clock,
        };
        let runtime = Arc::new(LoopbackRuntime::new(env));
        Self {
            map,
            dma,
            words,
            segments,
            memory,
            runtime,
        }
    }

    /// A registry driving this node.
    pub fn registry(&self, config: UdmaConfig) -> Result<Registry> {
        Registry::new(self.runtime.clone(), self.segments.clone(), config)
    }

    /// Spawn a process, load the library and open one context in it.
    pub fn open(&self) -> Result<(ProcessHandle, CodeHandle, ContextHandle)> {
        let process = self.runtime.spawn_process(0);
        let code = self.runtime.load_library(process)?;
        let ctx = self.runtime.open_context(process)?;
        Ok((process, code, ctx))
    }
}

impl Default for LoopbackNode {
    fn default() -> Self {
        Self::new()
    }
}
