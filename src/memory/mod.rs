//! Memory backends.
//!
//! - [`MemorySegment`]: fixed-address region trait
//! - [`SharedMemorySegment`]: memfd-backed, holds a peer's channel region
//! - [`HeapSegment`]: aligned heap allocation for mirror buffers and
//!   accelerator-side memory

mod heap;
mod segment;
mod shared;

pub use heap::{DEFAULT_ALIGN, HeapSegment};
pub use segment::{MemorySegment, MemoryType};
pub use shared::SharedMemorySegment;
