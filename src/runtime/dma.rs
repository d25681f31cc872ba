//! Remote-role block-transfer engine.

use super::{DmaAddr, DmaHandle};
use crate::error::Result;

/// Result of submitting a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// The engine accepted the descriptor.
    Accepted(DmaHandle),
    /// The engine is saturated; submit again later.
    Busy,
}

/// Result of polling a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPoll {
    /// The transfer completed and the handle is retired.
    Done,
    /// Still in progress.
    Pending,
}

/// Hardware block-transfer engine.
///
/// Hard failures are returned as [`Error::Dma`](crate::Error::Dma).
/// Saturation is never an error: it is [`Submit::Busy`] or
/// [`DmaPoll::Pending`].
pub trait DmaEngine: Send + Sync {
    /// Register local memory so the engine can address it.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay valid and otherwise unaliased by the engine
    /// until [`unregister`](Self::unregister) is called for the returned address.
    unsafe fn register_region(&self, ptr: *mut u8, len: usize) -> Result<DmaAddr>;

    /// Undo a registration.
    fn unregister(&self, addr: DmaAddr) -> Result<()>;

    /// Queue a transfer of `len` bytes from `src` to `dst`.
    fn submit(&self, dst: DmaAddr, src: DmaAddr, len: usize) -> Result<Submit>;

    /// Check a queued transfer.
    fn poll(&self, handle: DmaHandle) -> Result<DmaPoll>;
}
