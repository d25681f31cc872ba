//! Remote-role single-word access and the remote role's own memory.

use super::{DmaAddr, RemoteAddr};
use crate::error::Result;

/// Dedicated single-word load/store instructions.
///
/// Word accesses are not ordered against the block-transfer engine by
/// themselves; callers bracket them with [`fence_before`](Self::fence_before)
/// and [`fence_after`](Self::fence_after).
pub trait WordAccess: Send + Sync {
    /// Load the 64-bit word at `addr`.
    fn load_word(&self, addr: DmaAddr) -> Result<u64>;

    /// Store a 64-bit word at `addr`.
    fn store_word(&self, addr: DmaAddr, value: u64) -> Result<()>;

    /// Order earlier block transfers before the next word access.
    fn fence_before(&self);

    /// Order the last word access before later memory operations.
    fn fence_after(&self);
}

/// Memory owned by the remote role.
///
/// Transfer entry points read sources from and write destinations to this
/// space.
pub trait AddressSpace: Send + Sync {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read(&self, addr: RemoteAddr, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` to `addr`.
    fn write(&self, addr: RemoteAddr, data: &[u8]) -> Result<()>;
}
