//! Single-word access through the address map.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use super::AddressMap;
use crate::error::{Error, Result};
use crate::runtime::{DmaAddr, WordAccess};

/// [`WordAccess`] over registered regions, using atomic loads and stores.
#[derive(Debug)]
pub struct LoopbackWords {
    map: Arc<AddressMap>,
}

impl LoopbackWords {
    /// Word access over `map`.
    pub fn new(map: Arc<AddressMap>) -> Self {
        Self { map }
    }

    fn word(&self, addr: DmaAddr) -> Result<&AtomicU64> {
        let ptr = self.map.translate(addr, 8)?;
        if ptr as usize % 8 != 0 {
            return Err(Error::Dma(format!("{addr} is not word aligned")));
        }
        // SAFETY: aligned, inside a live registration, and every access to
        // mailbox words is atomic on both sides.
        Ok(unsafe { AtomicU64::from_ptr(ptr.cast::<u64>()) })
    }
}

impl WordAccess for LoopbackWords {
    fn load_word(&self, addr: DmaAddr) -> Result<u64> {
        Ok(self.word(addr)?.load(Ordering::Acquire))
    }

    fn store_word(&self, addr: DmaAddr, value: u64) -> Result<()> {
        self.word(addr)?.store(value, Ordering::Release);
        Ok(())
    }

    fn fence_before(&self) {
        fence(Ordering::SeqCst);
    }

    fn fence_after(&self) {
        fence(Ordering::SeqCst);
    }
}
