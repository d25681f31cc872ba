//! DMA address translation table.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::runtime::DmaAddr;

/// First address handed out.
const BASE: u64 = 0x10_0000_0000;

/// Unmapped gap between regions, so an overrun never lands in a neighbour.
const GUARD: u64 = 0x1000;

#[derive(Debug, Clone, Copy)]
struct Region {
    /// Host address of the first byte.
    host: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct MapState {
    regions: BTreeMap<u64, Region>,
    next: u64,
}

/// Maps DMA addresses of registered regions back to host pointers.
///
/// Shared by the loopback DMA engine, word access and segment provider so
/// an address registered through any of them resolves in all of them.
#[derive(Debug)]
pub struct AddressMap {
    state: RwLock<MapState>,
}

impl AddressMap {
    /// An empty map.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MapState {
                regions: BTreeMap::new(),
                next: BASE,
            }),
        }
    }

    /// Register `len` bytes at `ptr` and return their DMA address.
    pub fn register(&self, ptr: *mut u8, len: usize) -> DmaAddr {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let addr = state.next;
        let span = (len as u64).div_ceil(GUARD) * GUARD;
        state.next = addr + span + GUARD;
        state.regions.insert(
            addr,
            Region {
                host: ptr as usize,
                len,
            },
        );
        DmaAddr(addr)
    }

    /// Remove the region registered at `addr`.
    pub fn unregister(&self, addr: DmaAddr) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .regions
            .remove(&addr.0)
            .map(|_| ())
            .ok_or_else(|| Error::Dma(format!("{addr} is not a registered region")))
    }

    /// Host pointer for `len` bytes at `addr`.
    pub fn translate(&self, addr: DmaAddr, len: usize) -> Result<*mut u8> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let (&start, region) = state
            .regions
            .range(..=addr.0)
            .next_back()
            .ok_or_else(|| Error::Dma(format!("{addr} is not mapped")))?;
        let offset = (addr.0 - start) as usize;
        if offset.checked_add(len).is_none_or(|end| end > region.len) {
            return Err(Error::Dma(format!(
                "{addr}+{len} overruns a {}-byte region",
                region.len
            )));
        }
        Ok((region.host + offset) as *mut u8)
    }

    /// Number of registered regions.
    pub fn regions(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .regions
            .len()
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        Self::new()
    }
}
