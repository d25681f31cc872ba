//! In-process block-transfer engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::AddressMap;
use crate::error::{Error, Result};
use crate::runtime::{DmaAddr, DmaEngine, DmaHandle, DmaPoll, Submit};

#[derive(Debug)]
struct Descriptor {
    dst: DmaAddr,
    src: DmaAddr,
    len: usize,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct Queue {
    next: u64,
    pending: HashMap<u64, Descriptor>,
}

/// DMA engine that copies between registered regions when a descriptor is
/// polled to completion.
///
/// The queue holds at most `queue_depth` descriptors; further submissions
/// return [`Submit::Busy`]. A latency makes each descriptor report
/// [`DmaPoll::Pending`] a number of times before it completes, and a stall
/// keeps every descriptor pending.
#[derive(Debug)]
pub struct LoopbackDma {
    map: Arc<AddressMap>,
    queue_depth: usize,
    queue: Mutex<Queue>,
    latency: AtomicU32,
    stalled: AtomicBool,
    busy: AtomicU64,
    completed: AtomicU64,
}

impl LoopbackDma {
    /// An engine over `map` holding `queue_depth` descriptors.
    pub fn new(map: Arc<AddressMap>, queue_depth: usize) -> Self {
        Self {
            map,
            queue_depth: queue_depth.max(1),
            queue: Mutex::new(Queue::default()),
            latency: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
            busy: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Stop (or resume) completing descriptors.
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    /// Pending polls every new descriptor reports before completing.
    pub fn set_latency(&self, polls: u32) {
        self.latency.store(polls, Ordering::Relaxed);
    }

    /// Submissions rejected with [`Submit::Busy`].
    pub fn busy_count(&self) -> u64 {
        self.busy.load(Ordering::Relaxed)
    }

    /// Descriptors completed.
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Descriptors queued and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

impl DmaEngine for LoopbackDma {
    unsafe fn register_region(&self, ptr: *mut u8, len: usize) -> Result<DmaAddr> {
        Ok(self.map.register(ptr, len))
    }

    fn unregister(&self, addr: DmaAddr) -> Result<()> {
        self.map.unregister(addr)
    }

    fn submit(&self, dst: DmaAddr, src: DmaAddr, len: usize) -> Result<Submit> {
        // Reject bad descriptors at submission, as hardware would.
        self.map.translate(dst, len)?;
        self.map.translate(src, len)?;

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.pending.len() >= self.queue_depth {
            self.busy.fetch_add(1, Ordering::Relaxed);
            return Ok(Submit::Busy);
        }
        queue.next += 1;
        let handle = queue.next;
        queue.pending.insert(
            handle,
            Descriptor {
                dst,
                src,
                len,
                polls_left: self.latency.load(Ordering::Relaxed),
            },
        );
        Ok(Submit::Accepted(DmaHandle(handle)))
    }

    fn poll(&self, handle: DmaHandle) -> Result<DmaPoll> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let descriptor = queue
            .pending
            .get_mut(&handle.0)
            .ok_or_else(|| Error::Dma(format!("unknown descriptor {handle}")))?;
        if self.stalled.load(Ordering::Acquire) {
            return Ok(DmaPoll::Pending);
        }
        if descriptor.polls_left > 0 {
            descriptor.polls_left -= 1;
            return Ok(DmaPoll::Pending);
        }

        let Descriptor { dst, src, len, .. } = descriptor;
        let dst = self.map.translate(*dst, *len)?;
        let src = self.map.translate(*src, *len)?;
        // SAFETY: both ranges were translated from live registrations; the
        // transfer protocol keeps every other party off them until completion.
        unsafe { std::ptr::copy(src, dst, *len) };
        queue.pending.remove(&handle.0);
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(DmaPoll::Done)
    }
}
