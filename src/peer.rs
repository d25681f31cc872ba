//! Local-role peer and its lock.
//!
//! A [`Peer`] owns one shared segment and drives one remote execution
//! context. All transfer and pack operations go through a [`PeerGuard`],
//! obtained with a non-blocking acquire: a peer already in use reports
//! [`Error::PeerBusy`] instead of queueing the caller.
//!
//! Any transfer that fails part-way leaves the mailboxes in an unknown
//! state, so the peer is marked faulted and refuses further work with
//! [`Error::PeerFaulted`] until it is destroyed.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::accel::{recv_args, send_args, send_packed_args};
use crate::channel::SubChannel;
use crate::config::{UDMA_MAX_RECV_PACK, UdmaConfig};
use crate::engine::{RemoteCall, local};
use crate::error::{Error, PeerId, ProcessId, Result};
use crate::memory::MemorySegment;
use crate::observability::{PeerMetrics, instrument_transfer, trace_plan, trace_transfer_failed};
use crate::pack::{PackBuffer, RecvEntry, align8, encode_entries, scatter, staged_len};
use crate::poll::PollPolicy;
use crate::runtime::{
    ContextHandle, EntryAddr, OffloadRuntime, RemoteAddr, SegmentId, SegmentKey,
};
use crate::split::{Direction, SplitSelector};

/// Resolved remote entry points of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoints {
    /// `udma_init`.
    pub init: EntryAddr,
    /// `udma_fini`.
    pub fini: EntryAddr,
    /// `udma_send`: remote sends, local receives.
    pub send: EntryAddr,
    /// `udma_recv`: remote receives, local sends.
    pub recv: EntryAddr,
    /// `udma_send_packed`, if the loaded code exports it.
    pub send_packed: Option<EntryAddr>,
}

/// Pack thresholds of a peer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PackLimits {
    pub send_max: usize,
    pub send_direct: usize,
    pub recv_max: usize,
    pub recv_direct: usize,
}

impl PackLimits {
    pub(crate) fn from_config(config: &UdmaConfig) -> Self {
        Self {
            send_max: config.pack_send_max,
            send_direct: config.pack_send_direct,
            recv_max: config.pack_recv_max,
            recv_direct: config.pack_recv_direct,
        }
    }
}

/// State only the lock holder touches.
struct PeerState {
    pack: PackBuffer,
    faulted: bool,
    retired: bool,
}

/// One transport endpoint.
pub struct Peer {
    id: PeerId,
    process: ProcessId,
    ctx: ContextHandle,
    entries: EntryPoints,
    segment: SegmentId,
    key: SegmentKey,
    region: Arc<dyn MemorySegment>,
    send: SubChannel,
    recv: SubChannel,
    runtime: Arc<dyn OffloadRuntime>,
    selector: SplitSelector,
    policy: PollPolicy,
    limits: PackLimits,
    metrics: PeerMetrics,
    held: AtomicBool,
    state: UnsafeCell<PeerState>,
}

// SAFETY: `state` is only reached through a PeerGuard, and at most one
// guard exists per peer (`held` is acquired with a compare-exchange).
unsafe impl Sync for Peer {}

/// Everything needed to assemble a [`Peer`].
pub(crate) struct PeerParts {
    pub id: PeerId,
    pub process: ProcessId,
    pub ctx: ContextHandle,
    pub entries: EntryPoints,
    pub segment: SegmentId,
    pub key: SegmentKey,
    pub region: Arc<dyn MemorySegment>,
    pub send: SubChannel,
    pub recv: SubChannel,
    pub runtime: Arc<dyn OffloadRuntime>,
    pub selector: SplitSelector,
    pub policy: PollPolicy,
    pub limits: PackLimits,
}

impl Peer {
    pub(crate) fn new(parts: PeerParts) -> Self {
        Self {
            id: parts.id,
            process: parts.process,
            ctx: parts.ctx,
            entries: parts.entries,
            segment: parts.segment,
            key: parts.key,
            region: parts.region,
            send: parts.send,
            recv: parts.recv,
            runtime: parts.runtime,
            selector: parts.selector,
            policy: parts.policy,
            metrics: PeerMetrics::new(parts.id),
            state: UnsafeCell::new(PeerState {
                pack: PackBuffer::new(parts.limits.send_max),
                faulted: false,
                retired: false,
            }),
            limits: parts.limits,
            held: AtomicBool::new(false),
        }
    }

    /// Acquire the peer lock without blocking.
    pub fn try_lock(self: &Arc<Self>) -> Result<PeerGuard> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Error::PeerBusy(self.id))?;
        Ok(PeerGuard { peer: self.clone() })
    }

    /// Peer index.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Owning process.
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Remote execution context this peer drives.
    pub fn context(&self) -> ContextHandle {
        self.ctx
    }

    /// Shared segment of the peer.
    pub fn segment(&self) -> (SegmentId, SegmentKey) {
        (self.segment, self.key)
    }

    /// Bytes of the shared segment.
    pub fn segment_len(&self) -> usize {
        self.region.len()
    }

    /// Entry points calls are issued to.
    pub fn entries(&self) -> &EntryPoints {
        &self.entries
    }

    /// Sub-channel local sends go through.
    pub fn send_channel(&self) -> &SubChannel {
        &self.send
    }

    /// Sub-channel local receives go through.
    pub fn recv_channel(&self) -> &SubChannel {
        &self.recv
    }

    /// Whether the lock is held.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("process", &self.process)
            .field("ctx", &self.ctx)
            .field("segment", &self.segment)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Exclusive access to a peer; released on drop.
pub struct PeerGuard {
    peer: Arc<Peer>,
}

impl Deref for PeerGuard {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.peer.held.store(false, Ordering::Release);
    }
}

impl PeerGuard {
    fn state(&mut self) -> &mut PeerState {
        // SAFETY: this guard is the only one for the peer.
        unsafe { &mut *self.peer.state.get() }
    }

    fn usable(&mut self) -> Result<()> {
        if self.state().retired {
            return Err(Error::UnknownPeer(self.peer.id));
        }
        if self.state().faulted {
            return Err(Error::PeerFaulted(self.peer.id));
        }
        Ok(())
    }

    /// Mark the peer destroyed; every later operation reports
    /// [`Error::UnknownPeer`], even through a stale handle.
    pub(crate) fn retire(&mut self) {
        let state = self.state();
        state.retired = true;
        state.pack.clear();
    }

    /// Whether an earlier transfer failed on this peer.
    pub fn is_faulted(&mut self) -> bool {
        self.state().faulted
    }

    /// Run one split transfer with span, metrics and fault tracking.
    fn tracked(
        &mut self,
        direction: Direction,
        len: usize,
        transfer: impl FnOnce(&Peer) -> Result<usize>,
    ) -> Result<usize> {
        self.usable()?;
        let peer = self.peer.clone();
        let _span = instrument_transfer(peer.id, direction, len);
        let timer = peer.metrics.start_timer(direction);
        let outcome = transfer(&peer);
        timer.finish(&outcome, len);
        if let Err(e) = &outcome {
            trace_transfer_failed(peer.id, direction, e);
            if e.faults_peer() {
                self.state().faulted = true;
            }
        }
        outcome
    }

    /// Send `src` to remote address `dst`.
    pub fn send(&mut self, src: &[u8], dst: RemoteAddr) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        self.tracked(Direction::Send, src.len(), |peer| {
            let plan = peer.selector.select(Direction::Send, src.len());
            trace_plan(Direction::Send, src.len(), plan);
            let args = recv_args(dst, src.len(), plan, false);
            let mut call = RemoteCall::issue(&*peer.runtime, peer.ctx, peer.entries.recv, args)?;
            local::send(&peer.send, plan, src, &mut call, &peer.policy)
        })
    }

    /// Receive `dst.len()` bytes from remote address `src`.
    pub fn recv(&mut self, dst: &mut [u8], src: RemoteAddr) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let len = dst.len();
        self.tracked(Direction::Recv, len, |peer| {
            let plan = peer.selector.select(Direction::Recv, len);
            trace_plan(Direction::Recv, len, plan);
            let args = send_args(src, len, plan);
            let mut call = RemoteCall::issue(&*peer.runtime, peer.ctx, peer.entries.send, args)?;
            local::recv(&peer.recv, plan, dst, &mut call, &peer.policy)
        })
    }

    /// Queue `src` for remote address `dst`.
    ///
    /// Records above the direct threshold are sent at once, after any
    /// pending records. A record that does not fit commits the buffer first.
    pub fn pack_append(&mut self, src: &[u8], dst: RemoteAddr) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        if dst.is_null() {
            return Err(Error::PackCorrupt("record with a null destination".into()));
        }
        self.usable()?;
        if src.len() > self.peer.limits.send_direct {
            self.pack_commit()?;
            return self.send(src, dst);
        }
        if !self.state().pack.fits(src.len()) {
            self.pack_commit()?;
        }
        self.state().pack.push(dst, src)?;
        Ok(src.len())
    }

    /// Send every pending record as one transfer. Returns the bytes of the
    /// committed buffer; an empty buffer commits nothing.
    pub fn pack_commit(&mut self) -> Result<usize> {
        if self.state().pack.is_empty() {
            return Ok(0);
        }
        // The buffer is moved out for the transfer and put back cleared.
        let mut pack = std::mem::replace(&mut self.state().pack, PackBuffer::new(0));
        let records = pack.records();
        let len = pack.len();
        let outcome = self.tracked(Direction::Send, len, |peer| {
            let plan = peer.selector.select(Direction::Send, len);
            let args = recv_args(RemoteAddr::NULL, len, plan, true);
            let mut call = RemoteCall::issue(&*peer.runtime, peer.ctx, peer.entries.recv, args)?;
            local::send(&peer.send, plan, pack.as_bytes(), &mut call, &peer.policy)
        });
        pack.clear();
        self.state().pack = pack;
        if outcome.is_ok() {
            self.peer.metrics.record_pack_commit(Direction::Send, records);
            debug!("{} committed {} records in {} bytes", self.peer.id, records, len);
        }
        outcome
    }

    /// Records waiting in the send pack buffer.
    pub fn pending_records(&mut self) -> usize {
        self.state().pack.records()
    }

    /// Fetch every `entries[i]` into `dsts[i]` with one remote call.
    fn gather(&mut self, entries: &[RecvEntry], dsts: Vec<&mut [u8]>) -> Result<usize> {
        let Some(entry) = self.peer.entries.send_packed else {
            return Err(Error::Resolution {
                entry: crate::accel::ENTRY_SEND_PACKED,
            });
        };
        let total = staged_len(entries);
        let mut staging = vec![0u8; total];
        self.tracked(Direction::Recv, total, |peer| {
            let plan = peer.selector.select(Direction::Recv, total);
            let args = send_packed_args(encode_entries(entries), total, plan);
            let mut call = RemoteCall::issue(&*peer.runtime, peer.ctx, entry, args)?;
            local::recv(&peer.recv, plan, &mut staging, &mut call, &peer.policy)
        })?;
        let delivered = scatter(&staging, dsts)?;
        self.peer
            .metrics
            .record_pack_commit(Direction::Recv, entries.len());
        Ok(delivered)
    }
}

impl std::fmt::Debug for PeerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PeerGuard").field(&self.peer.id).finish()
    }
}

/// A batch of small receives, fetched with one remote call per commit.
///
/// Holds the peer lock for its whole life. Requests land in their
/// destinations only once the batch commits, explicitly or because it
/// filled up; dropping a batch discards uncommitted requests.
pub struct RecvBatch<'a> {
    guard: PeerGuard,
    entries: Vec<RecvEntry>,
    dsts: Vec<&'a mut [u8]>,
    staged: usize,
}

impl<'a> RecvBatch<'a> {
    pub(crate) fn new(guard: PeerGuard) -> Result<Self> {
        let mut guard = guard;
        guard.usable()?;
        Ok(Self {
            guard,
            entries: Vec::new(),
            dsts: Vec::new(),
            staged: 0,
        })
    }

    /// Queue a receive of `dst.len()` bytes from remote address `src`.
    ///
    /// Requests above the direct threshold are received at once.
    pub fn request(&mut self, src: RemoteAddr, dst: &'a mut [u8]) -> Result<usize> {
        let len = dst.len();
        if len == 0 {
            return Ok(0);
        }
        if src.is_null() {
            return Err(Error::PackCorrupt("request with a null source".into()));
        }
        if len > self.guard.limits.recv_direct {
            return self.guard.recv(dst, src);
        }
        if self.entries.len() == UDMA_MAX_RECV_PACK
            || self.staged + align8(len) > self.guard.limits.recv_max
        {
            self.commit()?;
        }
        self.entries.push(RecvEntry { src, len });
        self.dsts.push(dst);
        self.staged += align8(len);
        Ok(len)
    }

    /// Fetch every queued request. Returns the payload bytes delivered.
    pub fn commit(&mut self) -> Result<usize> {
        if self.entries.is_empty() {
            return Ok(0);
        }
        let entries = std::mem::take(&mut self.entries);
        let dsts = std::mem::take(&mut self.dsts);
        self.staged = 0;
        self.guard.gather(&entries, dsts)
    }

    /// Commit and release the peer.
    pub fn finish(mut self) -> Result<usize> {
        self.commit()
    }

    /// Requests waiting for the next commit.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for RecvBatch<'_> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                "{} discarding {} uncommitted receive requests",
                self.guard.id,
                self.entries.len()
            );
        }
    }
}
