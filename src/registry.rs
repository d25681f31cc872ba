//! Process and peer tables, and the public transfer API.
//!
//! A [`Registry`] owns every process and peer it creates; ids are indices
//! into fixed-size tables. Transfers look a peer up, take its lock without
//! blocking and run with the table lock released, so distinct peers never
//! wait on each other.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::accel::{ENTRY_FINI, ENTRY_INIT, ENTRY_RECV, ENTRY_SEND, ENTRY_SEND_PACKED, PeerDescriptor};
use crate::channel::{ChannelLayout, SubChannel};
use crate::config::{UDMA_MAX_PEERS, UDMA_MAX_PROCS, UdmaConfig};
use crate::engine::RemoteCall;
use crate::error::{Error, PeerId, ProcessId, Result};
use crate::memory::MemorySegment;
use crate::observability::span_peer;
use crate::peer::{EntryPoints, PackLimits, Peer, PeerGuard, PeerParts, RecvBatch};
use crate::poll::PollPolicy;
use crate::runtime::{
    CallArgs, CodeHandle, ContextHandle, OffloadRuntime, ProcessHandle, RemoteAddr, SegmentId,
    SegmentKey, SegmentProvider,
};
use crate::split::SplitSelector;

/// One accelerator process.
#[derive(Debug, Clone)]
struct Process {
    handle: ProcessHandle,
    entries: EntryPoints,
    /// Live and reserved peers.
    peers: usize,
}

#[derive(Debug)]
enum PeerSlot {
    Free,
    /// Being created; the context is claimed.
    Reserved(ContextHandle),
    Live(Arc<Peer>),
}

#[derive(Debug)]
struct Tables {
    processes: Vec<Option<Process>>,
    peers: Vec<PeerSlot>,
}

impl Tables {
    fn process(&self, pid: ProcessId) -> Result<&Process> {
        self.processes
            .get(pid.0)
            .and_then(Option::as_ref)
            .ok_or(Error::UnknownProcess(pid))
    }

    fn peer(&self, id: PeerId) -> Result<&Arc<Peer>> {
        match self.peers.get(id.0) {
            Some(PeerSlot::Live(peer)) => Ok(peer),
            _ => Err(Error::UnknownPeer(id)),
        }
    }

    fn context_in_use(&self, ctx: ContextHandle) -> bool {
        self.peers.iter().any(|slot| match slot {
            PeerSlot::Reserved(c) => *c == ctx,
            PeerSlot::Live(peer) => peer.context() == ctx,
            PeerSlot::Free => false,
        })
    }

    /// Drop one peer reference of `pid`, removing the process at zero.
    fn release_process(&mut self, pid: ProcessId) {
        if let Some(slot) = self.processes.get_mut(pid.0) {
            if let Some(process) = slot.as_mut() {
                process.peers = process.peers.saturating_sub(1);
                if process.peers == 0 {
                    debug!("releasing process {} ({})", pid, process.handle);
                    *slot = None;
                }
            }
        }
    }
}

/// Entry point of the transport.
///
/// # Example
///
/// ```rust,no_run
/// use udma::loopback::LoopbackNode;
/// use udma::UdmaConfig;
///
/// # fn main() -> udma::Result<()> {
/// let node = LoopbackNode::new();
/// let registry = node.registry(UdmaConfig::from_env())?;
/// let (process, code, ctx) = node.open()?;
/// let pid = registry.register_process(0, process, code)?;
/// let peer = registry.create_peer(pid, ctx)?;
///
/// let remote = node.memory.alloc(64)?;
/// registry.pack_append(peer, b"small", remote)?;
/// registry.pack_commit(peer)?;
///
/// let mut back = [0u8; 5];
/// registry.recv(peer, &mut back, remote)?;
/// assert_eq!(&back, b"small");
/// registry.destroy_peer(peer)?;
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    runtime: Arc<dyn OffloadRuntime>,
    segments: Arc<dyn SegmentProvider>,
    config: UdmaConfig,
    layout: ChannelLayout,
    selector: SplitSelector,
    policy: PollPolicy,
    tables: Mutex<Tables>,
}

impl Registry {
    /// A registry issuing calls through `runtime` and allocating segments
    /// from `segments`.
    ///
    /// Fails with [`Error::ConfigInvalid`] if `config` breaks a channel
    /// invariant.
    pub fn new(
        runtime: Arc<dyn OffloadRuntime>,
        segments: Arc<dyn SegmentProvider>,
        config: UdmaConfig,
    ) -> Result<Self> {
        config.validate()?;
        let layout = config.layout()?;
        let selector = SplitSelector::from_config(&config)?;
        debug!(
            "registry: {} byte regions, {} byte data areas, timeout {:?}",
            layout.region_len(),
            layout.data_len(),
            config.timeout
        );
        Ok(Self {
            runtime,
            segments,
            policy: PollPolicy::from_config(&config),
            config,
            layout,
            selector,
            tables: Mutex::new(Tables {
                processes: vec![None; UDMA_MAX_PROCS],
                peers: (0..UDMA_MAX_PEERS).map(|_| PeerSlot::Free).collect(),
            }),
        })
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Configuration in effect.
    pub fn config(&self) -> &UdmaConfig {
        &self.config
    }

    /// Layout of every sub-channel.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Split selector transfers use.
    pub fn selector(&self) -> &SplitSelector {
        &self.selector
    }

    /// Track an accelerator process and resolve its entry points.
    ///
    /// Registering the same process handle again returns the existing id.
    pub fn register_process(
        &self,
        node: u32,
        process: ProcessHandle,
        code: CodeHandle,
    ) -> Result<ProcessId> {
        let mut tables = self.tables();
        if let Some(index) = tables
            .processes
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.handle == process))
        {
            return Ok(ProcessId(index));
        }
        let index = tables
            .processes
            .iter()
            .position(Option::is_none)
            .ok_or(Error::Exhausted("process"))?;

        let resolve = |entry: &'static str| {
            self.runtime
                .resolve_entry_point(process, code, entry)
                .ok_or(Error::Resolution { entry })
        };
        let entries = EntryPoints {
            init: resolve(ENTRY_INIT)?,
            fini: resolve(ENTRY_FINI)?,
            send: resolve(ENTRY_SEND)?,
            recv: resolve(ENTRY_RECV)?,
            send_packed: resolve(ENTRY_SEND_PACKED).ok(),
        };
        if entries.send_packed.is_none() {
            debug!("{} has no {}; receive batches unavailable", process, ENTRY_SEND_PACKED);
        }

        tables.processes[index] = Some(Process {
            handle: process,
            entries,
            peers: 0,
        });
        debug!("registered process {} on node {} as proc#{}", process, node, index);
        Ok(ProcessId(index))
    }

    /// Create a peer driving execution context `ctx` of process `pid`.
    pub fn create_peer(&self, pid: ProcessId, ctx: ContextHandle) -> Result<PeerId> {
        let _span = span_peer("create", pid, ctx).entered();

        let (slot, entries) = {
            let mut tables = self.tables();
            let entries = tables.process(pid)?.entries;
            if tables.context_in_use(ctx) {
                return Err(Error::ContextInUse(ctx));
            }
            let slot = tables
                .peers
                .iter()
                .position(|s| matches!(s, PeerSlot::Free))
                .ok_or(Error::Exhausted("peer"))?;
            tables.peers[slot] = PeerSlot::Reserved(ctx);
            if let Some(process) = tables.processes[pid.0].as_mut() {
                process.peers += 1;
            }
            (slot, entries)
        };

        match self.build_peer(PeerId(slot), pid, ctx, entries) {
            Ok(peer) => {
                self.tables().peers[slot] = PeerSlot::Live(Arc::new(peer));
                debug!("created peer#{} on {} context {}", slot, pid, ctx);
                Ok(PeerId(slot))
            }
            Err(e) => {
                let mut tables = self.tables();
                tables.peers[slot] = PeerSlot::Free;
                tables.release_process(pid);
                Err(e)
            }
        }
    }

    fn build_peer(
        &self,
        id: PeerId,
        pid: ProcessId,
        ctx: ContextHandle,
        entries: EntryPoints,
    ) -> Result<Peer> {
        let region_len = self.layout.region_len();
        let key = SegmentKey((pid.0 * UDMA_MAX_PEERS + id.0) as u64);
        let (segment, region) = self
            .segments
            .create(key, 2 * region_len)
            .map_err(|e| Error::ResourceExhausted(format!("segment {key}: {e}")))?;

        let peer = self.wire_peer(id, pid, ctx, entries, segment, key, region);
        if peer.is_err() {
            if let Err(e) = self.segments.destroy(segment) {
                warn!("destroying segment {} after failed setup: {}", segment, e);
            }
        }
        peer
    }

    #[allow(clippy::too_many_arguments)]
    fn wire_peer(
        &self,
        id: PeerId,
        pid: ProcessId,
        ctx: ContextHandle,
        entries: EntryPoints,
        segment: SegmentId,
        key: SegmentKey,
        region: Arc<dyn MemorySegment>,
    ) -> Result<Peer> {
        let region_len = self.layout.region_len();
        let send = SubChannel::new(region.clone(), 0, self.layout)?;
        let recv = SubChannel::new(region.clone(), region_len, self.layout)?;
        send.initialize();
        recv.initialize();

        let descriptor = PeerDescriptor {
            peer_id: id.0 as u64,
            segment_id: segment.0,
            segment_key: key.0,
            segment_len: region.len() as u64,
            host_base: region.as_ptr() as u64,
            send_channel: send.address(),
            recv_channel: recv.address(),
            region_len: region_len as u64,
            max_split: self.layout.max_split() as u64,
            timeout_ns: self.config.timeout.as_nanos() as u64,
        };
        let args = CallArgs::new().bytes(descriptor.encode()?);
        let status = RemoteCall::issue(&*self.runtime, ctx, entries.init, args)?.wait()?;
        if status != 0 {
            return Err(Error::RemoteInitFailed(status as i64));
        }

        Ok(Peer::new(PeerParts {
            id,
            process: pid,
            ctx,
            entries,
            segment,
            key,
            region,
            send,
            recv,
            runtime: self.runtime.clone(),
            selector: self.selector.clone(),
            policy: self.policy,
            limits: PackLimits::from_config(&self.config),
        }))
    }

    /// Tear a peer down.
    ///
    /// Fails with [`Error::PeerBusy`] while a transfer or batch holds the
    /// peer. Otherwise local resources are always released; a remote fini
    /// failure is reported after cleanup.
    pub fn destroy_peer(&self, id: PeerId) -> Result<()> {
        let mut guard = self.lock(id)?;
        guard.retire();
        let _span = span_peer("destroy", guard.process(), guard.context()).entered();
        {
            let mut tables = self.tables();
            tables.peers[id.0] = PeerSlot::Free;
            tables.release_process(guard.process());
        }

        let fini = RemoteCall::issue(&*self.runtime, guard.context(), guard.entries().fini, CallArgs::new())
            .and_then(|mut call| call.wait())
            .and_then(|status| match status {
                0 => Ok(()),
                code => Err(Error::RemoteFiniFailed(code as i64)),
            });
        if let Err(e) = &fini {
            warn!("{} remote fini: {}", id, e);
        }
        let (segment, _) = guard.segment();
        if let Err(e) = self.segments.destroy(segment) {
            warn!("{} destroying segment {}: {}", id, segment, e);
        }
        debug!("destroyed {}", id);
        fini
    }

    /// Acquire `id` for exclusive use.
    pub fn lock(&self, id: PeerId) -> Result<PeerGuard> {
        let peer = self.tables().peer(id)?.clone();
        peer.try_lock()
    }

    /// Peer driving execution context `ctx`, if any.
    pub fn peer_for_context(&self, ctx: ContextHandle) -> Option<PeerId> {
        self.tables().peers.iter().enumerate().find_map(|(i, slot)| match slot {
            PeerSlot::Live(peer) if peer.context() == ctx => Some(PeerId(i)),
            _ => None,
        })
    }

    /// Number of live peers.
    pub fn peer_count(&self) -> usize {
        self.tables()
            .peers
            .iter()
            .filter(|s| matches!(s, PeerSlot::Live(_)))
            .count()
    }

    /// Number of registered processes.
    pub fn process_count(&self) -> usize {
        self.tables().processes.iter().flatten().count()
    }

    /// Send `src` to remote address `dst`. Returns `src.len()`.
    pub fn send(&self, id: PeerId, src: &[u8], dst: RemoteAddr) -> Result<usize> {
        self.lock(id)?.send(src, dst)
    }

    /// Receive `dst.len()` bytes from remote address `src`.
    pub fn recv(&self, id: PeerId, dst: &mut [u8], src: RemoteAddr) -> Result<usize> {
        self.lock(id)?.recv(dst, src)
    }

    /// Queue a small send; see [`PeerGuard::pack_append`].
    pub fn pack_append(&self, id: PeerId, src: &[u8], dst: RemoteAddr) -> Result<usize> {
        self.lock(id)?.pack_append(src, dst)
    }

    /// Flush the send pack buffer of `id`.
    pub fn pack_commit(&self, id: PeerId) -> Result<usize> {
        self.lock(id)?.pack_commit()
    }

    /// Start a batch of small receives on `id`. The peer stays locked
    /// until the batch is dropped.
    pub fn recv_batch<'a>(&self, id: PeerId) -> Result<RecvBatch<'a>> {
        RecvBatch::new(self.lock(id)?)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let live: Vec<PeerId> = self
            .tables()
            .peers
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, PeerSlot::Live(_)))
            .map(|(i, _)| PeerId(i))
            .collect();
        for id in live {
            if let Err(e) = self.destroy_peer(id) {
                warn!("dropping registry: {}: {}", id, e);
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("layout", &self.layout)
            .field("peers", &self.peer_count())
            .field("processes", &self.process_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNode;

    fn small_config() -> UdmaConfig {
        UdmaConfig::default()
            .with_buff_len(4 * 1024 * 1024)
            .with_send_packing(64 * 1024, 4096)
            .with_recv_packing(64 * 1024, 4096)
    }

    #[test]
    fn test_register_process_is_idempotent() {
        let node = LoopbackNode::new();
        let registry = node.registry(small_config()).unwrap();
        let (process, code, _) = node.open().unwrap();

        let a = registry.register_process(0, process, code).unwrap();
        let b = registry.register_process(0, process, code).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.process_count(), 1);
    }

    #[test]
    fn test_process_table_exhaustion() {
        let node = LoopbackNode::new();
        let registry = node.registry(small_config()).unwrap();
        for _ in 0..UDMA_MAX_PROCS {
            let (process, code, _) = node.open().unwrap();
            registry.register_process(0, process, code).unwrap();
        }
        let (process, code, _) = node.open().unwrap();
        assert!(matches!(
            registry.register_process(0, process, code),
            Err(Error::Exhausted("process"))
        ));
    }

    #[test]
    fn test_peer_lifecycle_releases_everything() {
        let node = LoopbackNode::new();
        let registry = node.registry(small_config()).unwrap();
        let (process, code, ctx) = node.open().unwrap();
        let pid = registry.register_process(0, process, code).unwrap();
        let peer = registry.create_peer(pid, ctx).unwrap();

        assert_eq!(registry.peer_for_context(ctx), Some(peer));
        assert!(matches!(registry.create_peer(pid, ctx), Err(Error::ContextInUse(_))));
        assert_eq!(node.segments.live_attachments(), 1);

        registry.destroy_peer(peer).unwrap();
        assert_eq!(registry.peer_count(), 0);
        assert_eq!(registry.process_count(), 0);
        assert_eq!(node.segments.live_segments(), 0);
        assert_eq!(node.segments.live_attachments(), 0);
        assert_eq!(node.map.regions(), 0);
        assert!(matches!(registry.send(peer, &[1], RemoteAddr(8)), Err(Error::UnknownPeer(_))));
    }

    #[test]
    fn test_destroyed_peer_refuses_stale_handles() {
        let node = LoopbackNode::new();
        let registry = node.registry(small_config()).unwrap();
        let (process, code, ctx) = node.open().unwrap();
        let pid = registry.register_process(0, process, code).unwrap();
        let peer = registry.create_peer(pid, ctx).unwrap();
        let remote = node.memory.alloc(64).unwrap();

        let stale = registry.tables().peer(peer).unwrap().clone();
        registry.pack_append(peer, &[5; 16], remote).unwrap();
        registry.destroy_peer(peer).unwrap();

        let mut guard = stale.try_lock().unwrap();
        assert!(matches!(guard.send(&[1; 16], remote), Err(Error::UnknownPeer(p)) if p == peer));
        assert!(matches!(
            guard.recv(&mut [0u8; 16], remote),
            Err(Error::UnknownPeer(_))
        ));
        assert!(matches!(guard.pack_append(&[1; 16], remote), Err(Error::UnknownPeer(_))));
        assert_eq!(guard.pending_records(), 0);
        assert_eq!(guard.pack_commit().unwrap(), 0);
        assert!(matches!(RecvBatch::new(guard), Err(Error::UnknownPeer(_))));
    }

    #[test]
    fn test_missing_entry_point_fails_resolution() {
        let node = LoopbackNode::new();
        node.runtime.hide_entry(ENTRY_SEND);
        let registry = node.registry(small_config()).unwrap();
        let (process, code, _) = node.open().unwrap();
        assert!(matches!(
            registry.register_process(0, process, code),
            Err(Error::Resolution { entry: "udma_send" })
        ));
    }

    #[test]
    fn test_unknown_process() {
        let node = LoopbackNode::new();
        let registry = node.registry(small_config()).unwrap();
        let (_, _, ctx) = node.open().unwrap();
        assert!(matches!(
            registry.create_peer(ProcessId(3), ctx),
            Err(Error::UnknownProcess(ProcessId(3)))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let node = LoopbackNode::new();
        let config = UdmaConfig::default().with_buff_len(1000);
        assert!(matches!(node.registry(config), Err(Error::ConfigInvalid(_))));
    }
}
