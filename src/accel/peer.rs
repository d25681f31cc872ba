//! Remote-role mirror of one peer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{AccelEnv, PeerDescriptor};
use crate::channel::ChannelLayout;
use crate::engine::remote::{self, RemoteChannel, RemoteIo, mirror_len};
use crate::engine::{Aborted, MemorySink, MemorySource};
use crate::error::{Error, Result};
use crate::memory::{HeapSegment, MemorySegment};
use crate::pack::{GatherSource, RecvEntry, Unpacker};
use crate::poll::PollPolicy;
use crate::runtime::{Attachment, DmaAddr, RemoteAddr, SegmentId};
use crate::split::SplitPlan;

/// Remote-role state created by the init entry point.
///
/// Owns the segment attachment and the DMA-registered mirror; both are
/// released by [`fini`](Self::fini), or on drop if fini never ran.
pub struct RemotePeer {
    env: AccelEnv,
    id: u64,
    segment: SegmentId,
    attachment: Attachment,
    mirror: Arc<HeapSegment>,
    mirror_dma: DmaAddr,
    /// Host send sub-channel; the remote role receives on it.
    inbound: RemoteChannel,
    /// Host receive sub-channel; the remote role sends on it.
    outbound: RemoteChannel,
    policy: PollPolicy,
    released: bool,
}

impl RemotePeer {
    /// Attach the peer's segment, check both sub-channel layouts and
    /// register a mirror buffer.
    pub fn init(env: AccelEnv, desc: &PeerDescriptor) -> Result<Self> {
        let layout = ChannelLayout::new(desc.region_len as usize, desc.max_split as usize)?;
        let segment = SegmentId(desc.segment_id);
        let attachment = env.segments.attach(segment)?;

        match Self::map_channels(&env, desc, layout, attachment) {
            Ok((mirror, mirror_dma, inbound, outbound)) => {
                debug!(
                    "remote peer {} attached segment {} at {}, mirror at {}",
                    desc.peer_id, segment, attachment.base, mirror_dma
                );
                Ok(Self {
                    env,
                    id: desc.peer_id,
                    segment,
                    attachment,
                    mirror,
                    mirror_dma,
                    inbound,
                    outbound,
                    policy: PollPolicy::default().with_timeout(Duration::from_nanos(desc.timeout_ns)),
                    released: false,
                })
            }
            Err(e) => {
                if let Err(detach) = env.segments.detach(segment, attachment) {
                    warn!("detach after failed init of segment {}: {}", segment, detach);
                }
                Err(e)
            }
        }
    }

    fn map_channels(
        env: &AccelEnv,
        desc: &PeerDescriptor,
        layout: ChannelLayout,
        attachment: Attachment,
    ) -> Result<(Arc<HeapSegment>, DmaAddr, RemoteChannel, RemoteChannel)> {
        if (attachment.len as u64) < desc.segment_len {
            return Err(Error::InvalidSegment(format!(
                "attached {} bytes of a {}-byte segment",
                attachment.len, desc.segment_len
            )));
        }
        let translate = |host: u64| {
            desc.segment_offset(host, layout.region_len())
                .map(|offset| attachment.base.offset(offset))
                .ok_or_else(|| {
                    Error::InvalidSegment(format!("sub-channel {host:#x} outside the segment"))
                })
        };
        let inbound_dma = translate(desc.send_channel)?;
        let outbound_dma = translate(desc.recv_channel)?;

        // The remote role reads housekeeping through single-word loads only.
        for shared in [inbound_dma, outbound_dma] {
            let stamp = env.words.load_word(shared.offset(layout.stamp_offset()))?;
            let capacity = env.words.load_word(shared.offset(layout.capacity_offset()))?;
            env.words.fence_after();
            layout.verify(stamp, capacity)?;
        }

        let mirror = Arc::new(HeapSegment::new(mirror_len(&layout))?);
        let (mirror_dma, inbound, outbound) =
            Self::register_mirror(env, layout, inbound_dma, outbound_dma, mirror.clone())?;
        Ok((mirror, mirror_dma, inbound, outbound))
    }

    /// Register `mirror` with the engine and stage both sub-channels in it.
    /// The registration is undone if the mirror cannot hold them.
    fn register_mirror(
        env: &AccelEnv,
        layout: ChannelLayout,
        inbound_dma: DmaAddr,
        outbound_dma: DmaAddr,
        mirror: Arc<HeapSegment>,
    ) -> Result<(DmaAddr, RemoteChannel, RemoteChannel)> {
        // SAFETY: the mirror is kept alive by the peer until it unregisters it.
        let mirror_dma = unsafe { env.dma.register_region(mirror.as_mut_ptr(), mirror.len())? };
        let region = layout.region_len();
        let channels = RemoteChannel::new(layout, inbound_dma, mirror.clone(), 0, mirror_dma)
            .and_then(|inbound| {
                let outbound = RemoteChannel::new(
                    layout,
                    outbound_dma,
                    mirror,
                    region,
                    mirror_dma.offset(region),
                )?;
                Ok((inbound, outbound))
            });
        match channels {
            Ok((inbound, outbound)) => Ok((mirror_dma, inbound, outbound)),
            Err(e) => {
                if let Err(unregister) = env.dma.unregister(mirror_dma) {
                    warn!("unregistering mirror {} after failed init: {}", mirror_dma, unregister);
                }
                Err(e)
            }
        }
    }

    /// Local peer index this mirror belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hardware access for the transfer loops.
    pub fn io(&self) -> RemoteIo<'_> {
        RemoteIo {
            dma: &*self.env.dma,
            words: &*self.env.words,
            clock: &*self.env.clock,
            policy: self.policy,
        }
    }

    /// Receive `len` bytes from the host into `dst`.
    pub fn recv(&self, dst: RemoteAddr, len: usize, plan: SplitPlan) -> std::result::Result<usize, Aborted> {
        let mut sink = MemorySink::new(&*self.env.memory, dst);
        remote::recv(&self.io(), &self.inbound, plan, len, &mut sink)
    }

    /// Receive a committed pack buffer of `len` bytes and unpack it.
    pub fn recv_packed(&self, len: usize, plan: SplitPlan) -> std::result::Result<usize, Aborted> {
        let mut sink = Unpacker::new(&*self.env.memory, len);
        let moved = remote::recv(&self.io(), &self.inbound, plan, len, &mut sink)?;
        debug!("remote peer {} unpacked {} records", self.id, sink.records());
        Ok(moved)
    }

    /// Send `len` bytes at `src` to the host.
    pub fn send(&self, src: RemoteAddr, len: usize, plan: SplitPlan) -> std::result::Result<usize, Aborted> {
        let mut source = MemorySource::new(&*self.env.memory, src);
        remote::send(&self.io(), &self.outbound, plan, len, &mut source)
    }

    /// Gather `entries` and send them to the host as one staged stream of
    /// `total` bytes.
    pub fn send_gathered(
        &self,
        entries: &[RecvEntry],
        total: usize,
        plan: SplitPlan,
    ) -> std::result::Result<usize, Aborted> {
        let mut source = GatherSource::new(&*self.env.memory, entries);
        if source.len() != total {
            return Err(Aborted::new(
                Error::PackCorrupt(format!(
                    "gather of {} bytes announced as {total}",
                    source.len()
                )),
                0,
            ));
        }
        remote::send(&self.io(), &self.outbound, plan, total, &mut source)
    }

    /// Unregister the mirror and detach the segment.
    pub fn fini(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let unregistered = self.env.dma.unregister(self.mirror_dma);
        let detached = self.env.segments.detach(self.segment, self.attachment);
        debug!("remote peer {} released segment {}", self.id, self.segment);
        unregistered.and(detached)
    }
}

impl Drop for RemotePeer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("remote peer {} teardown: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("id", &self.id)
            .field("segment", &self.segment)
            .field("mirror", &self.mirror.len())
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::loopback::LoopbackNode;

    fn env(node: &LoopbackNode) -> AccelEnv {
        AccelEnv {
            dma: node.dma.clone(),
            words: node.words.clone(),
            segments: node.segments.clone(),
            memory: node.memory.clone(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    #[test]
    fn test_undersized_mirror_is_unregistered() {
        let node = LoopbackNode::new();
        let env = env(&node);
        let layout = ChannelLayout::new(64 * 1024, 4).unwrap();
        let before = node.map.regions();

        let short = Arc::new(HeapSegment::new(layout.region_len()).unwrap());
        let err =
            RemotePeer::register_mirror(&env, layout, DmaAddr(0x1000), DmaAddr(0x2000), short)
                .unwrap_err();
        assert!(matches!(err, Error::InvalidSegment(_)));
        assert_eq!(node.map.regions(), before);

        let full = Arc::new(HeapSegment::new(mirror_len(&layout)).unwrap());
        let (mirror_dma, _, _) =
            RemotePeer::register_mirror(&env, layout, DmaAddr(0x1000), DmaAddr(0x2000), full)
                .unwrap();
        assert_eq!(node.map.regions(), before + 1);
        env.dma.unregister(mirror_dma).unwrap();
    }
}
