//! Remote-role transfer loops.
//!
//! The remote role cannot touch the shared region with ordinary loads and
//! stores. Payload moves between the shared data area and a same-sized
//! mirror buffer through the block-transfer engine; mailboxes are read and
//! written with single-word instructions bracketed by fences. Each loop
//! interleaves a producer (stage, submit) and a consumer (poll the oldest
//! descriptor, signal its mailbox) over a [`SlotTable`], and gives up with
//! [`Error::Timeout`] once it goes a full liveness bound without progress.

use std::sync::Arc;

use super::{Aborted, ChunkSink, ChunkSource, SlotState, SlotTable};
use crate::channel::ChannelLayout;
use crate::clock::Clock;
use crate::error::Error;
use crate::memory::{HeapSegment, MemorySegment};
use crate::poll::{IdleTimer, PollPolicy};
use crate::runtime::{DmaAddr, DmaEngine, DmaPoll, Submit, WordAccess};
use crate::split::SplitPlan;

/// Hardware access of the remote role.
#[derive(Clone, Copy)]
pub struct RemoteIo<'a> {
    /// Block-transfer engine.
    pub dma: &'a dyn DmaEngine,
    /// Single-word instructions.
    pub words: &'a dyn WordAccess,
    /// Time source of the idle timer.
    pub clock: &'a dyn Clock,
    /// Liveness bound and backoff.
    pub policy: PollPolicy,
}

impl RemoteIo<'_> {
    fn read_mailbox(&self, addr: DmaAddr) -> crate::Result<u64> {
        let value = self.words.load_word(addr)?;
        self.words.fence_after();
        Ok(value)
    }

    fn signal(&self, addr: DmaAddr, value: u64) -> crate::Result<()> {
        self.words.fence_before();
        self.words.store_word(addr, value)?;
        self.words.fence_after();
        Ok(())
    }
}

/// Remote-role view of one sub-channel.
pub struct RemoteChannel {
    layout: ChannelLayout,
    shared: DmaAddr,
    mirror: Arc<HeapSegment>,
    mirror_offset: usize,
    mirror_dma: DmaAddr,
}

impl RemoteChannel {
    /// Sub-channel at DMA address `shared`, staged through
    /// `mirror[mirror_offset..]`, which is registered at `mirror_dma`.
    pub fn new(
        layout: ChannelLayout,
        shared: DmaAddr,
        mirror: Arc<HeapSegment>,
        mirror_offset: usize,
        mirror_dma: DmaAddr,
    ) -> crate::Result<Self> {
        if mirror_offset + layout.data_len() > mirror.len() {
            return Err(Error::InvalidSegment(format!(
                "mirror of {} bytes cannot stage {} bytes at {}",
                mirror.len(),
                layout.data_len(),
                mirror_offset
            )));
        }
        Ok(Self {
            layout,
            shared,
            mirror,
            mirror_offset,
            mirror_dma,
        })
    }

    /// Layout of the sub-channel.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// DMA address of mailbox `j`.
    pub fn mailbox(&self, j: usize) -> DmaAddr {
        self.shared.offset(self.layout.mailbox_offset(j))
    }

    /// DMA addresses of the housekeeping words.
    pub fn housekeeping(&self) -> (DmaAddr, DmaAddr) {
        (
            self.shared.offset(self.layout.stamp_offset()),
            self.shared.offset(self.layout.capacity_offset()),
        )
    }

    fn shared_slot(&self, j: usize, chunk_size: usize) -> DmaAddr {
        self.shared.offset(j * chunk_size)
    }

    fn mirror_slot(&self, j: usize, chunk_size: usize) -> DmaAddr {
        self.mirror_dma.offset(j * chunk_size)
    }

    /// Stage bytes `offset..offset + len` of `source` in mirror slot `j`.
    fn stage(
        &self,
        j: usize,
        chunk_size: usize,
        len: usize,
        source: &mut dyn ChunkSource,
        offset: usize,
    ) -> crate::Result<()> {
        // SAFETY: slot j is Empty, so no descriptor references this range.
        let slot = unsafe { self.mirror.range_mut(self.mirror_offset + j * chunk_size, len)? };
        source.fill(offset, slot)
    }

    /// Hand the first `len` bytes of mirror slot `j` to `sink`.
    fn unstage(
        &self,
        j: usize,
        chunk_size: usize,
        len: usize,
        sink: &mut dyn ChunkSink,
        offset: usize,
    ) -> crate::Result<()> {
        // SAFETY: slot j is Complete, its descriptor retired.
        let slot = unsafe { self.mirror.range(self.mirror_offset + j * chunk_size, len)? };
        sink.drain(offset, slot)
    }
}

impl std::fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("shared", &self.shared)
            .field("mirror_dma", &self.mirror_dma)
            .field("layout", &self.layout)
            .finish()
    }
}

/// Send `len` bytes from `source`; the local side runs its receive loop.
pub fn send(
    io: &RemoteIo<'_>,
    channel: &RemoteChannel,
    plan: SplitPlan,
    len: usize,
    source: &mut dyn ChunkSource,
) -> Result<usize, Aborted> {
    plan.validate(channel.layout())
        .map_err(|e| Aborted::new(e, 0))?;
    let chunk = plan.chunk_size;
    let mut slots = SlotTable::new(plan.split);
    let mut submitted = 0;
    let mut done = 0;
    let mut timer = IdleTimer::start(io.clock, io.policy.timeout);
    let mut backoff = io.policy.backoff();

    while done < len {
        let mut progressed = false;
        let fail = move |e: Error| Aborted::new(e, done);

        // Producer: wait for the consumer to free the slot, stage, submit.
        let j = slots.producer();
        match slots.state(j) {
            SlotState::Empty if submitted < len => {
                if io.read_mailbox(channel.mailbox(j)).map_err(fail)? == 0 {
                    let tlen = chunk.min(len - submitted);
                    channel
                        .stage(j, chunk, tlen, source, submitted)
                        .map_err(fail)?;
                    slots.fill(tlen);
                    progressed = true;
                }
            }
            SlotState::Filling(tlen) => {
                let accepted = io
                    .dma
                    .submit(channel.shared_slot(j, chunk), channel.mirror_slot(j, chunk), tlen)
                    .map_err(fail)?;
                if let Submit::Accepted(handle) = accepted {
                    submitted += slots.launch(handle);
                    progressed = true;
                }
            }
            _ => {}
        }

        // Consumer: retire the oldest descriptor and publish its length.
        let jr = slots.consumer();
        if let SlotState::InFlight(handle, _) = slots.state(jr) {
            if io.dma.poll(handle).map_err(fail)? == DmaPoll::Done {
                let tlen = slots.complete();
                io.signal(channel.mailbox(jr), tlen as u64).map_err(fail)?;
                done += slots.release();
                progressed = true;
            }
        }

        if progressed {
            timer.reset();
            backoff.reset();
        } else if let Some(waited) = timer.expired() {
            tracing::error!(
                "remote send stalled for {:?} after {} of {} bytes",
                waited,
                done,
                len
            );
            return Err(Aborted::new(
                Error::Timeout {
                    waited,
                    transferred: done,
                },
                done,
            ));
        } else {
            backoff.snooze();
        }
    }

    Ok(done)
}

/// Receive `len` bytes into `sink`; the local side runs its send loop.
///
/// A mailbox announcing more than the remaining length, or more than a
/// chunk, aborts with [`Error::InvalidLength`] before anything is copied.
pub fn recv(
    io: &RemoteIo<'_>,
    channel: &RemoteChannel,
    plan: SplitPlan,
    len: usize,
    sink: &mut dyn ChunkSink,
) -> Result<usize, Aborted> {
    plan.validate(channel.layout())
        .map_err(|e| Aborted::new(e, 0))?;
    let chunk = plan.chunk_size;
    let mut slots = SlotTable::new(plan.split);
    let mut submitted = 0;
    let mut done = 0;
    let mut timer = IdleTimer::start(io.clock, io.policy.timeout);
    let mut backoff = io.policy.backoff();

    while done < len {
        let mut progressed = false;
        let fail = move |e: Error| Aborted::new(e, done);

        // Producer: wait for data, then pull it into the mirror.
        let j = slots.producer();
        match slots.state(j) {
            SlotState::Empty if submitted < len => {
                let announced = io.read_mailbox(channel.mailbox(j)).map_err(fail)? as usize;
                if announced != 0 {
                    let remaining = len - submitted;
                    if announced > remaining || announced > chunk {
                        tracing::error!(
                            "mailbox {} announced {} bytes with {} remaining",
                            j,
                            announced,
                            remaining
                        );
                        return Err(fail(Error::InvalidLength {
                            announced,
                            remaining,
                            transferred: done,
                        }));
                    }
                    slots.fill(announced);
                    progressed = true;
                }
            }
            SlotState::Filling(tlen) => {
                let accepted = io
                    .dma
                    .submit(channel.mirror_slot(j, chunk), channel.shared_slot(j, chunk), tlen)
                    .map_err(fail)?;
                if let Submit::Accepted(handle) = accepted {
                    submitted += slots.launch(handle);
                    progressed = true;
                }
            }
            _ => {}
        }

        // Consumer: hand the oldest chunk to the sink and free its slot.
        let jr = slots.consumer();
        if let SlotState::InFlight(handle, _) = slots.state(jr) {
            if io.dma.poll(handle).map_err(fail)? == DmaPoll::Done {
                let tlen = slots.complete();
                channel.unstage(jr, chunk, tlen, sink, done).map_err(fail)?;
                io.signal(channel.mailbox(jr), 0).map_err(fail)?;
                done += slots.release();
                progressed = true;
            }
        }

        if progressed {
            timer.reset();
            backoff.reset();
        } else if let Some(waited) = timer.expired() {
            tracing::error!(
                "remote recv stalled for {:?} after {} of {} bytes",
                waited,
                done,
                len
            );
            return Err(Aborted::new(
                Error::Timeout {
                    waited,
                    transferred: done,
                },
                done,
            ));
        } else {
            backoff.snooze();
        }
    }

    sink.finish().map_err(|e| Aborted::new(e, done))?;
    Ok(done)
}

/// Bytes a remote-role mirror needs for both sub-channels of a peer.
pub fn mirror_len(layout: &ChannelLayout) -> usize {
    2 * layout.region_len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{SliceSink, SliceSource};
    use crate::loopback::{AddressMap, LoopbackDma, LoopbackWords};
    use std::time::Duration;

    struct Rig {
        dma: LoopbackDma,
        words: LoopbackWords,
        clock: ManualClock,
        shared: Arc<HeapSegment>,
        channel: RemoteChannel,
    }

    impl Rig {
        fn new(region_len: usize, max_split: usize) -> Self {
            let layout = ChannelLayout::new(region_len, max_split).unwrap();
            let map = Arc::new(AddressMap::new());
            let dma = LoopbackDma::new(map.clone(), 2);
            let words = LoopbackWords::new(map.clone());
            let shared = Arc::new(HeapSegment::new(region_len).unwrap());
            let mirror = Arc::new(HeapSegment::new(region_len).unwrap());
            let shared_dma = map.register(shared.as_mut_ptr(), shared.len());
            let mirror_dma = unsafe { dma.register_region(mirror.as_mut_ptr(), mirror.len()) }.unwrap();
            let channel = RemoteChannel::new(layout, shared_dma, mirror, 0, mirror_dma).unwrap();
            Self {
                dma,
                words,
                clock: ManualClock::ticking(Duration::from_millis(1)),
                shared,
                channel,
            }
        }

        fn io(&self) -> RemoteIo<'_> {
            RemoteIo {
                dma: &self.dma,
                words: &self.words,
                clock: &self.clock,
                policy: PollPolicy::default().with_timeout(Duration::from_millis(50)),
            }
        }

        fn mailbox(&self, j: usize) -> u64 {
            self.words.load_word(self.channel.mailbox(j)).unwrap()
        }

        fn set_mailbox(&self, j: usize, value: u64) {
            self.words.store_word(self.channel.mailbox(j), value).unwrap();
        }
    }

    #[test]
    fn test_send_signals_every_chunk() {
        let rig = Rig::new(64 * 1024, 8);
        let plan = SplitPlan {
            split: 4,
            chunk_size: 1024,
        };
        let data: Vec<u8> = (0..3500u32).map(|i| (i * 7) as u8).collect();

        let sent = send(&rig.io(), &rig.channel, plan, data.len(), &mut SliceSource(&data)).unwrap();
        assert_eq!(sent, 3500);

        let lens: Vec<u64> = (0..4).map(|j| rig.mailbox(j)).collect();
        assert_eq!(lens, [1024, 1024, 1024, 428]);
        let shared = unsafe { rig.shared.as_slice() };
        assert_eq!(&shared[..3500], &data[..]);
    }

    #[test]
    fn test_send_times_out_when_consumer_never_frees_slot() {
        let rig = Rig::new(64 * 1024, 8);
        let plan = SplitPlan {
            split: 1,
            chunk_size: 1024,
        };
        let data = vec![5u8; 2048];

        // First chunk goes out; the local side never clears mailbox 0.
        let aborted = send(&rig.io(), &rig.channel, plan, data.len(), &mut SliceSource(&data)).unwrap_err();
        assert_eq!(aborted.transferred, 1024);
        assert!(matches!(aborted.error, Error::Timeout { transferred: 1024, .. }));
    }

    #[test]
    fn test_recv_drains_announced_chunks() {
        let rig = Rig::new(64 * 1024, 8);
        let plan = SplitPlan {
            split: 2,
            chunk_size: 1024,
        };
        rig.shared.write_at(0, &[1u8; 1024]).unwrap();
        rig.shared.write_at(1024, &[2u8; 200]).unwrap();
        rig.set_mailbox(0, 1024);
        rig.set_mailbox(1, 200);

        let mut out = vec![0u8; 1224];
        let got = recv(&rig.io(), &rig.channel, plan, out.len(), &mut SliceSink(&mut out)).unwrap();
        assert_eq!(got, 1224);
        assert!(out[..1024].iter().all(|&b| b == 1));
        assert!(out[1024..].iter().all(|&b| b == 2));
        assert_eq!(rig.mailbox(0), 0);
        assert_eq!(rig.mailbox(1), 0);
    }

    #[test]
    fn test_recv_rejects_desync() {
        let rig = Rig::new(64 * 1024, 8);
        let plan = SplitPlan {
            split: 2,
            chunk_size: 1024,
        };
        rig.set_mailbox(0, 1000);

        let mut out = vec![0u8; 100];
        let aborted = recv(&rig.io(), &rig.channel, plan, out.len(), &mut SliceSink(&mut out)).unwrap_err();
        assert!(matches!(
            aborted.error,
            Error::InvalidLength {
                announced: 1000,
                remaining: 100,
                transferred: 0
            }
        ));
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_recv_times_out_on_stalled_dma() {
        let rig = Rig::new(64 * 1024, 8);
        let plan = SplitPlan {
            split: 2,
            chunk_size: 1024,
        };
        rig.set_mailbox(0, 1024);
        rig.dma.stall(true);

        let mut out = vec![0u8; 2048];
        let aborted = recv(&rig.io(), &rig.channel, plan, out.len(), &mut SliceSink(&mut out)).unwrap_err();
        assert!(matches!(aborted.error, Error::Timeout { transferred: 0, .. }));
        assert_eq!(rig.mailbox(0), 1024);
    }

    #[test]
    fn test_busy_engine_is_retried() {
        let rig = Rig::new(64 * 1024, 16);
        let plan = SplitPlan {
            split: 8,
            chunk_size: 512,
        };
        let data = vec![9u8; 8 * 512];
        // Queue depth 2 and slow completions force Busy submissions.
        rig.dma.set_latency(4);
        let sent = send(&rig.io(), &rig.channel, plan, data.len(), &mut SliceSource(&data)).unwrap();
        assert_eq!(sent, data.len());
        assert!(rig.dma.busy_count() > 0);
    }
}
