//! Failure paths: timeouts, faulted peers, contention and setup errors.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use udma::config::UDMA_MAX_PEERS;
use udma::loopback::LoopbackNode;
use udma::prelude::*;

const MIB: usize = 1024 * 1024;

fn config() -> UdmaConfig {
    UdmaConfig::default().with_buff_len(2 * MIB)
}

fn open_peer(node: &LoopbackNode, registry: &Registry) -> (ProcessId, ContextHandle, PeerId) {
    let (process, code, ctx) = node.open().unwrap();
    let pid = registry.register_process(0, process, code).unwrap();
    let peer = registry.create_peer(pid, ctx).unwrap();
    (pid, ctx, peer)
}

#[test]
fn test_stalled_engine_times_out_and_faults_the_peer() {
    let node = LoopbackNode::new();
    let registry = node
        .registry(config().with_timeout(Duration::from_millis(50)))
        .unwrap();
    let (process, code, ctx) = node.open().unwrap();
    let pid = registry.register_process(0, process, code).unwrap();
    let peer = registry.create_peer(pid, ctx).unwrap();
    let remote = node.memory.alloc(64 * 1024).unwrap();

    node.dma.stall(true);
    let started = Instant::now();
    let err = registry.send(peer, &[3u8; 64 * 1024], remote).unwrap_err();
    assert!(matches!(err, Error::Timeout { transferred: 0, .. }), "{err}");
    assert_eq!(err.transferred(), Some(0));
    assert!(started.elapsed() >= Duration::from_millis(50));
    node.dma.stall(false);

    // Every later operation refuses to run.
    assert!(matches!(
        registry.send(peer, &[1], remote),
        Err(Error::PeerFaulted(_))
    ));
    assert!(matches!(
        registry.recv(peer, &mut [0u8; 4], remote),
        Err(Error::PeerFaulted(_))
    ));
    assert!(matches!(
        registry.pack_append(peer, &[1], remote),
        Err(Error::PeerFaulted(_))
    ));
    assert!(matches!(registry.recv_batch(peer), Err(Error::PeerFaulted(_))));

    // Tearing down and re-creating the peer on the same context recovers.
    registry.destroy_peer(peer).unwrap();
    assert_eq!(registry.process_count(), 0);
    let pid = registry.register_process(0, process, code).unwrap();
    let fresh = registry.create_peer(pid, ctx).unwrap();
    registry.send(fresh, &[9u8; 128], remote).unwrap();
    let mut back = [0u8; 128];
    registry.recv(fresh, &mut back, remote).unwrap();
    assert_eq!(back, [9u8; 128]);
}

#[test]
fn test_remote_length_desync_reports_invalid_length() {
    let node = LoopbackNode::new();
    let registry = node.registry(config()).unwrap();
    let (_, _, peer) = open_peer(&node, &registry);
    let remote = node.memory.alloc(64).unwrap();

    // A stale word left in the first mailbox announces more than the
    // accelerator's receive loop still expects.
    {
        let guard = registry.lock(peer).unwrap();
        guard.send_channel().mailbox(0).store(4096, Ordering::Release);
    }

    let err = registry.send(peer, &[7u8; 64], remote).unwrap_err();
    assert!(
        matches!(
            err,
            Error::InvalidLength {
                remaining: 64,
                transferred: 0,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(err.transferred(), Some(0));
    assert!(matches!(
        registry.send(peer, &[7u8; 64], remote),
        Err(Error::PeerFaulted(_))
    ));
}

#[test]
fn test_locked_peer_reports_busy() {
    let node = LoopbackNode::new();
    let registry = node.registry(config()).unwrap();
    let (_, _, peer) = open_peer(&node, &registry);
    let remote = node.memory.alloc(16).unwrap();

    let guard = registry.lock(peer).unwrap();
    assert!(guard.is_locked());
    assert!(matches!(
        registry.send(peer, &[1; 16], remote),
        Err(Error::PeerBusy(p)) if p == peer
    ));
    assert!(matches!(registry.pack_commit(peer), Err(Error::PeerBusy(_))));
    assert!(matches!(registry.destroy_peer(peer), Err(Error::PeerBusy(_))));
    drop(guard);

    registry.send(peer, &[1; 16], remote).unwrap();
    registry.destroy_peer(peer).unwrap();
}

#[test]
fn test_missing_gather_entry_surfaces_at_commit() {
    let node = LoopbackNode::new();
    node.runtime.hide_entry("udma_send_packed");
    let registry = node.registry(config()).unwrap();
    let (_, _, peer) = open_peer(&node, &registry);
    let remote = node.memory.alloc(16).unwrap();

    let mut dst = [0u8; 16];
    {
        let mut batch = registry.recv_batch(peer).unwrap();
        batch.request(remote, &mut dst).unwrap();
        assert!(matches!(
            batch.commit(),
            Err(Error::Resolution {
                entry: "udma_send_packed"
            })
        ));
    }
    // Not a transfer failure: the peer stays usable.
    registry.recv(peer, &mut dst, remote).unwrap();
}

#[test]
fn test_missing_required_entry_fails_registration() {
    let node = LoopbackNode::new();
    node.runtime.hide_entry("udma_init");
    let registry = node.registry(config()).unwrap();
    let (process, code, _) = node.open().unwrap();
    assert!(matches!(
        registry.register_process(0, process, code),
        Err(Error::Resolution { entry: "udma_init" })
    ));
    assert_eq!(registry.process_count(), 0);
}

#[test]
fn test_context_drives_one_peer() {
    let node = LoopbackNode::new();
    let registry = node.registry(config()).unwrap();
    let (pid, ctx, peer) = open_peer(&node, &registry);

    assert!(matches!(
        registry.create_peer(pid, ctx),
        Err(Error::ContextInUse(c)) if c == ctx
    ));
    assert_eq!(registry.peer_for_context(ctx), Some(peer));
    assert_eq!(registry.peer_count(), 1);
}

#[test]
fn test_remote_init_failure_rolls_back() {
    let node = LoopbackNode::new();
    let first = node.registry(config()).unwrap();
    let second = node.registry(config()).unwrap();
    let (process, code, ctx) = node.open().unwrap();

    let pid = first.register_process(0, process, code).unwrap();
    first.create_peer(pid, ctx).unwrap();
    assert_eq!(node.segments.live_segments(), 1);

    // The remote context already serves a peer of another registry.
    let pid = second.register_process(0, process, code).unwrap();
    assert!(matches!(
        second.create_peer(pid, ctx),
        Err(Error::RemoteInitFailed(_))
    ));
    assert_eq!(second.peer_count(), 0);
    assert_eq!(second.process_count(), 0);
    assert_eq!(node.segments.live_segments(), 1);
}

#[test]
fn test_peer_table_exhaustion() {
    let node = LoopbackNode::new();
    let registry = node.registry(config()).unwrap();
    let (process, code, ctx) = node.open().unwrap();
    let pid = registry.register_process(0, process, code).unwrap();
    registry.create_peer(pid, ctx).unwrap();
    for _ in 1..UDMA_MAX_PEERS {
        let ctx = node.runtime.open_context(process).unwrap();
        registry.create_peer(pid, ctx).unwrap();
    }
    assert_eq!(registry.peer_count(), UDMA_MAX_PEERS);

    let ctx = node.runtime.open_context(process).unwrap();
    assert!(matches!(
        registry.create_peer(pid, ctx),
        Err(Error::Exhausted("peer"))
    ));
}

#[test]
fn test_unknown_peer() {
    let node = LoopbackNode::new();
    let registry = node.registry(config()).unwrap();
    let remote = node.memory.alloc(8).unwrap();
    assert!(matches!(
        registry.send(PeerId(5), &[1], remote),
        Err(Error::UnknownPeer(PeerId(5)))
    ));
    assert!(matches!(
        registry.destroy_peer(PeerId(UDMA_MAX_PEERS + 1)),
        Err(Error::UnknownPeer(_))
    ));
}
