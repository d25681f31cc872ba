//! End-to-end transfers over the loopback accelerator.

use udma::loopback::LoopbackNode;
use udma::prelude::*;

const MIB: usize = 1024 * 1024;

/// Deterministic, non-repeating-per-chunk payload.
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add((i >> 12) as u8) ^ seed)
        .collect()
}

struct Fixture {
    node: LoopbackNode,
    registry: Registry,
    peer: PeerId,
}

fn fixture(config: UdmaConfig) -> Fixture {
    let node = LoopbackNode::new();
    let registry = node.registry(config).unwrap();
    let (process, code, ctx) = node.open().unwrap();
    let pid = registry.register_process(0, process, code).unwrap();
    let peer = registry.create_peer(pid, ctx).unwrap();
    Fixture {
        node,
        registry,
        peer,
    }
}

fn round_trip(f: &Fixture, len: usize, seed: u8) {
    let remote = f.node.memory.alloc(len).unwrap();
    let src = pattern(len, seed);
    assert_eq!(f.registry.send(f.peer, &src, remote).unwrap(), len);

    let mut back = vec![0u8; len];
    assert_eq!(f.registry.recv(f.peer, &mut back, remote).unwrap(), len);
    assert!(back == src, "payload of {len} bytes corrupted");
    f.node.memory.free(remote).unwrap();
}

#[test]
fn test_default_tables_across_sizes() {
    let f = fixture(UdmaConfig::default().with_buff_len(16 * MIB));
    for (i, len) in [1, 7, 4096, 512 * 1024 + 3, 3 * MIB + 17, 9 * MIB].into_iter().enumerate() {
        round_trip(&f, len, i as u8);
    }
}

#[test]
fn test_hundred_mebibytes_split_four() {
    let plan = SplitPlan {
        split: 4,
        chunk_size: 2 * MIB,
    };
    let config = UdmaConfig::default()
        .with_send_override(plan)
        .with_recv_override(plan);
    let f = fixture(config);
    round_trip(&f, 100 * MIB, 0x5a);
}

#[test]
fn test_forced_plans() {
    let plans = [
        (1, 4096),
        (2, 64 * 1024),
        (3, 8),
        (16, 256 * 1024),
        (64, 32 * 1024),
    ];
    for (split, chunk_size) in plans {
        let plan = SplitPlan { split, chunk_size };
        let config = UdmaConfig::default()
            .with_buff_len(16 * MIB)
            .with_send_override(plan)
            .with_recv_override(plan);
        let f = fixture(config);
        // Not a multiple of the chunk, and wraps the slot ring more than once.
        let len = chunk_size * split * 3 + 5;
        round_trip(&f, len.min(8 * MIB + 5), split as u8);
    }
}

#[test]
fn test_slow_engine_with_shallow_queue() {
    let node = LoopbackNode::with_parts(1, std::sync::Arc::new(udma::clock::SystemClock::new()));
    node.dma.set_latency(3);
    let registry = node.registry(UdmaConfig::default().with_buff_len(4 * MIB)).unwrap();
    let (process, code, ctx) = node.open().unwrap();
    let pid = registry.register_process(0, process, code).unwrap();
    let peer = registry.create_peer(pid, ctx).unwrap();
    let f = Fixture {
        node,
        registry,
        peer,
    };

    round_trip(&f, 2 * MIB + 100, 3);
    assert!(f.node.dma.busy_count() > 0);
}

#[test]
fn test_empty_transfers_are_no_ops() {
    let f = fixture(UdmaConfig::default().with_buff_len(4 * MIB));
    let remote = f.node.memory.alloc(64).unwrap();
    assert_eq!(f.registry.send(f.peer, &[], remote).unwrap(), 0);
    assert_eq!(f.registry.recv(f.peer, &mut [], remote).unwrap(), 0);
    assert_eq!(f.node.runtime.calls("udma_recv"), 0);
    assert_eq!(f.node.runtime.calls("udma_send"), 0);
}

#[test]
fn test_peers_transfer_concurrently() {
    let node = LoopbackNode::new();
    let registry = node
        .registry(UdmaConfig::default().with_buff_len(4 * MIB))
        .unwrap();
    let (process, code, first) = node.open().unwrap();
    let second = node.runtime.open_context(process).unwrap();
    let pid = registry.register_process(0, process, code).unwrap();
    let peers = [
        registry.create_peer(pid, first).unwrap(),
        registry.create_peer(pid, second).unwrap(),
    ];
    assert_eq!(registry.peer_count(), 2);
    assert_eq!(registry.process_count(), 1);

    std::thread::scope(|s| {
        for (i, peer) in peers.into_iter().enumerate() {
            let registry = &registry;
            let node = &node;
            s.spawn(move || {
                let len = 3 * MIB + i;
                let remote = node.memory.alloc(len).unwrap();
                let src = pattern(len, i as u8);
                for _ in 0..4 {
                    registry.send(peer, &src, remote).unwrap();
                    let mut back = vec![0u8; len];
                    registry.recv(peer, &mut back, remote).unwrap();
                    assert!(back == src);
                }
            });
        }
    });
}

#[test]
fn test_destroy_and_recreate_on_same_context() {
    let node = LoopbackNode::new();
    let registry = node
        .registry(UdmaConfig::default().with_buff_len(4 * MIB))
        .unwrap();
    let (process, code, ctx) = node.open().unwrap();

    for round in 0..3u8 {
        let pid = registry.register_process(0, process, code).unwrap();
        let peer = registry.create_peer(pid, ctx).unwrap();
        let remote = node.memory.alloc(4096).unwrap();
        let src = pattern(4096, round);
        registry.send(peer, &src, remote).unwrap();
        let mut back = vec![0u8; 4096];
        registry.recv(peer, &mut back, remote).unwrap();
        assert_eq!(back, src);
        registry.destroy_peer(peer).unwrap();
    }
    assert_eq!(registry.peer_count(), 0);
    assert_eq!(node.segments.live_segments(), 0);
    assert_eq!(node.runtime.calls("udma_init"), 3);
    assert_eq!(node.runtime.calls("udma_fini"), 3);
}
