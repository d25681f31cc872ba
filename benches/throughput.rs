//! Split-transfer throughput over the loopback accelerator.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use udma::loopback::LoopbackNode;
use udma::{PeerId, Registry, SplitPlan, UdmaConfig};

const MIB: usize = 1024 * 1024;

struct Bench {
    node: LoopbackNode,
    registry: Registry,
    peer: PeerId,
}

fn setup(config: UdmaConfig) -> Bench {
    let node = LoopbackNode::new();
    let registry = node.registry(config).unwrap();
    let (process, code, ctx) = node.open().unwrap();
    let pid = registry.register_process(0, process, code).unwrap();
    let peer = registry.create_peer(pid, ctx).unwrap();
    Bench {
        node,
        registry,
        peer,
    }
}

fn bench_adaptive(c: &mut Criterion) {
    let bench = setup(UdmaConfig::default());
    let mut group = c.benchmark_group("adaptive");

    for size in [4 * 1024, 256 * 1024, MIB, 16 * MIB, 64 * MIB] {
        let remote = bench.node.memory.alloc(size).unwrap();
        let src = vec![0xA5u8; size];
        let mut dst = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("send", size), &size, |b, _| {
            b.iter(|| bench.registry.send(bench.peer, black_box(&src), remote).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("recv", size), &size, |b, _| {
            b.iter(|| bench.registry.recv(bench.peer, black_box(&mut dst), remote).unwrap());
        });
        bench.node.memory.free(remote).unwrap();
    }

    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    let size = 16 * MIB;
    group.throughput(Throughput::Bytes(size as u64));
    group.sample_size(20);

    for split in [1, 2, 4, 8, 16] {
        let plan = SplitPlan {
            split,
            chunk_size: MIB,
        };
        let bench = setup(
            UdmaConfig::default()
                .with_send_override(plan)
                .with_recv_override(plan),
        );
        let remote = bench.node.memory.alloc(size).unwrap();
        let src = vec![0x5Au8; size];

        group.bench_with_input(BenchmarkId::from_parameter(split), &split, |b, _| {
            b.iter(|| bench.registry.send(bench.peer, black_box(&src), remote).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_adaptive, bench_split);
criterion_main!(benches);
