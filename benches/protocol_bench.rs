use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio_util::codec::{Decoder, Encoder};

use coord_node::config::{PeerAddress, PeerMap};
use coord_node::events::MemorySink;
use coord_node::node::NodeState;
use coord_node::peers::PeerTable;
use coord_node::transport::MessageCodec;
use coord_node::{Message, MessageKind, Node, NodeConfig};

fn members(n: u64) -> PeerMap {
    (1..=n).map(|id| (id, PeerAddress::new("127.0.0.1", 7000 + id as u16))).collect()
}

fn codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let message = Message::new(3, MessageKind::Request, 1_234).with_request_clock(1_234);

    group.bench_function("encode", |b| {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::with_capacity(128);
        b.iter(|| {
            buf.clear();
            codec.encode(black_box(message.clone()), &mut buf).unwrap();
        })
    });

    group.bench_function("decode", |b| {
        let mut codec = MessageCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(message.clone(), &mut encoded).unwrap();
        b.iter(|| {
            let mut buf = encoded.clone();
            black_box(codec.decode(&mut buf).unwrap());
        })
    });

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let config = NodeConfig::default();
    let peers = PeerTable::new(2, &members(5)).unwrap();
    let mut state = NodeState::new(2, &config);
    let mut clock = 0;

    c.bench_function("dispatch_request", |b| {
        b.iter(|| {
            clock += 2;
            let request = Message::new(1, MessageKind::Request, clock).with_request_clock(clock);
            black_box(state.handle_message(&request, &peers, Instant::now()));
        })
    });
}

fn critical_section_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let node = rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut members = PeerMap::new();
        members.insert(1, PeerAddress::new("127.0.0.1", listener.local_addr().unwrap().port()));
        Node::start_with_listener(1, &members, NodeConfig::default(), Arc::new(MemorySink::new()), listener)
            .unwrap()
    });

    c.bench_function("lone_node_enter_exit", |b| {
        b.to_async(&rt).iter(|| async {
            node.request_critical_section().await.unwrap();
            black_box(node.exit_critical_section().unwrap());
        })
    });

    rt.block_on(node.shutdown());
}

criterion_group!(benches, codec_benchmark, dispatch_benchmark, critical_section_benchmark);
criterion_main!(benches);
