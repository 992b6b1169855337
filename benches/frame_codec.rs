use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pairing::crypto::identity::{generate_device_key, NodeAuthority};
use pairing::frame::{self, Frame};
use pairing::messages::{PairDeviceResponse, PairingOutcome, ProtocolVersion};

fn approved_frame() -> Vec<u8> {
    let authority = NodeAuthority::generate(b"node-bench".to_vec());
    let issued = authority.issue_credentials(
        generate_device_key().verifying_key().to_bytes(),
        "laptop",
        "readonly",
    );
    frame::encode(&Frame::PairDeviceResponse(PairDeviceResponse {
        session_id: "3f2a5c9e-6d1b-4f0a-9a43-2b7c1e8d5f60".into(),
        outcome: PairingOutcome::Approved(issued),
    }))
    .unwrap_or_default()
}

fn bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    let response = approved_frame();
    group.throughput(Throughput::Bytes(response.len() as u64));
    group.bench_function("decode_response", |b| {
        b.iter(|| frame::decode(black_box(&response), ProtocolVersion::V2))
    });

    for len in [16usize, 256, 4096] {
        let info = frame::encode(&Frame::Info("x".repeat(len))).unwrap_or_default();
        group.throughput(Throughput::Bytes(info.len() as u64));
        group.bench_function(BenchmarkId::new("decode_info", len), |b| {
            b.iter(|| frame::decode(black_box(&info), ProtocolVersion::V1))
        });
    }

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default();
    targets = bench
);

criterion_main!(benches);
