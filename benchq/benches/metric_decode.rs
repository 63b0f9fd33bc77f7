//! Benchmarks for metric frame decoding.


use benchq::{RunId, decode_frames};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;

fn payload(fields: usize) -> Vec<u8> {
    let mut map = serde_json::Map::new();
    for i in 0..fields {
        map.insert(
            format!("metric_{i}"),
            json!({"avg": 12.5, "p50": 11.0, "p99": 40.2, "unit": "ms"}),
        );
    }
    serde_json::to_vec(&serde_json::Value::Object(map)).expect("serializable")
}

fn bench_decode(c: &mut Criterion) {
    let run_id = RunId::new();
    let topic = b"realtime_metrics$".as_slice();
    let mut group = c.benchmark_group("decode_frames");

    for fields in [1usize, 16, 128] {
        let payload = payload(fields);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fields), &payload, |b, payload| {
            b.iter(|| {
                let frames = [topic, payload.as_slice()];
                decode_frames(run_id, &frames).expect("valid frames")
            });
        });
    }

    group.bench_function("malformed_json", |b| {
        let frames = [topic, b"{not json".as_slice()];
        b.iter(|| decode_frames(run_id, &frames).is_err());
    });

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
