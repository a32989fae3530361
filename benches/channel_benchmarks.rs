//! Producer-side throughput of the batching channel, envelope building and
//! payload compression.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::collections::BTreeMap;
use std::future::Future;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use telemetry_channel::buffer::{Batch, BatchingChannel, ChannelConfig};
use telemetry_channel::domain::{
    TelemetryContext, TelemetryRecord, TelemetryType, build_envelope,
};
use telemetry_channel::sender::{
    IngestionResponse, SendOutcome, SenderError, Transport, serialization::gzip,
};

struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _batch: Batch) -> impl Future<Output = Result<SendOutcome, SenderError>> + Send {
        async {
            Ok(SendOutcome {
                status: 200,
                body: String::new(),
                response: IngestionResponse::Accepted,
                persisted_items: 0,
            })
        }
    }

    fn save_on_crash(&self, _batch: &Batch) {}

    fn set_disk_retry_mode(&self, _enabled: bool) {}
}

fn sample_record(id: usize) -> TelemetryRecord {
    let mut record = TelemetryRecord::default();
    record
        .properties
        .insert("request_id".to_string(), format!("req-{id}"));
    record
        .data
        .insert("name".to_string(), serde_json::json!("checkout"));
    record
}

fn bench_channel_send(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let _guard = runtime.enter();

    let context = TelemetryContext::with_defaults();
    let envelope = build_envelope(
        &sample_record(1),
        TelemetryType::Event,
        &BTreeMap::new(),
        &context,
        "bench-ikey",
    );

    let mut group = c.benchmark_group("channel_send");
    for batch_size in [10, 250, 1000] {
        let channel = BatchingChannel::new(
            ChannelConfig {
                batch_size,
                batch_interval: Duration::from_secs(60),
            },
            Arc::new(NullTransport),
        )
        .unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, _| b.iter(|| channel.send(black_box(&envelope))),
        );
    }
    group.finish();
}

fn bench_build_envelope(c: &mut Criterion) {
    let context = TelemetryContext::with_defaults();
    let common = BTreeMap::from([("service".to_string(), "bench".to_string())]);
    let record = sample_record(42);

    c.bench_function("build_envelope", |b| {
        b.iter(|| {
            build_envelope(
                black_box(&record),
                TelemetryType::Request,
                &common,
                &context,
                "0000-1111-2222",
            )
        });
    });
}

fn bench_gzip_payload(c: &mut Criterion) {
    let context = TelemetryContext::with_defaults();
    let mut group = c.benchmark_group("gzip_payload");

    for items in [10, 250, 1000] {
        let batch = Batch::new(
            (0..items)
                .map(|i| {
                    let envelope = build_envelope(
                        &sample_record(i),
                        TelemetryType::Event,
                        &BTreeMap::new(),
                        &context,
                        "bench-ikey",
                    );
                    serde_json::to_string(&envelope).unwrap()
                })
                .collect(),
        );
        let payload = batch.payload();

        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(items), &payload, |b, payload| {
            b.iter(|| gzip(black_box(payload.as_bytes())));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_channel_send,
    bench_build_envelope,
    bench_gzip_payload
);
criterion_main!(benches);
