//! Performance benchmarks for the output relay path.
//!
//! These benchmarks measure the hot paths between a PTY read and a
//! WebSocket frame:
//! - UTF-8 decoding of raw output chunks
//! - Envelope encoding and decoding
//! - Outbound queue throughput

use bridge::session::Utf8Decoder;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::{ClientEvent, Envelope, ServerEvent};

/// A chunk of typical colored `ls` output.
fn output_chunk(len: usize) -> Vec<u8> {
    "\x1b[01;34msrc\x1b[0m  Cargo.toml  README.md  ünïcödé →\r\n"
        .as_bytes()
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Benchmark UTF-8 decoding of PTY output.
fn bench_utf8_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8_decoding");

    for (name, len) in [("read_4KB", 4096), ("read_64KB", 65536)] {
        let chunk = output_chunk(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(name, |b| {
            let mut decoder = Utf8Decoder::new();
            b.iter(|| decoder.decode(black_box(&chunk)));
        });
    }

    // Worst case: every read ends mid-character
    let chunk = output_chunk(4096);
    group.throughput(Throughput::Bytes(4096));
    group.bench_function("split_reads_4KB", |b| {
        let mut decoder = Utf8Decoder::new();
        b.iter(|| {
            let mut out = String::new();
            for piece in chunk.chunks(7) {
                out.push_str(&decoder.decode(black_box(piece)));
            }
            out
        });
    });

    group.finish();
}

/// Benchmark envelope encoding and decoding.
fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");

    // Keystroke
    group.bench_function("encode_write_1B", |b| {
        b.iter(|| {
            ClientEvent::Write(black_box("l").to_string())
                .into_envelope()
                .to_json()
        });
    });

    let keystroke = ClientEvent::Write("l".into()).into_envelope().to_json().unwrap();
    group.bench_function("decode_write_1B", |b| {
        b.iter(|| {
            let envelope = Envelope::from_json(black_box(&keystroke)).unwrap();
            ClientEvent::from_envelope(&envelope)
        });
    });

    // Output chunk
    let text = String::from_utf8(output_chunk(4096)).unwrap_or_default();
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("encode_update_4KB", |b| {
        b.iter(|| {
            ServerEvent::Update(black_box(&text).clone())
                .into_envelope()
                .to_json()
        });
    });

    group.finish();
}

/// Benchmark the bounded outbound queue.
fn bench_outbound_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbound_queue");
    let runtime = tokio::runtime::Runtime::new().unwrap();

    group.throughput(Throughput::Elements(1000));
    group.bench_function("send_recv_1000", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let (tx, mut rx) = tokio::sync::mpsc::channel::<Envelope>(256);
                let producer = tokio::spawn(async move {
                    for i in 0..1000 {
                        let event = ServerEvent::Update(format!("chunk-{}", i));
                        if tx.send(event.into_envelope()).await.is_err() {
                            break;
                        }
                    }
                });
                let mut received = 0;
                while rx.recv().await.is_some() {
                    received += 1;
                }
                let _ = producer.await;
                received
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_utf8_decoding,
    bench_envelope_codec,
    bench_outbound_queue,
);

criterion_main!(benches);
