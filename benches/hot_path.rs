//! Criterion benchmarks for the streamscope hot path:
//! - `segment::parse` (header + option decoding)
//! - `Engine::process_segment` on an established stream (sequence analysis)
//! - `Engine::process_segment` on fresh conversations (table insertion)

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::net::{IpAddr, Ipv4Addr};
use streamscope::segment::SegmentMeta;
use streamscope::{Engine, EngineConfig, SegmentInput};

const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

/// Build a raw TCP segment (20-byte header, no options).
fn make_segment(
    sport: u16,
    dport: u16,
    flags: u16,
    seq: u32,
    ack: u32,
    payload_len: usize,
) -> Vec<u8> {
    let mut pkt = vec![0u8; 20 + payload_len];
    pkt[0..2].copy_from_slice(&sport.to_be_bytes());
    pkt[2..4].copy_from_slice(&dport.to_be_bytes());
    pkt[4..8].copy_from_slice(&seq.to_be_bytes());
    pkt[8..12].copy_from_slice(&ack.to_be_bytes());
    pkt[12] = 0x50 | ((flags >> 8) & 0x0F) as u8;
    pkt[13] = (flags & 0xFF) as u8;
    pkt[14..16].copy_from_slice(&65535u16.to_be_bytes());
    for (i, byte) in pkt[20..].iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }
    pkt
}

/// A SYN with a typical option block (MSS, SACK-permitted, timestamps, WS).
fn make_syn_with_options() -> Vec<u8> {
    let mut pkt = make_segment(40000, 80, 0x002, 1000, 0, 0);
    let options: &[u8] = &[
        2, 4, 0x05, 0xB4, // MSS 1460
        4, 2, // SACK permitted
        8, 10, 0, 0, 0, 1, 0, 0, 0, 0, // timestamps
        1, // NOP
        3, 3, 7, // window scale 7
    ];
    let header_len = 20 + options.len();
    let mut with_opts = vec![0u8; header_len];
    with_opts[..20].copy_from_slice(&pkt[..20]);
    with_opts[12] = (((header_len / 4) as u8) << 4) | (pkt[12] & 0x0F);
    with_opts[20..].copy_from_slice(options);
    pkt = with_opts;
    pkt
}

fn meta(frame: u32, ts: f64) -> SegmentMeta {
    SegmentMeta {
        src: CLIENT,
        dst: SERVER,
        ts,
        frame,
        visited: false,
        fragmented: false,
        in_error: false,
    }
}

fn bench_segment_parse(c: &mut Criterion) {
    let plain = make_segment(40000, 80, 0x010, 1000, 1, 1400);
    let with_options = make_syn_with_options();

    let mut group = c.benchmark_group("segment_parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("data_1420B", |b| {
        b.iter(|| {
            let mut notes = Vec::new();
            let _ = streamscope::segment::parse(black_box(&plain), true, &mut notes);
        })
    });

    group.bench_function("syn_with_options", |b| {
        b.iter(|| {
            let mut notes = Vec::new();
            let _ = streamscope::segment::parse(black_box(&with_options), true, &mut notes);
        })
    });

    group.finish();
}

fn bench_process_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_segment");
    group.throughput(Throughput::Elements(1));

    group.bench_function("established_stream", |b| {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        // Handshake once; the measured loop rides the established stream.
        let syn = make_segment(40000, 80, 0x002, 1000, 0, 0);
        let synack = make_segment(80, 40000, 0x012, 5000, 1001, 0);
        let ack = make_segment(40000, 80, 0x010, 1001, 5001, 0);
        engine
            .process_segment(&SegmentInput {
                meta: meta(1, 0.0),
                data: &syn,
            })
            .unwrap();
        engine
            .process_segment(&SegmentInput {
                meta: SegmentMeta {
                    src: SERVER,
                    dst: CLIENT,
                    ..meta(2, 0.01)
                },
                data: &synack,
            })
            .unwrap();
        engine
            .process_segment(&SegmentInput {
                meta: meta(3, 0.02),
                data: &ack,
            })
            .unwrap();

        let mut frame = 3u32;
        let mut seq = 1001u32;
        let mut ts = 0.03f64;
        b.iter(|| {
            frame += 1;
            let data = make_segment(40000, 80, 0x010, seq, 5001, 1400);
            seq = seq.wrapping_add(1400);
            ts += 0.001;
            let _ = engine.process_segment(&SegmentInput {
                meta: meta(frame, ts),
                data: black_box(&data),
            });
        })
    });

    group.bench_function("new_conversations", |b| {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let mut port = 1024u16;
        let mut frame = 0u32;
        b.iter(|| {
            frame += 1;
            port = if port >= 60000 { 1024 } else { port + 1 };
            let data = make_segment(port, 80, 0x002, 1000, 0, 0);
            let _ = engine.process_segment(&SegmentInput {
                meta: meta(frame, frame as f64 * 0.001),
                data: black_box(&data),
            });
        })
    });

    group.finish();
}

criterion_group!(benches, bench_segment_parse, bench_process_segment);
criterion_main!(benches);
