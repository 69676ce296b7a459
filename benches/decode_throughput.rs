//! Benchmarks for the receive path
//!
//! Covers the work done per frame on the pipeline task:
//! - frame reading from an in-memory byte stream
//! - cooked spectrum and energy decoding
//! - XML classification of status and result messages
//!
//! Platform: Cross-platform (synthetic frames, CI-safe)

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use xrf_link::frame::FrameReader;
use xrf_link::packet::{COOKED_PAYLOAD_SIZE, classify};
use xrf_link::test_utils::{iron_results_xml, spectrum_frames, status_xml, xml_frame};
use xrf_link::{CookedSpectrum, Frame};

fn bench_spectrum_decode(c: &mut Criterion) {
    let [_, spectrum] = spectrum_frames(3, 1200);

    let mut group = c.benchmark_group("spectrum_decode");
    group.throughput(Throughput::Bytes(COOKED_PAYLOAD_SIZE as u64));

    group.bench_function("cooked_spectrum", |b| {
        b.iter(|| black_box(CookedSpectrum::decode(black_box(&spectrum.payload)).expect("decode")))
    });
    group.bench_function("classify_cooked_spectrum", |b| {
        b.iter(|| black_box(classify(black_box(&spectrum)).expect("classify")))
    });

    group.finish();
}

fn bench_xml_classify(c: &mut Criterion) {
    let status = xml_frame(&status_xml("Phase Change", "2"));
    let results = xml_frame(&iron_results_xml());

    let mut group = c.benchmark_group("xml_classify");
    group.bench_function("status_change", |b| {
        b.iter(|| black_box(classify(black_box(&status)).expect("classify")))
    });
    group.bench_function("assay_results", |b| {
        b.iter(|| black_box(classify(black_box(&results)).expect("classify")))
    });
    group.finish();
}

fn bench_frame_reader(c: &mut Criterion) {
    // One phase update: energy then spectrum, repeated
    let mut wire = Vec::new();
    let mut frames = 0u64;
    for sequence in 1..=20 {
        for frame in spectrum_frames(sequence, sequence) {
            wire.extend_from_slice(&frame.encode());
            frames += 1;
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");

    let mut group = c.benchmark_group("frame_reader");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("read_spectrum_stream", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut reader = FrameReader::new(black_box(wire.as_slice()));
                let mut last: Option<Frame> = None;
                for _ in 0..frames {
                    last = Some(reader.read_frame().await.expect("frame"));
                }
                black_box(last)
            })
        })
    });
    group.finish();
}

criterion_group!(benches, bench_spectrum_decode, bench_xml_classify, bench_frame_reader);
criterion_main!(benches);
