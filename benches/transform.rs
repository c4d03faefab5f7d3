//! Criterion benchmarks for the per-frame acquisition hot path.
//!
//! Every frame passes through reshaping (de-interlace + transpose), channel filtering and
//! a queue push on the acquisition thread, so these set the ceiling on sustainable frame
//! rate for a given geometry.
//!
//! Run with: cargo bench --bench transform

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resonant_acq::data::transform::filter_channels;
use resonant_acq::data::{
    ChannelSelection, FrameGeometry, FrameQueue, FrameReshaper, OverflowPolicy,
};

fn geometry(size: usize, channels: usize) -> FrameGeometry {
    FrameGeometry {
        pixels_per_line: size,
        lines_per_frame: size,
        channels,
        pixel_size_bytes: 2,
        signed: true,
        tagging: true,
    }
}

/// Reshape throughput for single and four-channel frames.
fn reshape_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("reshape");

    for (name, size, channels) in [
        ("256x256x1", 256, 1),
        ("512x512x1", 512, 1),
        ("256x256x4", 256, 4),
        ("512x512x4", 512, 4),
    ] {
        let g = geometry(size, channels);
        let raw: Vec<u8> = (0..g.frame_bytes()).map(|i| i as u8).collect();
        let mut out = vec![0u8; g.data_bytes()];
        let mut reshaper = FrameReshaper::new(g);

        group.throughput(Throughput::Bytes(g.data_bytes() as u64));
        group.bench_with_input(BenchmarkId::new("reshape", name), &g, |b, _| {
            b.iter(|| reshaper.reshape(black_box(&raw), &mut out));
        });
    }

    group.finish();
}

/// Channel filtering for contiguous and scattered selections.
fn filter_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_channels");
    let g = geometry(512, 4);
    let frame = vec![1u8; g.data_bytes()];

    for (name, flags) in [
        ("all", vec![true; 4]),
        ("contiguous", vec![false, true, true, false]),
        ("scattered", vec![true, false, true, false]),
    ] {
        let selection = ChannelSelection::new(flags).unwrap();
        let mut dst = vec![0u8; g.record_bytes(selection.count())];
        group.bench_function(name, |b| {
            b.iter(|| {
                filter_channels(
                    black_box(&frame),
                    &mut dst,
                    &selection,
                    g.channel_bytes(),
                    Some(7),
                )
            });
        });
    }

    group.finish();
}

/// Push + checkout + pop round trip through a frame queue.
fn queue_round_trip(c: &mut Criterion) {
    let g = geometry(512, 1);
    let queue =
        FrameQueue::new("bench", g.frame_bytes(), 16, OverflowPolicy::DropOldest).unwrap();
    let frame = vec![3u8; g.frame_bytes()];

    c.bench_function("queue_push_pop_512x512", |b| {
        b.iter(|| {
            queue.push(black_box(&frame));
            let record = queue.front_checkout().unwrap();
            black_box(record[0]);
            record.checkin();
            queue.pop().unwrap();
        });
    });
}

criterion_group!(benches, reshape_throughput, filter_throughput, queue_round_trip);
criterion_main!(benches);
