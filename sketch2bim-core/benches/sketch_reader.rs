//! Sketch reader throughput on synthetic floor plans.
//!
//! Run with: cargo bench -p sketch2bim-core --bench sketch_reader

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use sketch2bim_core::config::{ReaderConfig, SymbolConfig};
use sketch2bim_core::hough::hough_lines_p;
use sketch2bim_core::plan::LegendData;
use sketch2bim_core::sketch_reader::SketchReader;
use sketch2bim_core::wall_merger::merge_wall_segments;

/// A grid of `rooms × rooms` outlined rooms filling the image
fn grid_plan(size: u32, rooms: u32) -> GrayImage {
    let mut img = GrayImage::from_pixel(size, size, Luma([255]));
    let margin = size / 10;
    let step = (size - 2 * margin) / rooms;
    let span = step * rooms + 4;
    for i in 0..=rooms {
        let offset = (margin + i * step) as i32;
        draw_filled_rect_mut(&mut img, Rect::at(offset, margin as i32).of_size(4, span), Luma([0]));
        draw_filled_rect_mut(&mut img, Rect::at(margin as i32, offset).of_size(span, 4), Luma([0]));
    }
    img
}

fn reader() -> SketchReader {
    let config = ReaderConfig {
        nlm_search_window: 3,
        ..ReaderConfig::default()
    };
    SketchReader::new(config, SymbolConfig::default())
}

fn bench_edges_and_walls(c: &mut Criterion) {
    let reader = reader();
    let mut group = c.benchmark_group("edges_and_walls");
    group.sample_size(10);

    for size in [512u32, 1024] {
        let img = grid_plan(size, 3);
        let preprocessed = reader.preprocess(&img);
        group.throughput(Throughput::Elements((size * size) as u64));

        group.bench_with_input(BenchmarkId::new("edges", size), &preprocessed, |b, pre| {
            b.iter(|| SketchReader::link_edges(&reader.detect_edges(black_box(pre))))
        });

        let linked = SketchReader::link_edges(&reader.detect_edges(&preprocessed));
        group.bench_with_input(BenchmarkId::new("walls", size), &linked, |b, linked| {
            b.iter(|| {
                let config = reader.config();
                let segments = hough_lines_p(
                    black_box(linked),
                    config.hough_threshold,
                    config.min_line_length,
                    config.max_line_gap,
                );
                merge_wall_segments(&segments, 0.01, config)
            })
        });
    }
    group.finish();
}

fn bench_read_image(c: &mut Criterion) {
    let reader = reader();
    let legend = LegendData::default();
    let img = grid_plan(1024, 2);

    let mut group = c.benchmark_group("read_image");
    group.sample_size(10);
    group.bench_function("grid_2x2_1024", |b| b.iter(|| reader.read_image(black_box(&img), Some(&legend))));
    group.finish();
}

criterion_group!(benches, bench_edges_and_walls, bench_read_image);
criterion_main!(benches);
