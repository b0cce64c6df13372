use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use tessera_core::{detect_changes, diff, Block, Document};

fn document(n: usize, edited: Option<usize>) -> Document {
    let blocks = (0..n)
        .map(|i| {
            let text = if Some(i) == edited {
                format!("Paragraph {i} (edited)")
            } else {
                format!("Paragraph {i} with some ordinary sentence content.")
            };
            Block::new("paragraph", json!({ "text": text }))
        })
        .collect();
    Document::with_blocks(blocks)
}

fn bench_single_edit_500_blocks(c: &mut Criterion) {
    let prev = document(500, None);
    let cur = document(500, Some(250));

    c.bench_function("detect_changes_single_edit_500", |b| {
        b.iter(|| {
            black_box(detect_changes(black_box(Some(&prev)), black_box(&cur)));
        })
    });
}

fn bench_append_500_blocks(c: &mut Criterion) {
    let prev = document(500, None);
    let cur = document(501, None);

    c.bench_function("detect_changes_append_500", |b| {
        b.iter(|| {
            black_box(detect_changes(black_box(Some(&prev)), black_box(&cur)));
        })
    });
}

fn bench_unchanged_500_blocks(c: &mut Criterion) {
    let prev = document(500, None);
    let cur = prev.clone();

    c.bench_function("diff_unchanged_500", |b| {
        b.iter(|| {
            black_box(diff(black_box(Some(&prev)), black_box(&cur)));
        })
    });
}

fn bench_truncate_to_half(c: &mut Criterion) {
    let prev = document(500, None);
    let cur = document(250, None);

    c.bench_function("detect_changes_truncate_250", |b| {
        b.iter(|| {
            black_box(detect_changes(black_box(Some(&prev)), black_box(&cur)));
        })
    });
}

criterion_group!(
    benches,
    bench_single_edit_500_blocks,
    bench_append_500_blocks,
    bench_unchanged_500_blocks,
    bench_truncate_to_half,
);
criterion_main!(benches);
