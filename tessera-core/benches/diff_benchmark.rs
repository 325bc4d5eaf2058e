use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tessera_core::{diff, html, Parts, Template};

fn table(rows: usize, marker: usize) -> Template {
    let items: Vec<Template> = (0..rows)
        .map(|i| html!("<tr><td>{}</td><td>{}</td></tr>", i, if i == marker { "hot" } else { "cold" }))
        .collect();
    html!("<h1>{}</h1><table>{}</table>", "Report", items)
}

fn bench_lower_table(c: &mut Criterion) {
    let template = table(1_000, 0);

    c.bench_function("lower_table_1K_rows", |b| {
        b.iter(|| black_box(black_box(&template).to_parts()))
    });
}

fn bench_diff_unchanged(c: &mut Criterion) {
    let a = table(1_000, 0).to_parts();
    let b_tree = a.clone();

    c.bench_function("diff_unchanged_1K_rows", |b| {
        b.iter(|| black_box(diff(black_box(&a), black_box(&b_tree))))
    });
}

fn bench_diff_one_row_changed(c: &mut Criterion) {
    let a = table(1_000, 0).to_parts();
    let next = table(1_000, 500).to_parts();

    c.bench_function("diff_one_row_changed_1K_rows", |b| {
        b.iter(|| black_box(diff(black_box(&a), black_box(&next))))
    });
}

fn bench_merge_patch(c: &mut Criterion) {
    let a = table(200, 0).to_parts();
    let next = table(200, 100).to_parts();
    let patch = diff(&a, &next);

    c.bench_function("merge_patch_200_rows", |b| {
        b.iter(|| {
            let mut client: Parts = a.clone();
            client.merge(black_box(&patch));
            black_box(client)
        })
    });
}

fn bench_encode_json(c: &mut Criterion) {
    let parts = table(200, 0).to_parts();

    c.bench_function("encode_json_200_rows", |b| {
        b.iter(|| black_box(serde_json::to_vec(black_box(&parts)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_lower_table,
    bench_diff_unchanged,
    bench_diff_one_row_changed,
    bench_merge_patch,
    bench_encode_json,
);
criterion_main!(benches);
