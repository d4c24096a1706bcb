//! Symbol interning benchmarks
//!
//! Run with: `cargo bench --bench symbol_bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relive_util::symbol::Symbol;

fn bench_intern(c: &mut Criterion) {
    let mut group = c.benchmark_group("intern");
    group.throughput(Throughput::Elements(1));

    group.bench_function("intern_new_string", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            Symbol::intern(&format!("bench_field_{}", counter))
        })
    });

    group.bench_function("intern_existing_string", |b| {
        let _sym = Symbol::intern("existing_field");
        b.iter(|| black_box(Symbol::intern("existing_field")))
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    let a = Symbol::intern("getValue");
    let b = Symbol::intern("setValue");

    group.bench_function("as_str", |bench| bench.iter(|| black_box(a.as_str())));

    group.bench_function("cmp_str", |bench| {
        bench.iter(|| black_box(a.cmp_str(black_box(b))))
    });

    group.finish();
}

criterion_group!(benches, bench_intern, bench_lookup);
criterion_main!(benches);
