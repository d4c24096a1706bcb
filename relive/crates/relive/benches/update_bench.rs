//! Update engine benchmarks
//!
//! Run with: `cargo bench --package relive`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relive::differ;
use relive::layout;
use relive::model::{Assembler, ClassRegistry, UpdatingType};
use relive::{ClassDef, Runtime, UpdateConfig, UpdateRequest};
use relive_util::ids::{ClassId, LoaderId};
use std::sync::Arc;

fn wide_class(fields: usize, inserted: bool, body: i8) -> ClassDef {
    let mut def = ClassDef::new("Wide");
    for i in 0..fields {
        if inserted && i == fields / 2 {
            def = def.field("inserted", "J");
        }
        def = def.field(&format!("f{}", i), "I");
    }
    for i in 0..8 {
        let value = if i == 0 { body } else { i as i8 };
        let code = Assembler::new(&mut def).iconst(value).ireturn().finish();
        def = def.method(&format!("m{}", i), "()I", code);
    }
    def
}

/// Registry holding an old version of `Wide` and an uninstalled new one
fn version_pair(fields: usize, inserted: bool) -> (ClassRegistry, ClassId, ClassId) {
    let mut reg = ClassRegistry::new(8);
    let old = reg.define(wide_class(fields, false, 0), LoaderId::BOOT, 0).unwrap();
    let new = reg
        .build(Arc::new(wide_class(fields, inserted, 1)), LoaderId::BOOT, |r, n| {
            r.lookup(LoaderId::BOOT, n)
        })
        .unwrap();
    (reg, old, new)
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    for &fields in &[4usize, 32, 256] {
        let (reg, old, new) = version_pair(fields, true);
        group.bench_with_input(BenchmarkId::new("field_inserted", fields), &fields, |b, _| {
            b.iter(|| black_box(differ::classify(&reg, old, new, |_| None).unwrap()))
        });
    }

    let (reg, old, new) = version_pair(32, false);
    group.bench_function("body_change", |b| {
        b.iter(|| black_box(differ::classify(&reg, old, new, |_| None).unwrap()))
    });

    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_plan");

    for &fields in &[4usize, 32, 256] {
        let (reg, old, new) = version_pair(fields, true);
        group.bench_with_input(BenchmarkId::from_parameter(fields), &fields, |b, _| {
            b.iter(|| black_box(layout::plan(&reg, old, new, UpdatingType::Both, true, None).unwrap()))
        });
    }

    group.finish();
}

fn bench_join(c: &mut Criterion) {
    let types = [
        UpdatingType::None,
        UpdatingType::Relink,
        UpdatingType::BodyChange,
        UpdatingType::StaticMethod,
        UpdatingType::StaticField,
        UpdatingType::Method,
        UpdatingType::Field,
        UpdatingType::Both,
    ];
    c.bench_function("updating_type_join", |b| {
        b.iter(|| {
            let mut joined = 0;
            for &a in &types {
                for &t in &types {
                    if black_box(a).join(black_box(t)).is_some() {
                        joined += 1;
                    }
                }
            }
            joined
        })
    });
}

fn bench_full_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_update");
    group.sample_size(20);

    let runtime = Runtime::new(UpdateConfig::default()).unwrap();
    runtime.vm().define_class(wide_class(16, false, 0)).unwrap();
    let mut body = 0i8;
    group.bench_function("body_change", |b| {
        b.iter(|| {
            body = body.wrapping_add(1);
            let request = UpdateRequest::builder().redefine(wide_class(16, false, body)).build();
            black_box(runtime.submit(request).unwrap())
        })
    });

    let runtime = Runtime::new(UpdateConfig::default()).unwrap();
    runtime.vm().define_class(wide_class(16, false, 0)).unwrap();
    let thread = runtime.vm().attach_thread("bench");
    for _ in 0..1_000 {
        thread.new_object("Wide").unwrap();
    }
    let mut inserted = false;
    group.bench_function("redefine_1k_lazy_instances", |b| {
        b.iter(|| {
            inserted = !inserted;
            let request = UpdateRequest::builder()
                .redefine(wide_class(16, inserted, 0))
                .build();
            black_box(runtime.submit(request).unwrap())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_classify, bench_plan, bench_join, bench_full_update);
criterion_main!(benches);
