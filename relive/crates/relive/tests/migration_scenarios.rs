//! Instance migration across updates
//!
//! Covers lazy conversion on access, storage transitions through phantom
//! areas, custom transformers and the eager sweep.

mod common;

use common::*;
use relive::migration::TransitionKind;
use relive::model::Assembler;
use relive::{ClassDef, FnTransformer, MigrationMode, UpdateConfig, UpdateError, UpdateRequest, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_grow_then_shrink_round_trip() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("P").field("x", "I"));
    let t = fx.thread("main");
    let obj = t.new_object("P").unwrap();
    t.set_field(obj, "x", Value::Int(42)).unwrap();

    assert!(fx.redefine(ClassDef::new("P").field("y", "J").field("x", "I")).is_success());
    assert_eq!(t.get_field(obj, "x").unwrap(), Value::Int(42));
    assert_eq!(t.get_field(obj, "y").unwrap(), Value::Long(0));
    assert!(fx.vm().heap.get(obj).unwrap().is_mixed(), "grown instance spills into a phantom area");
    t.set_field(obj, "y", Value::Long(-1)).unwrap();

    assert!(fx.redefine(ClassDef::new("P").field("x", "I")).is_success());
    assert_eq!(t.get_field(obj, "x").unwrap(), Value::Int(42));
    assert!(!fx.vm().heap.get(obj).unwrap().is_mixed());

    let stats = &fx.vm().stats;
    assert_eq!(stats.migrations(TransitionKind::SimpleToMixed), 1);
    assert_eq!(stats.migrations(TransitionKind::MixedToSimple), 1);
}

#[test]
fn test_object_migrates_only_when_touched() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("L").field("v", "I"));
    let t = fx.thread("main");
    let obj = t.new_object("L").unwrap();
    let old = t.header_class(obj).unwrap();

    assert!(fx.redefine(ClassDef::new("L").field("w", "I").field("v", "I")).is_success());
    assert_eq!(t.header_class(obj).unwrap(), old);
    assert_eq!(fx.runtime.stats().objects_migrated, 0);

    t.get_field(obj, "v").unwrap();
    assert_eq!(t.header_class(obj).unwrap(), fx.vm().lookup_class("L").unwrap());
    assert_eq!(fx.runtime.stats().objects_migrated, 1);
}

#[test]
fn test_transformer_converts_old_values() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("Temp").field("celsius", "I"));
    let t = fx.thread("main");
    let boiling = t.new_object("Temp").unwrap();
    t.set_field(boiling, "celsius", Value::Int(100)).unwrap();

    let transformer = FnTransformer::shared(&["celsius"], |view, old| {
        let c = old[0].as_int().unwrap_or_default();
        view.set("fahrenheit", Value::Int(c * 9 / 5 + 32))
    });
    let request = UpdateRequest::builder()
        .redefine(ClassDef::new("Temp").field("fahrenheit", "I"))
        .transformer("Temp", transformer)
        .build();
    assert!(fx.update(request).is_success());

    assert_eq!(t.get_field(boiling, "fahrenheit").unwrap(), Value::Int(212));
    assert!(t.get_field(boiling, "celsius").is_err());
}

#[test]
fn test_failing_transformer_is_retried() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("Acct").field("cents", "I"));
    let t = fx.thread("main");
    let obj = t.new_object("Acct").unwrap();
    t.set_field(obj, "cents", Value::Int(250)).unwrap();

    let failures_left = Arc::new(AtomicUsize::new(2));
    let calls = Arc::new(AtomicUsize::new(0));
    let transformer = {
        let (failures_left, calls) = (Arc::clone(&failures_left), Arc::clone(&calls));
        FnTransformer::shared(&["cents"], move |view, old| {
            calls.fetch_add(1, Ordering::SeqCst);
            if failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("rates not loaded");
            }
            let cents = old[0].as_int().unwrap_or_default();
            view.set("dollars", Value::Int(cents / 100))
        })
    };
    let request = UpdateRequest::builder()
        .redefine(ClassDef::new("Acct").field("dollars", "I"))
        .transformer("Acct", transformer)
        .build();
    assert!(fx.update(request).is_success());

    // running code is not stopped by a failing transformer
    assert_eq!(t.get_field(obj, "dollars").unwrap(), Value::Int(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // an explicit migration reports the failure
    let err = t.migrate_object(obj).unwrap_err();
    assert!(matches!(err, UpdateError::ObjectMigration { .. }), "{:?}", err);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    t.migrate_object(obj).unwrap();
    assert_eq!(t.get_field(obj, "dollars").unwrap(), Value::Int(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(t.header_class(obj).unwrap(), fx.vm().lookup_class("Acct").unwrap());
    assert_eq!(fx.runtime.stats().transformer_failures, 2);
}

#[test]
fn test_eager_sweep_migrates_whole_heap() {
    let fx = UpdateFixture::with_config(UpdateConfig {
        migration_mode: MigrationMode::Eager,
        eager_workers: Some(2),
        ..Default::default()
    });
    fx.define(ClassDef::new("Q").field("a", "I"));
    let t = fx.thread("main");
    let objects: Vec<_> = (0..10)
        .map(|i| {
            let obj = t.new_object("Q").unwrap();
            t.set_field(obj, "a", Value::Int(i)).unwrap();
            obj
        })
        .collect();

    assert!(fx.redefine(ClassDef::new("Q").field("a", "I").field("b", "J")).is_success());
    let live = fx.vm().lookup_class("Q").unwrap();
    for obj in &objects {
        assert_eq!(t.header_class(*obj).unwrap(), live);
    }
    assert_eq!(fx.runtime.stats().objects_migrated, 10);

    for (i, obj) in objects.iter().enumerate() {
        assert_eq!(t.get_field(*obj, "a").unwrap(), Value::Int(i as i32));
        assert_eq!(t.get_field(*obj, "b").unwrap(), Value::Long(0));
    }
}

#[test]
fn test_chained_updates_migrate_through_every_version() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("V").field("keep", "I"));
    let t = fx.thread("main");
    let obj = t.new_object("V").unwrap();
    t.set_field(obj, "keep", Value::Int(11)).unwrap();

    assert!(fx.redefine(ClassDef::new("V").field("keep", "I").field("one", "I")).is_success());
    assert!(fx
        .redefine(ClassDef::new("V").field("two", "J").field("keep", "I").field("one", "I"))
        .is_success());
    assert_eq!(fx.vm().class_versions("V").len(), 3);

    assert_eq!(t.get_field(obj, "keep").unwrap(), Value::Int(11));
    assert_eq!(t.get_field(obj, "two").unwrap(), Value::Long(0));
    assert_eq!(t.header_class(obj).unwrap(), fx.vm().lookup_class("V").unwrap());
}

#[test]
fn test_inherited_field_store_migrates_stale_instance() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("Base").field("a", "I"));
    fx.define(ClassDef::new("Sub").extends("Base").field("b", "I"));
    let mut helper = ClassDef::new("Poke");
    let poke = Assembler::new(&mut helper)
        .load(0)
        .iconst(7)
        .putfield("Base", "a", "I")
        .vreturn()
        .finish();
    fx.define(helper.static_method("poke", "(LSub;)V", poke));

    let t = fx.thread("main");
    let obj = t.new_object("Sub").unwrap();
    t.set_field(obj, "a", Value::Int(5)).unwrap();
    t.set_field(obj, "b", Value::Int(6)).unwrap();
    let old = t.header_class(obj).unwrap();

    let report = fx.redefine(ClassDef::new("Sub").extends("Base").field("c", "J").field("b", "I"));
    assert!(report.is_success(), "{:?}", report);
    assert!(report.class("Base").is_none(), "the declaring class is untouched");
    assert_eq!(t.header_class(obj).unwrap(), old);

    t.invoke_static("Poke", "poke", "(LSub;)V", &[Value::Ref(obj)]).unwrap();
    assert_eq!(t.header_class(obj).unwrap(), fx.vm().lookup_class("Sub").unwrap());
    assert_eq!(fx.runtime.stats().objects_migrated, 1);

    assert_eq!(t.get_field(obj, "a").unwrap(), Value::Int(7));
    assert_eq!(t.get_field(obj, "b").unwrap(), Value::Int(6));
    assert_eq!(t.get_field(obj, "c").unwrap(), Value::Long(0));
}
