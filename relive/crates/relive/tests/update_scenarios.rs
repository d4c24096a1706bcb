//! End-to-end update scenarios
//!
//! Each test defines classes, creates state through a thread handle,
//! submits an update and checks what running code and existing instances
//! observe afterwards.

mod common;

use common::*;
use crossbeam::channel;
use relive::model::{AccessFlags, Assembler};
use relive::{ClassDef, ClassState, DiagnosticCode, RequestState, UpdateRequest, Value};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_inserted_field_keeps_existing_values() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("C").field("a", "I").field("b", "I"));
    let t = fx.thread("main");
    let obj = t.new_object("C").unwrap();
    t.set_field(obj, "a", Value::Int(5)).unwrap();
    t.set_field(obj, "b", Value::Int(9)).unwrap();

    let report = fx.redefine(ClassDef::new("C").field("a", "I").field("c", "I").field("b", "I"));
    assert!(report.is_success(), "{:?}", report);
    let outcome = report.class("C").unwrap();
    assert_eq!(outcome.state, ClassState::Redefined);
    assert_eq!(outcome.updating_type, "BOTH");
    assert_eq!((report.from_rn, report.to_rn), (0, 1));

    assert_eq!(t.get_field(obj, "a").unwrap(), Value::Int(5));
    assert_eq!(t.get_field(obj, "c").unwrap(), Value::Int(0));
    assert_eq!(t.get_field(obj, "b").unwrap(), Value::Int(9));
    assert!(t.instance_of(obj, "C").unwrap());
}

#[test]
fn test_new_instances_use_new_layout() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("P").field("x", "I"));
    let report = fx.redefine(ClassDef::new("P").field("x", "I").field("y", "J"));
    assert!(report.is_success(), "{:?}", report);

    let t = fx.thread("main");
    let obj = t.new_object("P").unwrap();
    t.set_field(obj, "y", Value::Long(1 << 40)).unwrap();
    assert_eq!(t.get_field(obj, "y").unwrap(), Value::Long(1 << 40));
    assert_eq!(t.get_field(obj, "x").unwrap(), Value::Int(0));
}

#[test]
fn test_deleted_superclass_dispatches_to_ancestor() {
    let fx = UpdateFixture::new();
    fx.define(returns(ClassDef::new("A"), "m", 1));
    fx.define(returns(ClassDef::new("D").extends("A"), "m", 2));
    fx.define(ClassDef::new("E").extends("D").field("x", "I"));
    let t = fx.thread("main");
    let e = t.new_object("E").unwrap();
    t.set_field(e, "x", Value::Int(7)).unwrap();
    assert_eq!(t.invoke_virtual(e, "m", "()I", &[]).unwrap(), Some(Value::Int(2)));

    let report = fx.update(UpdateRequest::builder().delete("D").build());
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.class("D").unwrap().state, ClassState::Deleted);
    assert!(fx.vm().lookup_class("D").is_none());

    assert_eq!(t.invoke_virtual(e, "m", "()I", &[]).unwrap(), Some(Value::Int(1)));
    assert_eq!(t.get_field(e, "x").unwrap(), Value::Int(7));
    assert!(t.instance_of(e, "A").unwrap());
}

#[test]
fn test_barrier_defers_apply_until_frame_returns() {
    let fx = UpdateFixture::new();
    let (entered_tx, entered_rx) = channel::bounded::<()>(1);
    let (release_tx, release_rx) = channel::bounded::<()>(1);
    fx.vm().register_native("Host", "block", "()I", move |_, _| {
        let _ = entered_tx.send(());
        let _ = release_rx.recv();
        Ok(Some(Value::Int(0)))
    });
    fx.define(native(ClassDef::new("Host"), "block", "()I"));

    let mut v1 = ClassDef::new("C");
    let m = Assembler::new(&mut v1)
        .invokestatic("Host", "block", "()I")
        .pop()
        .iconst(1)
        .ireturn()
        .finish();
    let outer = Assembler::new(&mut v1).invokestatic("C", "m", "()I").ireturn().finish();
    fx.define(v1.static_method("m", "()I", m).static_method("outer", "()I", outer));

    let vm = Arc::clone(fx.vm());
    let worker = std::thread::spawn(move || {
        let t = vm.attach_thread("worker");
        let first = t.invoke_static("C", "outer", "()I", &[]).unwrap();
        let second = t.invoke_static("C", "outer", "()I", &[]).unwrap();
        (first, second, t.current_revision())
    });
    entered_rx.recv_timeout(TEST_TIMEOUT).unwrap();

    let mut v2 = ClassDef::new("C");
    let m = Assembler::new(&mut v2).iconst(2).ireturn().finish();
    let outer = Assembler::new(&mut v2).invokestatic("C", "m", "()I").ireturn().finish();
    let request = UpdateRequest::builder()
        .redefine(v2.static_method("m", "()I", m).static_method("outer", "()I", outer))
        .build();
    let handle = fx.runtime.submit_async(request).unwrap();

    assert!(wait_until(|| fx.runtime.stats().interrupted_attempts >= 1));
    assert!(handle.try_result().is_none(), "apply must wait for the worker");
    assert_eq!(fx.vm().revision(), 0);
    release_tx.send(()).unwrap();

    let report = handle.wait_timeout(TEST_TIMEOUT).unwrap();
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.class("C").unwrap().state, ClassState::Swapped);
    assert!(report.attempts >= 2);

    let (first, second, rn) = worker.join().unwrap();
    assert_eq!(first, Some(Value::Int(1)), "the running call finishes on old code");
    assert_eq!(second, Some(Value::Int(2)));
    assert_eq!(rn, 1);

    let stats = fx.runtime.stats();
    assert!(stats.barriers_installed >= 1);
    assert!(stats.barriers_fired >= 1);
}

#[test]
fn test_threads_attached_during_updates_follow_revisions() {
    let fx = UpdateFixture::new();
    let clock = |value| static_returns(ClassDef::new("Clock"), "tick", value);
    fx.define(clock(0));

    let vm = Arc::clone(fx.vm());
    let attacher = std::thread::spawn(move || {
        (0..200)
            .map(|i| vm.attach_thread(&format!("late-{}", i)))
            .collect::<Vec<_>>()
    });
    for value in 1..=5 {
        assert!(fx.redefine(clock(value)).is_success());
    }
    let late = attacher.join().unwrap();

    let report = fx.redefine(clock(6));
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(fx.vm().revision(), 6);
    for t in &late {
        assert_eq!(t.current_revision(), 6, "{} left behind", t.id());
        assert_eq!(t.invoke_static("Clock", "tick", "()I", &[]).unwrap(), Some(Value::Int(6)));
    }
}

#[test]
fn test_added_class_is_usable() {
    let fx = UpdateFixture::new();
    fx.define(static_returns(ClassDef::new("Existing"), "v", 3));
    let report = fx.update(
        UpdateRequest::builder()
            .define(static_returns(ClassDef::new("Fresh"), "v", 4))
            .build(),
    );
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.class("Fresh").unwrap().state, ClassState::Added);
    assert_eq!(report.class("Fresh").unwrap().updating_type, "ADD");

    let t = fx.thread("main");
    assert_eq!(t.invoke_static("Fresh", "v", "()I", &[]).unwrap(), Some(Value::Int(4)));
    assert_eq!(fx.vm().revision_interval("Fresh"), Some((1, u64::MAX)));
}

#[test]
fn test_body_change_swaps_in_place() {
    let fx = UpdateFixture::new();
    fx.define(returns(ClassDef::new("Counter").field("n", "I"), "get", 1));
    let before = fx.vm().lookup_class("Counter").unwrap();
    let t = fx.thread("main");
    let obj = t.new_object("Counter").unwrap();

    let report = fx.redefine(returns(ClassDef::new("Counter").field("n", "I"), "get", 5));
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.class("Counter").unwrap().updating_type, "BODY_CHANGE");

    assert_eq!(fx.vm().lookup_class("Counter"), Some(before), "a swap keeps the class id");
    assert_eq!(t.invoke_virtual(obj, "get", "()I", &[]).unwrap(), Some(Value::Int(5)));
    assert_eq!(t.header_class(obj).unwrap(), before);
}

#[test]
fn test_swapped_versions_stay_in_history() {
    let fx = UpdateFixture::new();
    let counter = |value| returns(ClassDef::new("Counter").field("n", "I"), "get", value);
    fx.define(counter(1));
    let live = fx.vm().lookup_class("Counter").unwrap();

    assert!(fx.redefine(counter(2)).is_success());
    assert!(fx.redefine(counter(3)).is_success());
    assert_eq!(fx.vm().revision_interval("Counter"), Some((2, u64::MAX)));

    let versions = fx.vm().class_versions("Counter");
    let intervals: Vec<_> = versions.iter().map(|&(_, born, dead)| (born, dead)).collect();
    assert_eq!(intervals, vec![(0, 1), (1, 2), (2, u64::MAX)]);
    assert_eq!(versions.last().map(|v| v.0), Some(live));

    // a redefinition after the swaps keeps the whole history reachable
    assert!(fx.redefine(ClassDef::new("Counter").field("n", "I").field("m", "J")).is_success());
    let versions = fx.vm().class_versions("Counter");
    assert_eq!(versions.len(), 4);
    assert_eq!(versions[2], (live, 2, 3));
    for pair in versions.windows(2) {
        assert_eq!(pair[0].2, pair[1].1, "each version dies when its successor is born");
    }
}

#[test]
fn test_subclass_redefined_with_superclass() {
    let fx = UpdateFixture::new();
    fx.define(ClassDef::new("Base").field("a", "I"));
    fx.define(getter(ClassDef::new("Sub").extends("Base").field("s", "I"), "Sub", "s"));
    let t = fx.thread("main");
    let obj = t.new_object("Sub").unwrap();
    t.set_field(obj, "a", Value::Int(3)).unwrap();
    t.set_field(obj, "s", Value::Int(4)).unwrap();

    let report = fx.redefine(ClassDef::new("Base").field("z", "J").field("a", "I"));
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.class("Sub").unwrap().state, ClassState::Redefined);

    assert_eq!(t.invoke_virtual(obj, "get_s", "()I", &[]).unwrap(), Some(Value::Int(4)));
    assert_eq!(t.get_field(obj, "a").unwrap(), Value::Int(3));
    assert_eq!(t.get_field(obj, "z").unwrap(), Value::Long(0));
}

#[test]
fn test_final_override_fails_whole_request() {
    let fx = UpdateFixture::new();
    fx.define(returns(ClassDef::new("Base"), "m", 1));
    fx.define(returns(ClassDef::new("Sub").extends("Base"), "m", 2));

    let mut v2 = ClassDef::new("Base");
    let code = Assembler::new(&mut v2).iconst(1).ireturn().finish();
    let v2 = v2.method_with("m", "()I", AccessFlags::PUBLIC | AccessFlags::FINAL, code);
    let report = fx.redefine(v2);

    assert_eq!(report.state, RequestState::Failed);
    assert_eq!(report.code, DiagnosticCode::CLASS_RESOLUTION);
    assert_eq!(fx.vm().revision(), 0);

    let t = fx.thread("main");
    let obj = t.new_object("Sub").unwrap();
    assert_eq!(t.invoke_virtual(obj, "m", "()I", &[]).unwrap(), Some(Value::Int(2)));

    // the registry is left clean for the next request
    let report = fx.redefine(returns(ClassDef::new("Base"), "m", 9));
    assert!(report.is_success(), "{:?}", report);
}

#[test]
fn test_empty_and_discarded_requests() {
    let fx = UpdateFixture::new();
    fx.define(static_returns(ClassDef::new("K"), "v", 1));

    let empty = fx.update(UpdateRequest::builder().build());
    assert_eq!(empty.state, RequestState::Empty);
    assert_eq!(empty.code, DiagnosticCode::EMPTY);
    assert!(empty.error.is_none());

    let same = fx.redefine(static_returns(ClassDef::new("K"), "v", 1));
    assert_eq!(same.state, RequestState::Discarded);
    assert_eq!(same.code, DiagnosticCode::DISCARDED);
    assert_eq!(fx.vm().revision(), 0);

    let stats = fx.runtime.stats();
    assert_eq!(stats.requests_discarded, 2);
    assert_eq!(stats.requests_finished, 0);
}

#[test]
fn test_unknown_class_rejected() {
    let fx = UpdateFixture::new();
    let report = fx.redefine(static_returns(ClassDef::new("Nope"), "v", 1));
    assert_eq!(report.state, RequestState::Failed);
    assert!(report.error.is_some());
    assert_eq!(fx.vm().revision(), 0);
}

#[test]
fn test_requests_apply_in_submission_order() {
    let fx = UpdateFixture::new();
    fx.define(static_returns(ClassDef::new("Seq"), "v", 0));
    let handles: Vec<_> = (1..=3)
        .map(|i| {
            let request = UpdateRequest::builder()
                .redefine(static_returns(ClassDef::new("Seq"), "v", i))
                .build();
            fx.runtime.submit_async(request).unwrap()
        })
        .collect();
    let mut revisions = Vec::new();
    for handle in handles {
        let report = handle.wait_timeout(TEST_TIMEOUT).unwrap();
        assert!(report.is_success(), "{:?}", report);
        revisions.push(report.to_rn);
    }
    assert_eq!(revisions, vec![1, 2, 3]);

    let t = fx.thread("main");
    assert_eq!(t.invoke_static("Seq", "v", "()I", &[]).unwrap(), Some(Value::Int(3)));
    std::thread::sleep(Duration::from_millis(1));
    assert_eq!(fx.runtime.stats().requests_finished, 3);
}
