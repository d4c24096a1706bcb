//! Tests for the IndexVec module.

use super::*;
use quickcheck_macros::quickcheck;

crate::define_idx!(TestId);

// ============================================================================
// BASIC OPERATIONS
// ============================================================================

#[test]
fn test_new_and_empty() {
    let vec: IndexVec<TestId, i32> = IndexVec::new();
    assert!(vec.is_empty());
    assert_eq!(vec.len(), 0);
    assert_eq!(vec.next_index(), TestId(0));
}

#[test]
fn test_push_returns_sequential_ids() {
    let mut vec: IndexVec<TestId, &str> = IndexVec::new();
    let a = vec.push("a");
    let b = vec.push("b");

    assert_eq!(a, TestId(0));
    assert_eq!(b, TestId(1));
    assert_eq!(vec[a], "a");
    assert_eq!(vec[b], "b");
    assert_eq!(vec.next_index(), TestId(2));
}

#[test]
fn test_get_out_of_bounds() {
    let mut vec: IndexVec<TestId, i32> = IndexVec::new();
    let idx = vec.push(42);

    assert_eq!(vec.get(idx), Some(&42));
    assert_eq!(vec.get(TestId(7)), None);
    assert!(vec.contains(idx));
    assert!(!vec.contains(TestId(7)));
}

#[test]
fn test_index_mut() {
    let mut vec: IndexVec<TestId, i32> = IndexVec::new();
    let idx = vec.push(1);
    vec[idx] += 41;
    assert_eq!(vec[idx], 42);
}

// ============================================================================
// PAIRED ACCESS
// ============================================================================

#[test]
fn test_pick2_mut_both_orders() {
    let mut vec: IndexVec<TestId, Vec<u8>> = IndexVec::new();
    let old = vec.push(vec![1, 2]);
    let new = vec.push(vec![3]);

    {
        let (a, b) = vec.pick2_mut(old, new);
        std::mem::swap(a, b);
    }
    assert_eq!(vec[old], vec![3]);
    assert_eq!(vec[new], vec![1, 2]);

    {
        let (b, a) = vec.pick2_mut(new, old);
        std::mem::swap(a, b);
    }
    assert_eq!(vec[old], vec![1, 2]);
}

#[test]
#[should_panic(expected = "distinct")]
fn test_pick2_mut_same_id_panics() {
    let mut vec: IndexVec<TestId, i32> = IndexVec::new();
    let id = vec.push(0);
    let _ = vec.pick2_mut(id, id);
}

// ============================================================================
// ITERATION
// ============================================================================

#[test]
fn test_iter_enumerated_pairs_ids() {
    let mut vec: IndexVec<TestId, char> = IndexVec::new();
    vec.push('x');
    vec.push('y');

    let pairs: Vec<_> = vec.iter_enumerated().map(|(i, c)| (i, *c)).collect();
    assert_eq!(pairs, vec![(TestId(0), 'x'), (TestId(1), 'y')]);
    assert_eq!(vec.indices().collect::<Vec<_>>(), vec![TestId(0), TestId(1)]);
}

#[test]
fn test_display_names_the_id_type() {
    assert_eq!(TestId(5).to_string(), "TestId#5");
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[quickcheck]
fn prop_push_then_index_returns_value(values: Vec<i64>) -> bool {
    let mut vec: IndexVec<TestId, i64> = IndexVec::new();
    let ids: Vec<_> = values.iter().map(|v| vec.push(*v)).collect();
    ids.iter().zip(values.iter()).all(|(id, v)| vec[*id] == *v)
}
