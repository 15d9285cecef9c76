//! Single-threaded behaviour of the map, on both paths.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use tdsl::{TransactionManager, TxError, TxList};

#[test]
fn test_new_list_is_empty() {
    let (_manager, list, mut h) = common::setup::<u64, u64>();
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
    assert_eq!(list.get(&mut h, &1).unwrap(), None);
    assert!(!list.contains_key(&mut h, &1).unwrap());
}

#[test]
fn test_singleton_scenario() {
    let (_manager, list, mut h) = common::setup::<u64, u64>();
    assert_eq!(list.put(&mut h, 5, 3).unwrap(), None);
    assert_eq!(list.get(&mut h, &5).unwrap(), Some(3));
    assert_eq!(list.put(&mut h, 5, 4).unwrap(), Some(3));
    assert_eq!(list.get(&mut h, &5).unwrap(), Some(4));
    assert_eq!(list.remove(&mut h, &5).unwrap(), Some(4));
    assert_eq!(list.get(&mut h, &5).unwrap(), None);
    assert!(list.is_empty());
}

#[test]
fn test_transaction_scenario() {
    let (_manager, list, mut h) = common::setup::<u64, u64>();
    h.begin().unwrap();
    list.put(&mut h, 1, 4).unwrap();
    list.put(&mut h, 2, 6).unwrap();
    list.put(&mut h, 8, 10).unwrap();
    h.commit().unwrap();

    assert_eq!(list.get(&mut h, &1).unwrap(), Some(4));
    assert_eq!(list.get(&mut h, &2).unwrap(), Some(6));
    assert_eq!(list.get(&mut h, &8).unwrap(), Some(10));
    assert_eq!(list.keys(), vec![1, 2, 8]);
}

#[test]
fn test_remove_absent_key_changes_nothing() {
    let (manager, list, mut h) = common::setup::<u64, u64>();
    list.put(&mut h, 1, 1).unwrap();
    list.put(&mut h, 3, 3).unwrap();
    let version = manager.current_version();

    assert_eq!(list.remove(&mut h, &2).unwrap(), None);
    assert_eq!(list.remove(&mut h, &0).unwrap(), None);
    assert_eq!(list.remove(&mut h, &9).unwrap(), None);
    assert_eq!(list.snapshot(), vec![(1, 1), (3, 3)]);
    assert_eq!(manager.current_version(), version);
}

#[test]
fn test_put_if_absent() {
    let (_manager, list, mut h) = common::setup::<u64, String>();
    assert_eq!(list.put_if_absent(&mut h, 7, "a".to_string()).unwrap(), None);
    assert_eq!(
        list.put_if_absent(&mut h, 7, "b".to_string()).unwrap(),
        Some("a".to_string())
    );
    assert_eq!(list.get(&mut h, &7).unwrap(), Some("a".to_string()));

    h.transaction(|h| {
        assert_eq!(list.put_if_absent(h, 7, "c".to_string())?, Some("a".to_string()));
        assert_eq!(list.put_if_absent(h, 8, "d".to_string())?, None);
        assert_eq!(list.put_if_absent(h, 8, "e".to_string())?, Some("d".to_string()));
        Ok(())
    })
    .unwrap();
    assert_eq!(
        list.snapshot(),
        vec![(7, "a".to_string()), (8, "d".to_string())]
    );
}

#[test]
fn test_transactional_overwrite_returns_buffered_value() {
    let (_manager, list, mut h) = common::setup::<u64, u64>();
    list.put(&mut h, 1, 100).unwrap();
    let previous = h
        .transaction(|h| {
            let first = list.put(h, 1, 200)?;
            let second = list.put(h, 1, 300)?;
            Ok((first, second))
        })
        .unwrap();
    assert_eq!(previous, (Some(100), Some(200)));
    assert_eq!(list.get(&mut h, &1).unwrap(), Some(300));
}

#[test]
fn test_transaction_reads_its_own_removals() {
    let (_manager, list, mut h) = common::setup::<u64, u64>();
    for k in 1..=5 {
        list.put(&mut h, k, k * 10).unwrap();
    }
    h.transaction(|h| {
        assert_eq!(list.remove(h, &3)?, Some(30));
        assert_eq!(list.remove(h, &3)?, None);
        assert!(!list.contains_key(h, &3)?);
        assert!(list.contains_key(h, &4)?);
        assert_eq!(list.get(h, &4)?, Some(40));
        Ok(())
    })
    .unwrap();
    assert_eq!(list.keys(), vec![1, 2, 4, 5]);
}

#[test]
fn test_insert_and_remove_in_one_transaction_leaves_nothing() {
    let (_manager, list, mut h) = common::setup::<u64, u64>();
    list.put(&mut h, 10, 10).unwrap();
    h.transaction(|h| {
        list.put(h, 5, 5)?;
        list.put(h, 6, 6)?;
        assert_eq!(list.remove(h, &5)?, Some(5));
        Ok(())
    })
    .unwrap();
    assert_eq!(list.keys(), vec![6, 10]);
    assert_eq!(list.index_levels().stale_entries(), 0);
}

#[test]
fn test_lists_share_one_transaction() {
    let manager = Arc::new(TransactionManager::new());
    let from: TxList<u32, i64> = TxList::new(&manager);
    let to: TxList<u32, i64> = TxList::new(&manager);
    let mut h = manager.handle();
    from.put(&mut h, 1, 100).unwrap();

    h.transaction(|h| {
        let amount = from.remove(h, &1)?.unwrap_or(0);
        to.put(h, 1, amount)?;
        Ok(())
    })
    .unwrap();
    assert!(from.is_empty());
    assert_eq!(to.snapshot(), vec![(1, 100)]);
    assert!(Arc::ptr_eq(from.transaction_manager(), to.transaction_manager()));
}

#[test]
fn test_unindexed_list_behaves_the_same() {
    let manager = Arc::new(TransactionManager::new());
    let list = TxList::<u64, u64>::builder()
        .indexed(false)
        .build(&manager)
        .unwrap();
    let mut h = manager.handle();
    for k in (0..200).rev() {
        assert_eq!(list.put(&mut h, k, k).unwrap(), None);
    }
    for k in (0..200).step_by(2) {
        assert_eq!(list.remove(&mut h, &k).unwrap(), Some(k));
    }
    assert_eq!(list.keys(), (0..200).filter(|k| k % 2 == 1).collect::<Vec<_>>());
    assert_eq!(list.index_levels().height(), 0);
}

#[test]
fn test_values_without_clone_bound_on_keys() {
    #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Opaque(u32);

    let (_manager, list, mut h) = common::setup::<Opaque, Vec<u8>>();
    list.put(&mut h, Opaque(2), vec![2]).unwrap();
    list.put(&mut h, Opaque(1), vec![1]).unwrap();
    assert_eq!(list.get(&mut h, &Opaque(1)).unwrap(), Some(vec![1]));
    assert_eq!(list.len(), 2);
}

#[test]
fn test_misuse_is_reported() {
    let (_manager, list, mut h) = common::setup::<u64, u64>();
    assert_eq!(h.commit(), Err(TxError::NoActiveTransaction));
    assert_eq!(h.rollback(), Err(TxError::NoActiveTransaction));
    h.begin().unwrap();
    assert_eq!(h.begin(), Err(TxError::TransactionAlreadyActive));
    list.put(&mut h, 1, 1).unwrap();
    h.commit().unwrap();
    assert_eq!(list.get(&mut h, &1).unwrap(), Some(1));
}

#[derive(Debug, Clone)]
enum Op {
    Put(u16, u32),
    PutIfAbsent(u16, u32),
    Remove(u16),
    Get(u16),
    Contains(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = 0u16..64;
    prop_oneof![
        (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
        (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
        key.clone().prop_map(Op::Remove),
        key.clone().prop_map(Op::Get),
        key.prop_map(Op::Contains),
    ]
}

/// What `op` returns against the model, as an `Option<u32>`-or-bool pair.
fn apply_model(model: &mut BTreeMap<u16, u32>, op: &Op) -> (Option<u32>, bool) {
    match *op {
        Op::Put(k, v) => (model.insert(k, v), false),
        Op::PutIfAbsent(k, v) => match model.get(&k) {
            Some(present) => (Some(*present), false),
            None => {
                model.insert(k, v);
                (None, false)
            }
        },
        Op::Remove(k) => (model.remove(&k), false),
        Op::Get(k) => (model.get(&k).copied(), false),
        Op::Contains(k) => (None, model.contains_key(&k)),
    }
}

fn apply_list(
    list: &TxList<u16, u32>,
    h: &mut tdsl::Handle<u16, u32>,
    op: &Op,
) -> Result<(Option<u32>, bool), TxError> {
    Ok(match *op {
        Op::Put(k, v) => (list.put(h, k, v)?, false),
        Op::PutIfAbsent(k, v) => (list.put_if_absent(h, k, v)?, false),
        Op::Remove(k) => (list.remove(h, &k)?, false),
        Op::Get(k) => (list.get(h, &k)?, false),
        Op::Contains(k) => (None, list.contains_key(h, &k)?),
    })
}

proptest! {
    #[test]
    fn prop_singleton_matches_btreemap(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let (_manager, list, mut h) = common::setup::<u16, u32>();
        let mut model = BTreeMap::new();
        for op in &ops {
            let expected = apply_model(&mut model, op);
            let actual = apply_list(&list, &mut h, op).unwrap();
            prop_assert_eq!(actual, expected, "op {:?}", op);
        }
        let keys = list.keys();
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys out of order: {:?}", keys);
        prop_assert_eq!(list.snapshot(), model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_transactions_match_btreemap(
        batches in prop::collection::vec(prop::collection::vec(op_strategy(), 1..20), 1..20)
    ) {
        let (_manager, list, mut h) = common::setup::<u16, u32>();
        let mut model = BTreeMap::new();
        for batch in &batches {
            let actual = h
                .transaction(|h| batch.iter().map(|op| apply_list(&list, h, op)).collect::<Result<Vec<_>, _>>())
                .unwrap();
            let expected: Vec<_> = batch.iter().map(|op| apply_model(&mut model, op)).collect();
            prop_assert_eq!(actual, expected);
        }
        prop_assert_eq!(list.snapshot(), model.into_iter().collect::<Vec<_>>());
        prop_assert_eq!(list.index_levels().stale_entries(), 0);
    }
}
