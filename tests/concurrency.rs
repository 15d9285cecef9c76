//! Multi-threaded stress: many workers, one list, both paths at once.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tdsl::{TransactionManager, TxList};

const THREADS: usize = 8;

#[test]
fn test_disjoint_singleton_writers() {
    common::init_tracing();
    let manager = Arc::new(TransactionManager::new());
    let list: TxList<u64, u64> = TxList::new(&manager);
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let (manager, list, barrier) = (Arc::clone(&manager), list.clone(), Arc::clone(&barrier));
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                let mut h = manager.handle();
                let mut keys: Vec<u64> = (0..500).map(|i| t * 1_000 + i).collect();
                keys.shuffle(&mut rng);
                barrier.wait();
                for &k in &keys {
                    assert_eq!(list.put(&mut h, k, k * 2).unwrap(), None);
                }
                for &k in keys.iter().filter(|k| *k % 2 == 1) {
                    assert_eq!(list.remove(&mut h, &k).unwrap(), Some(k * 2));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let expected: Vec<u64> = (0..THREADS as u64)
        .flat_map(|t| (0..500).map(move |i| t * 1_000 + i))
        .filter(|k| k % 2 == 0)
        .collect();
    assert_eq!(list.keys(), expected);
    assert_eq!(list.len(), expected.len());
    let mut h = manager.handle();
    for &k in &expected {
        assert_eq!(list.get(&mut h, &k).unwrap(), Some(k * 2));
    }
}

#[test]
fn test_overlapping_singleton_writers() {
    common::init_tracing();
    let manager = Arc::new(TransactionManager::new());
    let list: TxList<u64, u64> = TxList::new(&manager);
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let (manager, list, barrier) = (Arc::clone(&manager), list.clone(), Arc::clone(&barrier));
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + t);
                let mut h = manager.handle();
                barrier.wait();
                for _ in 0..2_000 {
                    let k = rng.random_range(0..64u64);
                    match rng.random_range(0..4) {
                        0 => {
                            list.remove(&mut h, &k).unwrap();
                        }
                        1 => {
                            if let Some(v) = list.get(&mut h, &k).unwrap() {
                                assert!(v < THREADS as u64, "torn value {v}");
                            }
                        }
                        2 => {
                            list.put_if_absent(&mut h, k, t).unwrap();
                        }
                        _ => {
                            list.put(&mut h, k, t).unwrap();
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let entries = list.snapshot();
    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0), "keys out of order");
    assert!(entries.iter().all(|(k, v)| *k < 64 && *v < THREADS as u64));
    let mut h = manager.handle();
    for (k, v) in &entries {
        assert_eq!(list.get(&mut h, k).unwrap(), Some(*v));
    }
    for k in 0..64u64 {
        let present = entries.iter().any(|(key, _)| *key == k);
        assert_eq!(list.contains_key(&mut h, &k).unwrap(), present);
    }
}

#[test]
fn test_bank_transfers_conserve_the_total() {
    const ACCOUNTS: u32 = 16;
    const INITIAL: i64 = 1_000;
    common::init_tracing();
    let manager = Arc::new(TransactionManager::new());
    let accounts: TxList<u32, i64> = TxList::new(&manager);
    let seeded: Vec<_> = (0..ACCOUNTS).map(|a| (a, INITIAL)).collect();
    common::seed(&manager, &accounts, &seeded);
    let total = INITIAL * ACCOUNTS as i64;

    let tellers: Vec<_> = (0..4u64)
        .map(|t| {
            let (manager, accounts) = (Arc::clone(&manager), accounts.clone());
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                let mut h = manager.handle().with_retry_limit(10_000).unwrap();
                for _ in 0..300 {
                    let from = rng.random_range(0..ACCOUNTS);
                    let to = rng.random_range(0..ACCOUNTS);
                    let amount = rng.random_range(1..50i64);
                    if from == to {
                        continue;
                    }
                    h.transaction(|h| {
                        let a = accounts.get(h, &from)?.unwrap_or(0);
                        let b = accounts.get(h, &to)?.unwrap_or(0);
                        accounts.put(h, from, a - amount)?;
                        accounts.put(h, to, b + amount)?;
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    let auditor = {
        let (manager, accounts) = (Arc::clone(&manager), accounts.clone());
        thread::spawn(move || {
            let mut h = manager.handle().with_retry_limit(10_000).unwrap();
            for _ in 0..100 {
                let sum = h
                    .transaction(|h| {
                        let mut sum = 0;
                        for a in 0..ACCOUNTS {
                            sum += accounts.get(h, &a)?.unwrap_or(0);
                        }
                        Ok(sum)
                    })
                    .unwrap();
                assert_eq!(sum, total, "a committed snapshot saw money in flight");
            }
        })
    };

    for teller in tellers {
        teller.join().unwrap();
    }
    auditor.join().unwrap();

    let balances = accounts.snapshot();
    assert_eq!(balances.len(), ACCOUNTS as usize);
    assert_eq!(balances.iter().map(|(_, b)| b).sum::<i64>(), total);
}

#[test]
fn test_transactions_and_singletons_interleave() {
    const TOKENS: u64 = 32;
    common::init_tracing();
    let manager = Arc::new(TransactionManager::new());
    let list: TxList<u64, u64> = TxList::new(&manager);
    let seeded: Vec<_> = (0..TOKENS).map(|k| (k, 10)).collect();
    common::seed(&manager, &list, &seeded);

    // Keys below TOKENS move value around transactionally; keys from 1000
    // up are churned by singleton calls and restamp their neighbours.
    let movers: Vec<_> = (0..3u64)
        .map(|t| {
            let (manager, list) = (Arc::clone(&manager), list.clone());
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(7 + t);
                let mut h = manager.handle().with_retry_limit(10_000).unwrap();
                for _ in 0..300 {
                    let from = rng.random_range(0..TOKENS);
                    let to = (from + 1 + rng.random_range(0..TOKENS - 1)) % TOKENS;
                    h.transaction(|h| {
                        let a = list.get(h, &from)?.unwrap_or(0);
                        if a == 0 {
                            return Ok(());
                        }
                        let b = list.get(h, &to)?.unwrap_or(0);
                        list.put(h, from, a - 1)?;
                        list.put(h, to, b + 1)?;
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    let churners: Vec<_> = (0..3u64)
        .map(|t| {
            let (manager, list) = (Arc::clone(&manager), list.clone());
            thread::spawn(move || {
                let mut h = manager.handle();
                let base = 1_000 + t * 100;
                for round in 0..5 {
                    for k in base..base + 100 {
                        list.put(&mut h, k, round).unwrap();
                    }
                    for k in (base..base + 100).filter(|k| k % 3 == 0) {
                        list.remove(&mut h, &k).unwrap();
                    }
                }
            })
        })
        .collect();

    for worker in movers.into_iter().chain(churners) {
        worker.join().unwrap();
    }

    let entries = list.snapshot();
    let moved: u64 = entries.iter().filter(|(k, _)| *k < TOKENS).map(|(_, v)| v).sum();
    assert_eq!(moved, TOKENS * 10);

    let churned: BTreeSet<u64> = entries.iter().map(|(k, _)| *k).filter(|k| *k >= 1_000).collect();
    let expected: BTreeSet<u64> = (1_000..1_300).filter(|k| k % 3 != 0).collect();
    assert_eq!(churned, expected);
    assert!(entries
        .iter()
        .filter(|(k, _)| *k >= 1_000)
        .all(|(_, v)| *v == 4));
}

#[test]
fn test_handles_on_many_lists_across_threads() {
    common::init_tracing();
    let manager = Arc::new(TransactionManager::new());
    let lists: Vec<TxList<u32, u32>> = (0..4).map(|_| TxList::new(&manager)).collect();

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let (manager, lists) = (Arc::clone(&manager), lists.clone());
            thread::spawn(move || {
                let mut h = manager.handle().with_retry_limit(10_000).unwrap();
                for i in 0..100 {
                    // The same key goes into every list atomically.
                    h.transaction(|h| {
                        for list in &lists {
                            list.put(h, t * 1_000 + i, i)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let first = lists[0].snapshot();
    assert_eq!(first.len(), 400);
    for list in &lists[1..] {
        assert_eq!(list.snapshot(), first);
    }
}
