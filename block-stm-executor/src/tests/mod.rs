//! Block-level tests: whole blocks through the parallel executor, checked against
//! the sequential one.


use crate::{
    errors::BlockStmError,
    executor::{ExecutorConfig, ParallelExecutor},
    mvview::MVView,
    scheduler::{Scheduler, Task},
    store::{KVStore, MultiMemDB, MultiStore, MultiView},
    types::{MultiLocations, ObjectValue, StoreKey, StoreSlots, Value},
};
use claims::{assert_matches, assert_ok};
use mock_block::{
    arb_base, arb_block, base_storage, counter, key, store_keys, MockBlock, Observation, Op,
};
use proptest::prelude::*;
use rand::Rng;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

fn set(store: usize, k: &str, v: &str) -> Op {
    Op::Set {
        store,
        key: key(k),
        value: v.as_bytes().to_vec(),
    }
}

fn scan(pairs: &[(&str, &str)]) -> Observation {
    Observation::Scan(
        pairs
            .iter()
            .map(|(k, v)| (key(k), v.as_bytes().to_vec()))
            .collect(),
    )
}

fn iterate_all(store: usize) -> Op {
    Op::Iterate {
        store,
        start: None,
        end: None,
        ascending: true,
        limit: None,
    }
}

#[test]
fn test_independent_writes() {
    let block = MockBlock::new(
        (0..3)
            .map(|i| vec![set(0, &format!("k{i}"), &format!("v{i}"))])
            .collect(),
    );
    for num_threads in [1, 2, 4] {
        let (outcome, summary) = block.run_parallel(base_storage(&[]), num_threads, None).unwrap();
        assert_eq!(summary.executed_txns, 3);
        assert_eq!(summary.written_bytes, 6);

        let store = outcome.storage.get_kv_store(&store_keys()[0]).unwrap();
        let entries: Vec<_> = store.iterator(None, None).collect();
        assert_eq!(
            entries,
            vec![
                (key("k0"), b"v0".to_vec()),
                (key("k1"), b"v1".to_vec()),
                (key("k2"), b"v2".to_vec()),
            ]
        );
    }
}

#[test]
fn test_hot_key_counter() {
    let block = MockBlock::new(
        (0..100)
            .map(|_| {
                vec![Op::Increment {
                    store: 1,
                    key: key("c"),
                }]
            })
            .collect(),
    );
    block.assert_matches_sequential(&base_storage(&[]), 4);

    let (outcome, _) = block.run_parallel(base_storage(&[]), 8, None).unwrap();
    let store = outcome.storage.get_kv_store(&store_keys()[1]).unwrap();
    assert_eq!(store.get(b"c"), Some(counter(100)));
}

#[test]
fn test_hot_key_conflicts_force_reexecution() {
    // Each incarnation holds its read of `c` while sleeping, so concurrent ones conflict.
    let block = MockBlock::new(
        (0..8)
            .map(|_| {
                vec![
                    Op::Increment {
                        store: 1,
                        key: key("c"),
                    },
                    Op::Sleep(Duration::from_millis(20)),
                ]
            })
            .collect(),
    );
    let (outcome, summary) = block.run_parallel(base_storage(&[]), 4, None).unwrap();
    assert!(summary.executed_txns > 8);

    let store = outcome.storage.get_kv_store(&store_keys()[1]).unwrap();
    assert_eq!(store.get(b"c"), Some(counter(8)));
}

#[test]
fn test_raw_chain_with_seeded_estimate() {
    let block = MockBlock::new(vec![
        vec![set(0, "a", "1"), set(0, "b", "1"), set(0, "c", "1")],
        vec![set(0, "a", "2"), set(0, "b", "2"), set(0, "c", "2")],
        vec![set(0, "a", "3"), set(0, "b", "3")],
        vec![iterate_all(0)],
    ]);
    let mut estimates = vec![MultiLocations::new(); 4];
    estimates[0] = BTreeMap::from([(0, vec![key("a")])]);

    let (outcome, _) = block.run_parallel(base_storage(&[]), 4, Some(estimates)).unwrap();
    assert_eq!(
        outcome.receipts[3],
        vec![scan(&[("a", "3"), ("b", "3"), ("c", "2")])]
    );
}

#[test]
fn test_delete_visibility() {
    let block = MockBlock::new(vec![
        vec![set(0, "a", "1")],
        vec![Op::Delete {
            store: 0,
            key: key("a"),
        }],
        vec![
            Op::Get {
                store: 0,
                key: key("a"),
            },
            Op::Has {
                store: 0,
                key: key("a"),
            },
        ],
    ]);
    let base = base_storage(&[(0, "a", "base")]);
    block.assert_matches_sequential(&base, 4);

    let (outcome, _) = block.run_parallel(base, 4, None).unwrap();
    assert_eq!(
        outcome.receipts[2],
        vec![
            Observation::Read(key("a"), None),
            Observation::Has(key("a"), false)
        ]
    );
    assert!(!outcome.storage.get_kv_store(&store_keys()[0]).unwrap().has(b"a"));
}

#[test]
fn test_cancel_during_estimate_wait() {
    let block = MockBlock::new(vec![
        vec![Op::Sleep(Duration::from_millis(200)), set(0, "k", "1")],
        vec![Op::Get {
            store: 0,
            key: key("k"),
        }],
    ]);
    let estimates = vec![BTreeMap::from([(0, vec![key("k")])]), MultiLocations::new()];
    let base = base_storage(&[]);

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let result = block.run_parallel_with_cancel(base, 2, Some(estimates), &cancel);
    canceller.join().unwrap();

    assert_matches!(result, Err(BlockStmError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_iterator_observes_later_writes() {
    let block = MockBlock::new(vec![
        vec![set(0, "a", "1"), set(0, "b", "1"), set(0, "c", "1")],
        vec![set(0, "b", "2"), set(0, "c", "2"), set(0, "d", "2")],
        vec![iterate_all(0)],
    ]);
    for num_threads in [1, 3] {
        let (outcome, _) = block.run_parallel(base_storage(&[]), num_threads, None).unwrap();
        assert_eq!(
            outcome.receipts[2],
            vec![scan(&[("a", "1"), ("b", "2"), ("c", "2"), ("d", "2")])]
        );
    }
}

#[test]
fn test_dropped_write_is_not_visible() {
    // Txn 1 writes `x` only while it cannot see txn 0's flag. Its final incarnation
    // must not leave the speculative `x` behind.
    let block = MockBlock::new(vec![
        vec![Op::Sleep(Duration::from_millis(20)), set(0, "flag", "1")],
        vec![Op::SetIfAbsent {
            guard: (0, key("flag")),
            store: 1,
            key: key("x"),
            value: b"1".to_vec(),
        }],
        vec![Op::Get {
            store: 1,
            key: key("x"),
        }],
    ]);
    block.assert_matches_sequential(&base_storage(&[]), 3);
    let (outcome, _) = block.run_parallel(base_storage(&[]), 3, None).unwrap();
    assert_eq!(outcome.receipts[2], vec![Observation::Read(key("x"), None)]);
}

#[test]
fn test_partial_and_reverse_iteration() {
    let block = MockBlock::new(vec![
        vec![set(0, "b", "0")],
        vec![Op::Iterate {
            store: 0,
            start: None,
            end: None,
            ascending: true,
            limit: Some(2),
        }],
        vec![set(0, "a", "2"), Op::Delete {
            store: 0,
            key: key("c"),
        }],
        vec![Op::Iterate {
            store: 0,
            start: Some(key("a")),
            end: Some(key("d")),
            ascending: false,
            limit: None,
        }],
    ]);
    let base = base_storage(&[(0, "a", "base"), (0, "c", "base"), (0, "d", "base")]);
    for num_threads in [1, 2, 4] {
        block.assert_matches_sequential(&base, num_threads);
    }
}

#[test]
fn test_mixed_value_stores() {
    let bytes = StoreKey::new("bytes");
    let objects = StoreKey::new("objects");
    let stores = StoreSlots::new([bytes.clone(), objects.clone()]);
    let mut storage = MultiMemDB::<Value>::new([bytes.clone(), objects.clone()]);
    storage
        .get_kv_store_mut(&objects)
        .unwrap()
        .set(b"counter", Value::Object(ObjectValue::new(0u64, 8)));

    let summary = ParallelExecutor::new(ExecutorConfig::with_threads(4)).execute_block(
        &CancellationToken::new(),
        20,
        &stores,
        &mut storage,
        None,
        |txn_idx, view: &MVView<'_, Value, _>| {
            let mut counters = view.store(&objects).unwrap();
            let current = counters
                .get(b"counter")
                .and_then(|value| value.as_object::<u64>().copied())
                .unwrap_or_default();
            counters.set(b"counter", Value::Object(ObjectValue::new(current + 1, 8)));

            let mut log = view.store(&bytes).unwrap();
            log.set(format!("txn{txn_idx:02}").as_bytes(), Value::Bytes(counter(current)));
        },
    );
    assert_ok!(summary);

    let counter_value = storage
        .get_kv_store(&objects)
        .unwrap()
        .get(b"counter")
        .unwrap();
    assert_eq!(counter_value.as_object::<u64>(), Some(&20));

    let log: Vec<_> = storage
        .get_kv_store(&bytes)
        .unwrap()
        .iterator(None, None)
        .map(|(_, value)| value.as_bytes().unwrap().to_vec())
        .collect();
    assert_eq!(log, (0..20).map(counter).collect::<Vec<_>>());
}

#[test]
fn test_smallest_dependency_cycle_terminates() {
    // Two transactions estimated to write each other's inputs, with random delays so
    // suspensions and resumptions interleave differently on every round.
    let key_a = key("a");
    let key_b = key("b");
    for _ in 0..50 {
        let (tx, rx) = mpsc::channel();
        let (key_a, key_b) = (key_a.clone(), key_b.clone());
        thread::spawn(move || {
            let stores = StoreSlots::new(store_keys());
            let mut storage = base_storage(&[]);
            let estimates = vec![
                BTreeMap::from([(0, vec![key_a.clone()])]),
                BTreeMap::from([(0, vec![key_b.clone()])]),
            ];
            let result = ParallelExecutor::new(ExecutorConfig::with_threads(2)).execute_block(
                &CancellationToken::new(),
                2,
                &stores,
                &mut storage,
                Some(estimates),
                |txn_idx, view: &MVView<'_, Vec<u8>, _>| {
                    let pause = rand::thread_rng().gen_range(0..200);
                    thread::sleep(Duration::from_micros(pause));
                    let mut store = view.store(&store_keys()[0]).unwrap();
                    let (read, write) = if txn_idx == 0 {
                        (&key_b, &key_a)
                    } else {
                        (&key_a, &key_b)
                    };
                    let seen = store.get(read).unwrap_or_default();
                    store.set(write, [seen, vec![txn_idx as u8]].concat());
                },
            );
            let _ = tx.send(result.map(|_| storage));
        });

        let storage = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("block did not finish")
            .unwrap();
        let store = storage.get_kv_store(&store_keys()[0]).unwrap();
        assert_eq!(store.get(b"a"), Some(vec![0]));
        assert_eq!(store.get(b"b"), Some(vec![0, 1]));
    }
}

#[test]
fn test_commit_index_is_monotonic() {
    const BLOCK_SIZE: usize = 64;
    let scheduler = Scheduler::new(BLOCK_SIZE);
    let finished = AtomicBool::new(false);

    thread::scope(|scope| {
        let observer = scope.spawn(|| {
            let mut last = 0;
            while !finished.load(Ordering::Acquire) {
                // `done` is published under the commit lock, before the index is
                // readable again.
                let done = scheduler.is_done();
                let committed = scheduler.committed_idx();
                assert!(committed >= last);
                assert!(committed as usize <= BLOCK_SIZE);
                assert!(!done || committed as usize == BLOCK_SIZE);
                if committed as usize == BLOCK_SIZE {
                    assert!(scheduler.is_done());
                }
                last = committed;
            }
        });

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let scheduler = &scheduler;
                scope.spawn(move || {
                    let mut task = Task::Wait;
                    let mut rng = rand::thread_rng();
                    loop {
                        task = match task {
                            Task::Execute(version) => {
                                scheduler.finish_execution(version, rng.gen_bool(0.3))
                            }
                            Task::Validate(version, wave) => {
                                // Fail the first incarnation of every third transaction.
                                let abort = version.incarnation == 0
                                    && (version.index + worker) % 3 == 0
                                    && scheduler.try_validation_abort(version);
                                scheduler.finish_validation(version, wave, abort, !abort)
                            }
                            Task::Wait => {
                                scheduler.process_commits();
                                scheduler.next_task()
                            }
                            Task::Done => break,
                        };
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        finished.store(true, Ordering::Release);
        observer.join().unwrap();
    });

    assert!(scheduler.is_done());
    assert_eq!(scheduler.committed_idx() as usize, BLOCK_SIZE);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_random_blocks_match_sequential(
        block in arb_block(24),
        base in arb_base(),
        num_threads in 1..5usize,
    ) {
        let expected = block.run_sequential(base.clone());
        let (actual, summary) = block.run_parallel(base, num_threads, None).unwrap();
        prop_assert_eq!(actual.storage, expected.storage);
        prop_assert_eq!(actual.receipts, expected.receipts);
        prop_assert!(summary.executed_txns >= block.len());
    }
}
