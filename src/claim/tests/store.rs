// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Concurrency and property tests for the claim store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use sdb_claim::{
    ClaimMetrics, ClaimStore, ClaimStoreConfig, Retention, Ticket, WithdrawalCode,
};
use sdb_ore::metrics::MetricsRegistry;
use sdb_ore::now::{ManualClock, SYSTEM_TIME};

fn new_store<T>(now: sdb_ore::now::NowFn) -> ClaimStore<T> {
    ClaimStore::new(
        &ClaimStoreConfig::default(),
        now,
        ClaimMetrics::register_into(&MetricsRegistry::new()),
    )
}

#[sdb_ore::test]
fn concurrent_reservations_are_single_flight() {
    const THREADS: usize = 16;
    let store: Arc<ClaimStore<u64>> = Arc::new(new_store(SYSTEM_TIME.clone()));
    let barrier = Barrier::new(THREADS);

    let reservations: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    store.reserve("job:7", Retention::CacheIndefinitely)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect()
    });

    let tickets: BTreeSet<_> = reservations.iter().map(|r| r.ticket).collect();
    assert_eq!(tickets.len(), 1);
    assert_eq!(reservations.iter().filter(|r| r.is_new).count(), 1);
    assert_eq!(store.admin_info().total, 1);
}

#[sdb_ore::test]
fn unrelated_keys_reserve_concurrently() {
    const THREADS: u64 = 8;
    let store: Arc<ClaimStore<u64>> = Arc::new(new_store(SYSTEM_TIME.clone()));
    thread::scope(|s| {
        for i in 0..THREADS {
            let store = &store;
            s.spawn(move || {
                for j in 0..100 {
                    let key = format!("job:{i}:{j}");
                    let reservation = store.reserve(&key, Retention::CacheIndefinitely);
                    assert!(reservation.is_new);
                    assert!(store.deposit(reservation.ticket, i * 1000 + j));
                    let w = store.withdraw(reservation.ticket, true);
                    assert_eq!(w.contents, Some(i * 1000 + j));
                }
            });
        }
    });
    let info = store.admin_info();
    assert_eq!(info.total, THREADS * 100);
    assert_eq!(info.active, 0);
    assert_eq!(info.incinerated, THREADS * 100);
}

#[sdb_ore::test]
fn concurrent_closing_withdrawals_deliver_once() {
    const THREADS: usize = 8;
    let store: Arc<ClaimStore<&'static str>> = Arc::new(new_store(SYSTEM_TIME.clone()));
    let ticket = store.reserve("k", Retention::CacheIndefinitely).ticket;
    assert!(store.deposit(ticket, "v"));
    let barrier = Barrier::new(THREADS);

    let codes: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    store.withdraw(ticket, true).code
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect()
    });
    assert_eq!(
        codes
            .iter()
            .filter(|c| **c == WithdrawalCode::Retrieved)
            .count(),
        1
    );
    assert!(
        codes
            .iter()
            .all(|c| matches!(c, WithdrawalCode::Retrieved | WithdrawalCode::Unreserved))
    );
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(usize, i64),
    Deposit(usize),
    Fail(usize),
    Withdraw(usize, bool),
    Advance(u64),
    CleanHouse,
    IncinerateOlder(u64),
    Incinerate(usize),
}

const KEYS: [&str; 3] = ["a", "b", "c"];

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..KEYS.len(), -200i64..200).prop_map(|(k, r)| Op::Reserve(k, r)),
        (0..KEYS.len()).prop_map(Op::Deposit),
        (0..KEYS.len()).prop_map(Op::Fail),
        (0..8usize, any::<bool>()).prop_map(|(t, c)| Op::Withdraw(t, c)),
        (0..150u64).prop_map(Op::Advance),
        Just(Op::CleanHouse),
        (0..300u64).prop_map(Op::IncinerateOlder),
        (0..KEYS.len()).prop_map(Op::Incinerate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[sdb_ore::test]
    fn withdrawal_outcomes_are_monotonic(ops in proptest::collection::vec(op(), 1..64)) {
        let clock = ManualClock::new(1_000);
        let store: ClaimStore<u64> = new_store(clock.now_fn());
        let mut issued: Vec<Ticket> = Vec::new();
        // Tickets for which no later withdrawal may return contents.
        let mut finished: BTreeSet<Ticket> = BTreeSet::new();
        let mut retrieved: BTreeMap<Ticket, u64> = BTreeMap::new();
        let mut next_value = 0;

        for op in ops {
            match op {
                Op::Reserve(k, millis) => {
                    let reservation = store.reserve(KEYS[k], Retention::from_millis(millis));
                    if reservation.is_new {
                        prop_assert!(!issued.contains(&reservation.ticket));
                        issued.push(reservation.ticket);
                    } else {
                        prop_assert!(issued.contains(&reservation.ticket));
                    }
                }
                Op::Deposit(k) | Op::Fail(k) => {
                    if let Some(ticket) = store.lookup_key(KEYS[k]) {
                        let accepted = if matches!(op, Op::Deposit(_)) {
                            next_value += 1;
                            store.deposit(ticket, next_value)
                        } else {
                            store.deposit_failure(ticket, "failed")
                        };
                        if accepted {
                            prop_assert!(!finished.contains(&ticket));
                        }
                    }
                }
                Op::Withdraw(i, close_box) => {
                    let Some(&ticket) = issued.get(i) else { continue };
                    let w = store.withdraw(ticket, close_box);
                    if finished.contains(&ticket) {
                        prop_assert!(
                            matches!(w.code, WithdrawalCode::Expired | WithdrawalCode::Unreserved),
                            "{ticket} resurrected as {:?}", w.code
                        );
                    }
                    match w.code {
                        WithdrawalCode::Retrieved => {
                            let value = w.contents.expect("retrieved carries contents");
                            // Contents never change once deposited.
                            let first = *retrieved.entry(ticket).or_insert(value);
                            prop_assert_eq!(first, value);
                            if close_box {
                                finished.insert(ticket);
                            }
                        }
                        WithdrawalCode::Failed if close_box => {
                            finished.insert(ticket);
                        }
                        WithdrawalCode::Expired | WithdrawalCode::Unreserved => {
                            finished.insert(ticket);
                        }
                        _ => {}
                    }
                }
                Op::Advance(millis) => clock.advance(Duration::from_millis(millis)),
                Op::CleanHouse => {
                    store.clean_house();
                }
                Op::IncinerateOlder(millis) => {
                    store.incinerate_older(Duration::from_millis(millis));
                }
                Op::Incinerate(k) => {
                    store.incinerate(KEYS[k]);
                }
            }

            // The key index only points at live drawers.
            for key in KEYS {
                if let Some(ticket) = store.lookup_key(key) {
                    prop_assert!(store.is_reserved(ticket));
                }
            }
            let info = store.admin_info();
            prop_assert_eq!(info.active, info.filled + info.filling);
            prop_assert_eq!(info.total, info.active + info.incinerated);
        }
    }
}
