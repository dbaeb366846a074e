// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The claim store.
//!
//! The store keeps two sharded indexes: dedup key to ticket, and ticket to
//! drawer slot. A slot is either a live drawer or the tombstone of an
//! incinerated one. Locks are always taken key shard first, drawer shard
//! second; operations that discover a dead drawer while holding only the
//! drawer shard release it before unlinking the key.

use std::collections::BTreeMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sdb_ore::cast::CastFrom;
use sdb_ore::now::{EpochMillis, NowFn, millis_between};
use sdb_ore::task::{AbortOnDropHandle, JoinHandleExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::config::ClaimStoreConfig;
use crate::metrics::ClaimMetrics;
use crate::progress::{ProgressSnapshot, UnitCounter};
use crate::withdrawal::{Retention, Ticket, Withdrawal, WithdrawalCode};

/// Why a drawer was incinerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncinerationReason {
    /// The drawer was not filled in time, or its cache period ran out.
    Expired,
    /// The drawer was closed by the withdrawal that retrieved it.
    Closed,
    /// The drawer was removed administratively.
    Evicted,
}

impl IncinerationReason {
    /// A short, stable name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            IncinerationReason::Expired => "expired",
            IncinerationReason::Closed => "closed",
            IncinerationReason::Evicted => "evicted",
        }
    }
}

/// The result of [`ClaimStore::reserve`].
#[derive(Debug, Clone)]
pub struct Reservation {
    /// The ticket for the key.
    pub ticket: Ticket,
    /// Whether this call created the drawer. Only the creator is expected to
    /// run the computation that fills it.
    pub is_new: bool,
    /// The progress counter of a newly created drawer, for its worker.
    pub counter: Option<Arc<UnitCounter>>,
}

/// Read-only counts describing a store, for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdminInfo {
    /// Drawers ever reserved.
    pub total: u64,
    /// Drawers currently filling or filled.
    pub active: u64,
    /// Drawers currently filled.
    pub filled: u64,
    /// Drawers currently filling.
    pub filling: u64,
    /// Drawers incinerated so far.
    pub incinerated: u64,
}

#[derive(Debug)]
enum DrawerState<T> {
    Filling(Arc<UnitCounter>),
    Filled {
        deposit: Result<T, String>,
        filled_at: EpochMillis,
        progress: ProgressSnapshot,
    },
}

#[derive(Debug)]
struct Drawer<T> {
    key: String,
    retention: Retention,
    reserved_at: EpochMillis,
    state: DrawerState<T>,
}

impl<T> Drawer<T> {
    fn filled_at(&self) -> Option<EpochMillis> {
        match &self.state {
            DrawerState::Filling(_) => None,
            DrawerState::Filled { filled_at, .. } => Some(*filled_at),
        }
    }

    fn progress(&self) -> ProgressSnapshot {
        match &self.state {
            DrawerState::Filling(counter) => counter.snapshot(),
            DrawerState::Filled { progress, .. } => *progress,
        }
    }

    /// Whether the drawer's retention ran out at or before `now`.
    fn has_expired(&self, now: EpochMillis) -> bool {
        let deadline = match &self.state {
            DrawerState::Filling(_) => self.retention.fill_deadline(self.reserved_at),
            DrawerState::Filled { filled_at, .. } => self.retention.evict_deadline(*filled_at),
        };
        deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Time since the fill for filled drawers, or since the reservation for
    /// filling ones.
    fn age(&self, now: EpochMillis) -> Duration {
        millis_between(self.filled_at().unwrap_or(self.reserved_at), now)
    }
}

#[derive(Debug)]
struct Tombstone {
    reason: IncinerationReason,
    progress: ProgressSnapshot,
    reserved_at: EpochMillis,
    filled_at: Option<EpochMillis>,
    incinerated_at: EpochMillis,
}

#[derive(Debug)]
enum Slot<T> {
    Live(Drawer<T>),
    Tombstone(Tombstone),
}

impl<T> Slot<T> {
    /// Replaces a live drawer with its tombstone, returning the drawer.
    fn entomb(&mut self, reason: IncinerationReason, now: EpochMillis) -> Option<Drawer<T>> {
        let Slot::Live(drawer) = self else {
            return None;
        };
        let tombstone = Tombstone {
            reason,
            progress: drawer.progress(),
            reserved_at: drawer.reserved_at,
            filled_at: drawer.filled_at(),
            incinerated_at: now,
        };
        match std::mem::replace(self, Slot::Tombstone(tombstone)) {
            Slot::Live(drawer) => Some(drawer),
            Slot::Tombstone(_) => None,
        }
    }
}

type KeyShard = BTreeMap<String, Ticket>;
type DrawerShard<T> = BTreeMap<Ticket, Slot<T>>;

/// A process-local claim-check store.
///
/// Callers reserve a drawer under a dedup key and get back a ticket; a
/// worker later deposits the result of its computation into the drawer; and
/// the ticket holder withdraws it. Concurrent reservations of the same key
/// share one drawer.
///
/// The store is meant to be constructed once per node and shared through an
/// [`Arc`].
#[derive(Debug)]
pub struct ClaimStore<T> {
    now: NowFn,
    tombstone_ttl: Duration,
    next_ticket: AtomicU64,
    incinerated: AtomicU64,
    hasher: RandomState,
    keys: Box<[Mutex<KeyShard>]>,
    drawers: Box<[Mutex<DrawerShard<T>>]>,
    metrics: ClaimMetrics,
}

impl<T> ClaimStore<T> {
    /// Creates an empty store.
    pub fn new(config: &ClaimStoreConfig, now: NowFn, metrics: ClaimMetrics) -> ClaimStore<T> {
        let shards = config.claim_store_shards.get();
        ClaimStore {
            now,
            tombstone_ttl: config.claim_store_tombstone_ttl,
            next_ticket: AtomicU64::new(1),
            incinerated: AtomicU64::new(0),
            hasher: RandomState::new(),
            keys: (0..shards).map(|_| Mutex::new(BTreeMap::new())).collect(),
            drawers: (0..shards).map(|_| Mutex::new(BTreeMap::new())).collect(),
            metrics,
        }
    }

    /// The clock the store reads.
    pub fn now_fn(&self) -> &NowFn {
        &self.now
    }

    fn lock_keys(&self, key: &str) -> MutexGuard<'_, KeyShard> {
        let shards = u64::cast_from(self.keys.len());
        let idx = usize::cast_from(self.hasher.hash_one(key) % shards);
        self.keys[idx].lock().expect("lock poisoned")
    }

    fn lock_drawers(&self, ticket: Ticket) -> MutexGuard<'_, DrawerShard<T>> {
        let shards = u64::cast_from(self.drawers.len());
        let idx = usize::cast_from(ticket.0 % shards);
        self.drawers[idx].lock().expect("lock poisoned")
    }

    /// Incinerates the drawer in `slot`, if it is live, and returns the key
    /// it was indexed under. The caller unlinks the key.
    fn incinerate_slot(
        &self,
        ticket: Ticket,
        slot: &mut Slot<T>,
        reason: IncinerationReason,
        now: EpochMillis,
    ) -> Option<String> {
        let drawer = slot.entomb(reason, now)?;
        if let DrawerState::Filling(counter) = &drawer.state {
            // Tell the worker its result is no longer wanted.
            counter.kill();
        }
        self.incinerated.fetch_add(1, Ordering::Relaxed);
        self.metrics.incinerated(reason);
        trace!(%ticket, key = %drawer.key, reason = reason.as_str(), "incinerated drawer");
        Some(drawer.key)
    }

    /// Removes `key` from the index if it still refers to `ticket`.
    fn unlink_key(&self, key: &str, ticket: Ticket) {
        let mut keys = self.lock_keys(key);
        if keys.get(key) == Some(&ticket) {
            keys.remove(key);
        }
    }

    /// Returns the ticket for `key`, creating a filling drawer if the key has
    /// no live drawer.
    ///
    /// A drawer whose retention ran out is incinerated and replaced. Calls
    /// for the same key are serialized on the key's shard, so concurrent
    /// callers all observe one drawer.
    pub fn reserve(&self, key: &str, retention: Retention) -> Reservation {
        let now = self.now.now();
        let mut keys = self.lock_keys(key);
        if let Some(ticket) = keys.get(key).copied() {
            let mut drawers = self.lock_drawers(ticket);
            if let Some(slot) = drawers.get_mut(&ticket) {
                if matches!(&*slot, Slot::Live(drawer) if !drawer.has_expired(now)) {
                    self.metrics.reserved(false);
                    return Reservation {
                        ticket,
                        is_new: false,
                        counter: None,
                    };
                }
                self.incinerate_slot(ticket, slot, IncinerationReason::Expired, now);
            }
            keys.remove(key);
        }

        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::AcqRel));
        let counter = Arc::new(UnitCounter::new(self.now.clone()));
        let drawer = Drawer {
            key: key.to_owned(),
            retention,
            reserved_at: now,
            state: DrawerState::Filling(Arc::clone(&counter)),
        };
        self.lock_drawers(ticket).insert(ticket, Slot::Live(drawer));
        keys.insert(key.to_owned(), ticket);
        self.metrics.reserved(true);
        debug!(%ticket, key, ?retention, "reserved drawer");
        Reservation {
            ticket,
            is_new: true,
            counter: Some(counter),
        }
    }

    /// Whether a live drawer, filling or filled, exists for `ticket`.
    pub fn is_reserved(&self, ticket: Ticket) -> bool {
        matches!(self.lock_drawers(ticket).get(&ticket), Some(Slot::Live(_)))
    }

    /// Withdraws from the drawer for `ticket`.
    ///
    /// A filled drawer yields its contents (or its failure) and, with
    /// `close_box`, is incinerated by the same call, so at most one closing
    /// withdrawal ever succeeds. A drawer whose retention ran out is
    /// incinerated and reported as expired; so is every later withdrawal of
    /// the ticket, until its tombstone is purged.
    pub fn withdraw(&self, ticket: Ticket, close_box: bool) -> Withdrawal<T>
    where
        T: Clone,
    {
        let now = self.now.now();
        let mut unlink = None;
        let withdrawal = {
            let mut drawers = self.lock_drawers(ticket);
            let (withdrawal, close) = match drawers.get(&ticket) {
                None => (
                    Withdrawal::empty(ticket, WithdrawalCode::Unreserved, now),
                    None,
                ),
                Some(Slot::Tombstone(tombstone)) => {
                    let code = match tombstone.reason {
                        IncinerationReason::Expired => WithdrawalCode::Expired,
                        IncinerationReason::Closed | IncinerationReason::Evicted => {
                            WithdrawalCode::Unreserved
                        }
                    };
                    let withdrawal = Withdrawal {
                        reserved_at: Some(tombstone.reserved_at),
                        filled_at: tombstone.filled_at,
                        ..Withdrawal::empty(ticket, code, now)
                    };
                    (withdrawal, None)
                }
                Some(Slot::Live(drawer)) => {
                    let mut withdrawal = Withdrawal {
                        reserved_at: Some(drawer.reserved_at),
                        filled_at: drawer.filled_at(),
                        ..Withdrawal::empty(ticket, WithdrawalCode::NoDeposit, now)
                    };
                    let close = match &drawer.state {
                        _ if drawer.has_expired(now) => {
                            withdrawal.code = WithdrawalCode::Expired;
                            Some(IncinerationReason::Expired)
                        }
                        DrawerState::Filling(_) => None,
                        DrawerState::Filled { deposit, .. } => {
                            match deposit {
                                Ok(contents) => {
                                    withdrawal.code = WithdrawalCode::Retrieved;
                                    withdrawal.contents = Some(contents.clone());
                                }
                                Err(message) => {
                                    withdrawal.code = WithdrawalCode::Failed;
                                    withdrawal.failure = Some(message.clone());
                                }
                            }
                            close_box.then_some(IncinerationReason::Closed)
                        }
                    };
                    (withdrawal, close)
                }
            };
            if let Some(reason) = close
                && let Some(slot) = drawers.get_mut(&ticket)
            {
                unlink = self.incinerate_slot(ticket, slot, reason, now);
            }
            withdrawal
        };
        if let Some(key) = unlink {
            self.unlink_key(&key, ticket);
        }
        self.metrics.withdrew(withdrawal.code);
        trace!(%ticket, code = %withdrawal.code, close_box, "withdrawal");
        withdrawal
    }

    /// Deposits `contents` into the filling drawer for `ticket`.
    ///
    /// Returns whether the deposit was accepted. Depositing into a drawer
    /// that expired or was incinerated is discarded: the worker lost a race
    /// with the drawer's retention, which is not an error.
    pub fn deposit(&self, ticket: Ticket, contents: T) -> bool {
        self.fill(ticket, Ok(contents))
    }

    /// Records that the computation for `ticket` failed. Withdrawals then
    /// report [`WithdrawalCode::Failed`] with `message`.
    ///
    /// Returns whether the failure was recorded, as for
    /// [`ClaimStore::deposit`].
    pub fn deposit_failure(&self, ticket: Ticket, message: impl Into<String>) -> bool {
        self.fill(ticket, Err(message.into()))
    }

    fn fill(&self, ticket: Ticket, deposit: Result<T, String>) -> bool {
        let now = self.now.now();
        let outcome = if deposit.is_ok() { "filled" } else { "failed" };
        let mut unlink = None;
        let accepted = {
            let mut drawers = self.lock_drawers(ticket);
            let mut expired = false;
            let accepted = match drawers.get_mut(&ticket) {
                Some(Slot::Live(drawer)) if drawer.has_expired(now) => {
                    expired = true;
                    false
                }
                Some(Slot::Live(drawer)) => match &drawer.state {
                    DrawerState::Filling(counter) => {
                        counter.mark_end();
                        let progress = counter.snapshot();
                        drawer.state = DrawerState::Filled {
                            deposit,
                            filled_at: now,
                            progress,
                        };
                        true
                    }
                    DrawerState::Filled { .. } => false,
                },
                Some(Slot::Tombstone(_)) | None => false,
            };
            if expired && let Some(slot) = drawers.get_mut(&ticket) {
                unlink = self.incinerate_slot(ticket, slot, IncinerationReason::Expired, now);
            }
            accepted
        };
        if let Some(key) = unlink {
            self.unlink_key(&key, ticket);
        }
        if accepted {
            self.metrics.deposited(outcome);
            debug!(%ticket, outcome, "deposited into drawer");
        } else {
            self.metrics.deposited("discarded");
            debug!(%ticket, "discarded deposit into dead drawer");
        }
        accepted
    }

    /// The progress of the computation for `ticket`.
    ///
    /// Live while the drawer fills; frozen once it is filled or incinerated;
    /// [`ProgressSnapshot::UNKNOWN`] for unknown tickets.
    pub fn progress_of(&self, ticket: Ticket) -> ProgressSnapshot {
        match self.lock_drawers(ticket).get(&ticket) {
            Some(Slot::Live(drawer)) => drawer.progress(),
            Some(Slot::Tombstone(tombstone)) => tombstone.progress,
            None => ProgressSnapshot::UNKNOWN,
        }
    }

    /// The ticket currently indexed under `key`, if any.
    pub fn lookup_key(&self, key: &str) -> Option<Ticket> {
        self.lock_keys(key).get(key).copied()
    }

    /// Incinerates the drawer indexed under `key`, whatever its state.
    ///
    /// Returns whether a live drawer was incinerated.
    pub fn incinerate(&self, key: &str) -> bool {
        let now = self.now.now();
        let mut keys = self.lock_keys(key);
        let Some(ticket) = keys.remove(key) else {
            return false;
        };
        let mut drawers = self.lock_drawers(ticket);
        match drawers.get_mut(&ticket) {
            Some(slot) => self
                .incinerate_slot(ticket, slot, IncinerationReason::Evicted, now)
                .is_some(),
            None => false,
        }
    }

    /// Incinerates the drawer for `ticket`, whatever its state.
    ///
    /// Returns whether a live drawer was incinerated.
    pub fn incinerate_ticket(&self, ticket: Ticket) -> bool {
        let now = self.now.now();
        let key = {
            let mut drawers = self.lock_drawers(ticket);
            match drawers.get_mut(&ticket) {
                Some(slot) => self.incinerate_slot(ticket, slot, IncinerationReason::Evicted, now),
                None => None,
            }
        };
        match key {
            Some(key) => {
                self.unlink_key(&key, ticket);
                true
            }
            None => false,
        }
    }

    /// Incinerates every drawer older than `age`, measuring filled drawers
    /// from their fill and filling drawers from their reservation.
    ///
    /// Returns the number of drawers incinerated.
    pub fn incinerate_older(&self, age: Duration) -> u64 {
        let now = self.now.now();
        let mut count = 0;
        for shard in self.drawers.iter() {
            let mut unlink = Vec::new();
            {
                let mut drawers = shard.lock().expect("lock poisoned");
                for (ticket, slot) in drawers.iter_mut() {
                    let Slot::Live(drawer) = &*slot else {
                        continue;
                    };
                    let drawer_age = drawer.age(now);
                    if drawer_age <= age {
                        continue;
                    }
                    if let Some(key) =
                        self.incinerate_slot(*ticket, slot, IncinerationReason::Evicted, now)
                    {
                        info!(%ticket, key = %key, age = ?drawer_age, "incinerated aged drawer");
                        unlink.push((key, *ticket));
                    }
                }
            }
            count += u64::cast_from(unlink.len());
            for (key, ticket) in unlink {
                self.unlink_key(&key, ticket);
            }
        }
        count
    }

    /// Incinerates every drawer whose retention ran out, and purges
    /// tombstones older than the tombstone TTL.
    ///
    /// Returns the number of drawers incinerated.
    pub fn clean_house(&self) -> u64 {
        let now = self.now.now();
        let mut count = 0;
        let mut purged = 0;
        for shard in self.drawers.iter() {
            let mut unlink = Vec::new();
            {
                let mut drawers = shard.lock().expect("lock poisoned");
                drawers.retain(|ticket, slot| match &*slot {
                    Slot::Tombstone(tombstone) => {
                        let keep =
                            millis_between(tombstone.incinerated_at, now) < self.tombstone_ttl;
                        if !keep {
                            purged += 1;
                        }
                        keep
                    }
                    Slot::Live(drawer) if drawer.has_expired(now) => {
                        let age = drawer.age(now);
                        if let Some(key) =
                            self.incinerate_slot(*ticket, slot, IncinerationReason::Expired, now)
                        {
                            info!(%ticket, key = %key, ?age, "incinerated expired drawer");
                            unlink.push((key, *ticket));
                        }
                        true
                    }
                    Slot::Live(_) => true,
                });
            }
            count += u64::cast_from(unlink.len());
            for (key, ticket) in unlink {
                self.unlink_key(&key, ticket);
            }
        }
        if purged > 0 {
            debug!(purged, "purged tombstones");
        }
        count
    }

    /// Counts drawers by state.
    pub fn admin_info(&self) -> AdminInfo {
        let mut info = AdminInfo {
            total: self.next_ticket.load(Ordering::Acquire) - 1,
            incinerated: self.incinerated.load(Ordering::Relaxed),
            ..AdminInfo::default()
        };
        for shard in self.drawers.iter() {
            let drawers = shard.lock().expect("lock poisoned");
            for slot in drawers.values() {
                if let Slot::Live(drawer) = slot {
                    info.active += 1;
                    match drawer.state {
                        DrawerState::Filling(_) => info.filling += 1,
                        DrawerState::Filled { .. } => info.filled += 1,
                    }
                }
            }
        }
        info
    }

    /// The keys of all filled drawers, sorted.
    pub fn filled_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in self.drawers.iter() {
            let drawers = shard.lock().expect("lock poisoned");
            for slot in drawers.values() {
                if let Slot::Live(drawer) = slot
                    && drawer.filled_at().is_some()
                {
                    keys.push(drawer.key.clone());
                }
            }
        }
        keys.sort();
        keys
    }

    /// A human readable description of the drawer indexed under `key`.
    pub fn contents_string(&self, key: &str) -> Option<String>
    where
        T: std::fmt::Debug,
    {
        let ticket = self.lookup_key(key)?;
        let drawers = self.lock_drawers(ticket);
        match drawers.get(&ticket)? {
            Slot::Live(drawer) => Some(match &drawer.state {
                DrawerState::Filling(counter) => format!("{ticket} filling: {counter}"),
                DrawerState::Filled {
                    deposit: Ok(contents),
                    ..
                } => format!("{ticket} filled: {contents:?}"),
                DrawerState::Filled {
                    deposit: Err(message),
                    ..
                } => format!("{ticket} failed: {message}"),
            }),
            Slot::Tombstone(_) => None,
        }
    }
}

/// Runs [`ClaimStore::clean_house`] every `interval` on a background task.
///
/// The task stops when the returned handle is dropped.
pub fn spawn_housekeeping<T>(store: Arc<ClaimStore<T>>, interval: Duration) -> AbortOnDropHandle<()>
where
    T: Send + 'static,
{
    sdb_ore::task::spawn(|| "claim_store::housekeeping", async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let incinerated = store.clean_house();
            if incinerated > 0 {
                debug!(incinerated, "housekeeping pass");
            }
        }
    })
    .abort_on_drop()
}
