// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Progress tracking for long-running computations.
//!
//! A [`UnitCounter`] is written by the single worker filling a drawer and
//! read concurrently by any number of receipt builders. All state lives in
//! atomics, so readers never block the writer. A reader may observe a unit
//! count and an accumulated time that straddle one increment; snapshots are
//! estimates, not a consistent cut.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use sdb_ore::cast::CastLossy;
use sdb_ore::now::{EpochMillis, NowFn};
use serde::{Deserialize, Serialize};

/// Marks a timestamp or count that has not been set.
const UNSET: u64 = u64::MAX;

/// The lifecycle of a [`UnitCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterStatus {
    /// Work has not started.
    Idle,
    /// Work is in progress.
    Running,
    /// Work finished.
    Done,
    /// Work was asked to stop before it finished.
    Killed,
}

/// A point-in-time view of a computation's progress.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Units completed, if work has started.
    pub done_so_far: Option<u64>,
    /// Units to complete in total, if known.
    pub to_be_done: Option<u64>,
    /// The mean wall-clock time spent per completed unit, if any unit has
    /// completed.
    pub avg_millis_per_unit: Option<f64>,
}

impl ProgressSnapshot {
    /// The snapshot reported for tickets the store knows nothing about.
    pub const UNKNOWN: ProgressSnapshot = ProgressSnapshot {
        done_so_far: None,
        to_be_done: None,
        avg_millis_per_unit: None,
    };

    /// The fraction of work completed, in `[0, 1]` for well-behaved workers.
    pub fn percent_complete(&self) -> Option<f64> {
        match (self.done_so_far, self.to_be_done) {
            (Some(done), Some(total)) if total > 0 => {
                Some(f64::cast_lossy(done) / f64::cast_lossy(total))
            }
            _ => None,
        }
    }

    /// The time the remaining units should take at the average rate so far.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let avg = self.avg_millis_per_unit?;
        let total = self.to_be_done?;
        let done = self.done_so_far.unwrap_or(0);
        let remaining = f64::cast_lossy(total.saturating_sub(done)) * avg;
        Some(Duration::from_millis(u64::cast_lossy(remaining.round())))
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.done_so_far {
            Some(done) => write!(f, "{done}")?,
            None => f.write_str("-")?,
        }
        match self.to_be_done {
            Some(total) => write!(f, "/{total}")?,
            None => f.write_str("/?")?,
        }
        if let Some(pct) = self.percent_complete() {
            write!(f, " ({:.1}%)", pct * 100.0)?;
        }
        if let Some(eta) = self.estimated_remaining() {
            write!(f, " eta {}", humantime::format_duration(eta))?;
        }
        Ok(())
    }
}

/// Counts completed units of a computation and the time spent on them.
#[derive(Debug)]
pub struct UnitCounter {
    now: NowFn,
    to_be_done: AtomicU64,
    done: AtomicU64,
    unit_millis: AtomicU64,
    timed_units: AtomicU64,
    started_at: AtomicU64,
    last_inc_at: AtomicU64,
    ended_at: AtomicU64,
    killed: AtomicBool,
}

impl UnitCounter {
    /// Creates an idle counter with an unknown amount of work.
    pub fn new(now: NowFn) -> UnitCounter {
        UnitCounter {
            now,
            to_be_done: AtomicU64::new(UNSET),
            done: AtomicU64::new(0),
            unit_millis: AtomicU64::new(0),
            timed_units: AtomicU64::new(0),
            started_at: AtomicU64::new(UNSET),
            last_inc_at: AtomicU64::new(UNSET),
            ended_at: AtomicU64::new(UNSET),
            killed: AtomicBool::new(false),
        }
    }

    /// Records the total amount of work, once it is known.
    pub fn set_to_be_done(&self, units: u64) {
        // `UNSET` doubles as "unknown"; clamp so a real total stays known.
        self.to_be_done.store(units.min(UNSET - 1), Ordering::Release);
    }

    /// Marks the start of work. Later calls are ignored.
    pub fn mark_start(&self) {
        let now = self.now.now();
        let _ = self
            .started_at
            .compare_exchange(UNSET, now, Ordering::AcqRel, Ordering::Acquire);
        let _ = self
            .last_inc_at
            .compare_exchange(UNSET, now, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Records one completed unit, starting the counter if needed.
    ///
    /// A unit that starts the counter has no known start of its own, so it
    /// counts as done but not towards the time per unit.
    ///
    /// Returns whether the worker should keep going, i.e. whether the counter
    /// is still running.
    pub fn inc(&self) -> bool {
        let now = self.now.now();
        let started_here = self
            .started_at
            .compare_exchange(UNSET, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        let prev = self.last_inc_at.swap(now, Ordering::AcqRel);
        if !started_here && prev != UNSET {
            self.unit_millis
                .fetch_add(now.saturating_sub(prev), Ordering::AcqRel);
            self.timed_units.fetch_add(1, Ordering::AcqRel);
        }
        self.done.fetch_add(1, Ordering::AcqRel);
        self.status() == CounterStatus::Running
    }

    /// Marks the end of work. Later calls are ignored.
    pub fn mark_end(&self) {
        let _ = self.ended_at.compare_exchange(
            UNSET,
            self.now.now(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Asks the worker to stop, and ends the counter.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.mark_end();
    }

    /// Whether [`UnitCounter::kill`] has been called. Long computations
    /// should poll this and give up early.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Reports where the counter is in its lifecycle.
    pub fn status(&self) -> CounterStatus {
        if self.ended_at.load(Ordering::Acquire) != UNSET {
            if self.is_killed() {
                CounterStatus::Killed
            } else {
                CounterStatus::Done
            }
        } else if self.started_at.load(Ordering::Acquire) != UNSET {
            CounterStatus::Running
        } else {
            CounterStatus::Idle
        }
    }

    /// When work started, if it has.
    pub fn started_at(&self) -> Option<EpochMillis> {
        known(self.started_at.load(Ordering::Acquire))
    }

    /// When work ended, if it has.
    pub fn ended_at(&self) -> Option<EpochMillis> {
        known(self.ended_at.load(Ordering::Acquire))
    }

    /// Units completed, if work has started.
    pub fn done_so_far(&self) -> Option<u64> {
        self.started_at()?;
        Some(self.done.load(Ordering::Acquire))
    }

    /// Units to complete in total, if known.
    pub fn to_be_done(&self) -> Option<u64> {
        known(self.to_be_done.load(Ordering::Acquire))
    }

    /// Takes a snapshot of the counter.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let done_so_far = self.done_so_far();
        let timed = self.timed_units.load(Ordering::Acquire);
        let avg_millis_per_unit = (done_so_far.is_some() && timed > 0).then(|| {
            let millis = self.unit_millis.load(Ordering::Acquire);
            f64::cast_lossy(millis) / f64::cast_lossy(timed)
        });
        ProgressSnapshot {
            done_so_far,
            to_be_done: self.to_be_done(),
            avg_millis_per_unit,
        }
    }

    /// See [`ProgressSnapshot::percent_complete`].
    pub fn percent_complete(&self) -> Option<f64> {
        self.snapshot().percent_complete()
    }

    /// See [`ProgressSnapshot::estimated_remaining`].
    pub fn estimated_remaining(&self) -> Option<Duration> {
        self.snapshot().estimated_remaining()
    }
}

impl fmt::Display for UnitCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status() {
            CounterStatus::Idle => "idle",
            CounterStatus::Running => "running",
            CounterStatus::Done => "done",
            CounterStatus::Killed => "killed",
        };
        write!(f, "{status} {}", self.snapshot())
    }
}

fn known(value: u64) -> Option<u64> {
    (value != UNSET).then_some(value)
}

#[cfg(test)]
mod tests {
    use sdb_ore::now::ManualClock;

    use super::*;

    #[sdb_ore::test]
    fn lifecycle() {
        let clock = ManualClock::new(1_000);
        let counter = UnitCounter::new(clock.now_fn());
        assert_eq!(counter.status(), CounterStatus::Idle);
        assert_eq!(counter.snapshot(), ProgressSnapshot::UNKNOWN);

        counter.set_to_be_done(4);
        counter.mark_start();
        assert_eq!(counter.status(), CounterStatus::Running);
        assert_eq!(counter.done_so_far(), Some(0));

        clock.advance(Duration::from_millis(100));
        assert!(counter.inc());
        clock.advance(Duration::from_millis(300));
        assert!(counter.inc());

        let snapshot = counter.snapshot();
        assert_eq!(snapshot.done_so_far, Some(2));
        assert_eq!(snapshot.to_be_done, Some(4));
        assert_eq!(snapshot.avg_millis_per_unit, Some(200.0));
        assert_eq!(snapshot.percent_complete(), Some(0.5));
        assert_eq!(
            snapshot.estimated_remaining(),
            Some(Duration::from_millis(400))
        );
        assert_eq!(counter.to_string(), "running 2/4 (50.0%) eta 400ms");

        counter.mark_end();
        assert_eq!(counter.status(), CounterStatus::Done);
        assert_eq!(counter.ended_at(), Some(1_400));
        // Incrementing after the end no longer reports running.
        assert!(!counter.inc());
    }

    #[sdb_ore::test]
    fn kill() {
        let clock = ManualClock::new(0);
        let counter = UnitCounter::new(clock.now_fn());
        counter.mark_start();
        assert!(!counter.is_killed());
        counter.kill();
        assert!(counter.is_killed());
        assert_eq!(counter.status(), CounterStatus::Killed);
        assert!(!counter.inc());
    }

    #[sdb_ore::test]
    fn implicit_start_leaves_first_unit_untimed() {
        let clock = ManualClock::new(0);
        let counter = UnitCounter::new(clock.now_fn());
        counter.set_to_be_done(5);
        // No `mark_start`: the first unit starts the counter.
        clock.advance(Duration::from_millis(500));
        assert!(counter.inc());
        assert_eq!(counter.started_at(), Some(500));
        sdb_ore::assert_none!(counter.snapshot().avg_millis_per_unit);

        clock.advance(Duration::from_millis(100));
        counter.inc();
        clock.advance(Duration::from_millis(300));
        counter.inc();

        let snapshot = counter.snapshot();
        assert_eq!(snapshot.done_so_far, Some(3));
        assert_eq!(snapshot.avg_millis_per_unit, Some(200.0));
        assert_eq!(
            snapshot.estimated_remaining(),
            Some(Duration::from_millis(400))
        );
    }

    #[sdb_ore::test]
    fn unknown_total() {
        let clock = ManualClock::new(0);
        let counter = UnitCounter::new(clock.now_fn());
        clock.advance(Duration::from_millis(10));
        counter.inc();
        sdb_ore::assert_none!(counter.percent_complete());
        sdb_ore::assert_none!(counter.estimated_remaining());
        assert_eq!(counter.to_string(), "running 1/?");
    }

    #[sdb_ore::test]
    fn overshoot_saturates() {
        let snapshot = ProgressSnapshot {
            done_so_far: Some(12),
            to_be_done: Some(10),
            avg_millis_per_unit: Some(5.0),
        };
        assert_eq!(snapshot.estimated_remaining(), Some(Duration::ZERO));
        assert_eq!(snapshot.percent_complete(), Some(1.2));
    }
}
