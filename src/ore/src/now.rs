// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Now utilities.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cast::CastFrom;

/// A type representing the number of milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// Converts a [`Duration`] into whole milliseconds, saturating at
/// [`EpochMillis::MAX`].
pub fn duration_to_millis(duration: Duration) -> EpochMillis {
    duration.as_millis().try_into().unwrap_or(EpochMillis::MAX)
}

/// A function that returns system or mocked time.
///
/// Cloning is cheap; all clones observe the same clock.
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns the current time.
    pub fn now(&self) -> EpochMillis {
        (self.0)()
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

impl Deref for NowFn {
    type Target = dyn Fn() -> EpochMillis + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &(*self.0)
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

fn system_time() -> EpochMillis {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration_to_millis(since_epoch)
}

fn now_zero() -> EpochMillis {
    0
}

/// A [`NowFn`] that returns the actual system time.
pub static SYSTEM_TIME: LazyLock<NowFn> = LazyLock::new(|| NowFn::from(system_time));

/// A [`NowFn`] that always returns zero.
///
/// For use in tests.
pub static NOW_ZERO: LazyLock<NowFn> = LazyLock::new(|| NowFn::from(now_zero));

/// A clock that only moves when told to.
///
/// For use in tests that exercise deadlines without sleeping.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: EpochMillis) -> ManualClock {
        ManualClock(Arc::new(AtomicU64::new(start)))
    }

    /// Returns the current reading.
    pub fn now(&self) -> EpochMillis {
        self.0.load(Ordering::SeqCst)
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(duration_to_millis(by), Ordering::SeqCst);
    }

    /// Moves the clock to `to`. Moving backwards is allowed.
    pub fn set(&self, to: EpochMillis) {
        self.0.store(to, Ordering::SeqCst);
    }

    /// Returns a [`NowFn`] that reads this clock.
    pub fn now_fn(&self) -> NowFn {
        let clock = Arc::clone(&self.0);
        NowFn::from(move || clock.load(Ordering::SeqCst))
    }
}

/// Returns the number of milliseconds elapsed between `earlier` and `later`,
/// or zero if `later` is not after `earlier`.
pub fn millis_between(earlier: EpochMillis, later: EpochMillis) -> Duration {
    Duration::from_millis(later.saturating_sub(earlier))
}

/// Adds `duration` to `at`, saturating at [`EpochMillis::MAX`].
pub fn millis_after(at: EpochMillis, duration: Duration) -> EpochMillis {
    at.saturating_add(duration_to_millis(duration))
}

/// Formats a millisecond count as seconds with millisecond precision.
pub fn display_millis(millis: u64) -> String {
    let secs = millis / 1000;
    let frac = millis % 1000;
    format!("{secs}.{frac:03}s")
}

impl CastFrom<Duration> for EpochMillis {
    fn cast_from(from: Duration) -> EpochMillis {
        duration_to_millis(from)
    }
}
