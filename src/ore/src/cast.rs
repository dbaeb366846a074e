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

//! Cast utilities.

/// A trait for safe, simple, and infallible casts.
///
/// Only casts that cannot truncate on the 64-bit platforms we run on are
/// provided. Prefer it over `as`, which truncates silently.
pub trait CastFrom<T> {
    /// Performs the cast.
    fn cast_from(from: T) -> Self;
}

/// The reverse of [`CastFrom`], mirroring [`From`]/[`Into`].
pub trait CastInto<T> {
    /// Performs the cast.
    fn cast_into(self) -> T;
}

impl<T, U> CastInto<U> for T
where
    U: CastFrom<T>,
{
    fn cast_into(self) -> U {
        U::cast_from(self)
    }
}

macro_rules! cast_from {
    ($from:ty, $to:ty) => {
        #[allow(clippy::as_conversions)]
        impl CastFrom<$from> for $to {
            fn cast_from(from: $from) -> $to {
                from as $to
            }
        }
    };
}

cast_from!(u32, usize);
#[cfg(target_pointer_width = "64")]
cast_from!(u64, usize);
cast_from!(usize, u64);

/// A trait for casts that may lose precision, such as integer to float.
///
/// The loss is accepted by the caller; use it where an approximate value is
/// all that is needed (averages, rates, percentages).
pub trait CastLossy<T> {
    /// Performs the cast.
    fn cast_lossy(from: T) -> Self;
}

macro_rules! cast_lossy {
    ($from:ty, $to:ty) => {
        #[allow(clippy::as_conversions)]
        impl CastLossy<$from> for $to {
            fn cast_lossy(from: $from) -> $to {
                from as $to
            }
        }
    };
}

cast_lossy!(u64, f64);
cast_lossy!(i64, f64);
cast_lossy!(f64, u64);
