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

//! Internal utility libraries for the safe deposit box crates.
//!
//! **ore** (_n_): the raw material from which more valuable materials are extracted.
//! Modules are included in this crate when they are broadly useful but too
//! small to warrant their own crate.

#![deny(missing_docs, missing_debug_implementations)]

// Lets `#[sdb_ore::test]` expand to paths that also resolve inside this crate.
extern crate self as sdb_ore;

pub mod cast;
pub mod metrics;
pub mod now;
pub mod task;
pub mod tracing;

pub use sdb_ore_proc::test;

/// Asserts that the provided expression, that returns an `Option`, is `None`.
///
/// Prints the unexpected value on failure, which `assert!(x.is_none())`
/// does not.
#[macro_export]
macro_rules! assert_none {
    ($val:expr $(,)?) => {
        match $val {
            None => {}
            Some(y) => panic!("assertion failed: expected None, got Some({:?})", y),
        }
    };
    ($val:expr, $($msg:tt)+) => {
        match $val {
            None => {}
            Some(y) => panic!(
                "assertion failed: expected None, got Some({:?}): {}",
                y,
                format_args!($($msg)+)
            ),
        }
    };
}

/// Asserts that the provided expression, that returns a `Result`, is `Ok`,
/// and evaluates to the contained value.
#[macro_export]
macro_rules! assert_ok {
    ($val:expr $(,)?) => {
        match $val {
            Ok(v) => v,
            Err(e) => panic!("assertion failed: expected Ok, got Err({:?})", e),
        }
    };
}
