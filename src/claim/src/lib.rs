// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A claim-check store ("safe deposit box") for long-running computations.
//!
//! A request that takes long to satisfy reserves a drawer under a dedup key
//! and hands the caller a [`Ticket`]. A worker fills the drawer when its
//! computation finishes; the caller presents the ticket later to withdraw
//! the result. Drawers are reclaimed ("incinerated") when their
//! [`Retention`] runs out, when a closing withdrawal retrieves them, or
//! administratively.
//!
//! Each node owns one [`ClaimStore`]; tickets mean nothing to other nodes.

#![warn(missing_docs)]

mod config;
mod metrics;
mod progress;
mod store;
mod withdrawal;

pub use crate::config::ClaimStoreConfig;
pub use crate::metrics::ClaimMetrics;
pub use crate::progress::{CounterStatus, ProgressSnapshot, UnitCounter};
pub use crate::store::{
    AdminInfo, ClaimStore, IncinerationReason, Reservation, spawn_housekeeping,
};
pub use crate::withdrawal::{Retention, Ticket, Withdrawal, WithdrawalCode};
