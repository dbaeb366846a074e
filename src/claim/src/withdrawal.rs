// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The vocabulary shared by the store and its clients: tickets, retention
//! policies, and the outcome of a withdrawal.

use std::fmt;
use std::time::Duration;

use sdb_ore::now::EpochMillis;
use serde::{Deserialize, Serialize};

/// An opaque claim ticket, unique within one [`ClaimStore`](crate::ClaimStore).
///
/// Tickets are issued in increasing order, so a smaller ticket was reserved
/// earlier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// How long a drawer is kept around.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Retention {
    /// The drawer must be filled within this long of its reservation, or it
    /// expires. Once filled it is kept until evicted explicitly.
    ExpireAfter(Duration),
    /// Once filled, the drawer is evicted this long after the fill.
    CacheFor(Duration),
    /// The drawer is only evicted explicitly: by closing it on withdrawal, or
    /// through [`ClaimStore::incinerate`](crate::ClaimStore::incinerate) and
    /// [`ClaimStore::incinerate_older`](crate::ClaimStore::incinerate_older).
    #[default]
    CacheIndefinitely,
}

impl Retention {
    /// Decodes the signed millisecond convention used by older clients:
    /// positive values expire unfilled drawers, negative values cache filled
    /// drawers for their magnitude, and zero caches indefinitely.
    pub fn from_millis(millis: i64) -> Retention {
        let magnitude = Duration::from_millis(millis.unsigned_abs());
        match millis {
            0 => Retention::CacheIndefinitely,
            n if n > 0 => Retention::ExpireAfter(magnitude),
            _ => Retention::CacheFor(magnitude),
        }
    }

    /// The fill deadline for a drawer reserved at `reserved_at`, if any.
    pub fn fill_deadline(&self, reserved_at: EpochMillis) -> Option<EpochMillis> {
        match self {
            Retention::ExpireAfter(d) => Some(sdb_ore::now::millis_after(reserved_at, *d)),
            Retention::CacheFor(_) | Retention::CacheIndefinitely => None,
        }
    }

    /// The eviction deadline for a drawer filled at `filled_at`, if any.
    pub fn evict_deadline(&self, filled_at: EpochMillis) -> Option<EpochMillis> {
        match self {
            Retention::CacheFor(d) => Some(sdb_ore::now::millis_after(filled_at, *d)),
            Retention::ExpireAfter(_) | Retention::CacheIndefinitely => None,
        }
    }
}

/// The outcome of one withdrawal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WithdrawalCode {
    /// The drawer was filled; the withdrawal carries its contents.
    Retrieved,
    /// The drawer is reserved but nothing has been deposited yet.
    NoDeposit,
    /// The drawer expired before it was filled, or its cache period ran out.
    Expired,
    /// No drawer is known for the ticket.
    Unreserved,
    /// The computation filling the drawer failed; the withdrawal carries the
    /// failure message.
    Failed,
}

impl WithdrawalCode {
    /// Whether the code ends a client's polling for its ticket.
    pub fn is_terminal(&self) -> bool {
        match self {
            WithdrawalCode::Retrieved | WithdrawalCode::Expired | WithdrawalCode::Failed => true,
            WithdrawalCode::NoDeposit | WithdrawalCode::Unreserved => false,
        }
    }

    /// A short, stable name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalCode::Retrieved => "retrieved",
            WithdrawalCode::NoDeposit => "no_deposit",
            WithdrawalCode::Expired => "expired",
            WithdrawalCode::Unreserved => "unreserved",
            WithdrawalCode::Failed => "failed",
        }
    }
}

impl fmt::Display for WithdrawalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The immutable result of one call to
/// [`ClaimStore::withdraw`](crate::ClaimStore::withdraw).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal<T> {
    /// The ticket withdrawn from.
    pub ticket: Ticket,
    /// What happened.
    pub code: WithdrawalCode,
    /// The deposited contents, present iff `code` is
    /// [`WithdrawalCode::Retrieved`].
    pub contents: Option<T>,
    /// The failure message, present iff `code` is [`WithdrawalCode::Failed`].
    pub failure: Option<String>,
    /// When the drawer was reserved, if it was known to the store.
    pub reserved_at: Option<EpochMillis>,
    /// When the drawer was filled, if it was.
    pub filled_at: Option<EpochMillis>,
    /// When this withdrawal happened.
    pub withdrawn_at: EpochMillis,
}

impl<T> Withdrawal<T> {
    pub(crate) fn empty(ticket: Ticket, code: WithdrawalCode, withdrawn_at: EpochMillis) -> Self {
        Withdrawal {
            ticket,
            code,
            contents: None,
            failure: None,
            reserved_at: None,
            filled_at: None,
            withdrawn_at,
        }
    }

    /// How long the drawer took to fill, if it was filled.
    pub fn fill_time(&self) -> Option<Duration> {
        match (self.reserved_at, self.filled_at) {
            (Some(reserved), Some(filled)) => Some(sdb_ore::now::millis_between(reserved, filled)),
            _ => None,
        }
    }

    /// Maps the contents, keeping the rest of the withdrawal.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Withdrawal<U> {
        Withdrawal {
            ticket: self.ticket,
            code: self.code,
            contents: self.contents.map(f),
            failure: self.failure,
            reserved_at: self.reserved_at,
            filled_at: self.filled_at,
            withdrawn_at: self.withdrawn_at,
        }
    }
}
