// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The deposit request and the two halves of handling it.
//!
//! Answering a request is split in two. The synchronous half,
//! [`DepositRequest::get_response`], runs on the connection's task: it only
//! touches the claim store, withdrawing from the request's drawer or
//! reserving a new one, and returns a [`DepositReceipt`]. If it reserved a
//! drawer it also produces a [`PendingDeposit`], which the asynchronous half,
//! [`DepositRequest::handle`], later runs on a blocking thread to compute and
//! deposit the contents.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sdb_claim::{ClaimStore, Retention, Ticket, UnitCounter, WithdrawalCode};
use sdb_transport::{Message, Respond};

use crate::node::DepositNode;
use crate::receipt::DepositReceipt;

/// A unit of work whose result is left in a node's claim store.
pub trait DepositWork: Message {
    /// The result of the work.
    type Contents: Message + Clone;
    /// Node-local state the work runs against.
    type Context: Send + Sync + 'static;

    /// A key identifying the logical unit of work. Equal keys share one
    /// drawer, so keys of unrelated work types must not collide; prefix them
    /// with the work type.
    fn dedup_key(&self) -> String;

    /// Computes the contents. May take long.
    ///
    /// Implementations should call [`UnitCounter::set_to_be_done`] as soon as
    /// the amount of work is known and [`UnitCounter::inc`] per unit, and
    /// may stop early once [`UnitCounter::is_killed`] reports that nobody
    /// wants the result anymore.
    fn generate_contents(
        &self,
        ctx: &Self::Context,
        progress: &UnitCounter,
    ) -> Result<Self::Contents, anyhow::Error>;
}

/// A request to run `work` on a node, or to collect the result of an
/// earlier run.
///
/// The request carries the tickets nodes issued for it in earlier rounds,
/// keyed by node name. Clients resubmit the same request, updated from each
/// receipt with [`DepositRequest::update_claims`], until a node reports a
/// terminal outcome.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DepositRequest<W: DepositWork> {
    claims: BTreeMap<String, Ticket>,
    close_box: bool,
    force_rehandle: bool,
    retention: Retention,
    work: W,
    #[serde(skip)]
    key: OnceLock<String>,
    #[serde(skip)]
    pending: Option<PendingDeposit<W::Contents>>,
}

impl<W: DepositWork> DepositRequest<W> {
    /// Creates a request for `work` that keeps its drawers indefinitely and
    /// does not close them on retrieval.
    pub fn new(work: W) -> Self {
        DepositRequest {
            claims: BTreeMap::new(),
            close_box: false,
            force_rehandle: false,
            retention: Retention::default(),
            work,
            key: OnceLock::new(),
            pending: None,
        }
    }

    /// Sets whether a retrieval incinerates the drawer.
    pub fn close_box(mut self, close_box: bool) -> Self {
        self.close_box = close_box;
        self
    }

    /// Sets whether an expired drawer is replaced by a fresh computation
    /// rather than reported as expired.
    pub fn force_rehandle(mut self, force_rehandle: bool) -> Self {
        self.force_rehandle = force_rehandle;
        self
    }

    /// Sets the retention of drawers reserved for this request.
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// The work.
    pub fn work(&self) -> &W {
        &self.work
    }

    /// The dedup key of the work, computed once.
    pub fn key(&self) -> &str {
        self.key.get_or_init(|| self.work.dedup_key())
    }

    /// The tickets issued for this request, by node name.
    pub fn claims(&self) -> &BTreeMap<String, Ticket> {
        &self.claims
    }

    /// Records the ticket a node issued in `receipt`.
    pub fn update_claims<T>(&mut self, receipt: &DepositReceipt<T>) {
        self.claims.insert(receipt.node_name.clone(), receipt.ticket);
    }

    /// Forgets all tickets, so the next submission is treated as new by
    /// nodes that have no drawer for the key.
    pub fn reset_claims(&mut self) {
        self.claims.clear();
    }

    /// Replaces the tickets.
    pub fn set_claims(&mut self, claims: BTreeMap<String, Ticket>) {
        self.claims = claims;
    }

    /// Runs the synchronous half of handling the request on `node`.
    ///
    /// Withdraws from the drawer this request holds on the node, if any. A
    /// retrieved, failed, or still filling drawer is reported as is, and so
    /// is an expired one unless the request forces rehandling. Otherwise a
    /// drawer is reserved for the request's key. If this call created it,
    /// the receipt carries no withdrawal and the returned [`PendingDeposit`]
    /// must be run to fill it; if another request created it, the receipt
    /// carries a withdrawal from it.
    pub fn get_response<M>(
        &self,
        node: &DepositNode<W, M>,
    ) -> (DepositReceipt<W::Contents>, Option<PendingDeposit<W::Contents>>) {
        let store = node.store();
        let key = self.key();
        let ticket = match self.claims.get(node.name()) {
            Some(ticket) => Some(*ticket),
            None => store.lookup_key(key),
        };

        if let Some(ticket) = ticket {
            let withdrawal = store.withdraw(ticket, self.close_box);
            let settled = match withdrawal.code {
                WithdrawalCode::Retrieved | WithdrawalCode::NoDeposit | WithdrawalCode::Failed => {
                    true
                }
                WithdrawalCode::Expired => !self.force_rehandle,
                WithdrawalCode::Unreserved => false,
            };
            if settled {
                let receipt = DepositReceipt {
                    node_name: node.name().to_owned(),
                    ticket,
                    progress: store.progress_of(ticket),
                    withdrawal: Some(withdrawal),
                };
                return (receipt, None);
            }
            debug!(%ticket, key, code = %withdrawal.code, "rehandling deposit request");
        }

        let reservation = store.reserve(key, self.retention);
        // Joining another request's drawer: report where it stands.
        let withdrawal =
            (!reservation.is_new).then(|| store.withdraw(reservation.ticket, self.close_box));
        let pending = reservation.counter.map(|counter| PendingDeposit {
            ticket: reservation.ticket,
            key: key.to_owned(),
            counter,
            store: Arc::clone(store),
        });
        let receipt = DepositReceipt {
            node_name: node.name().to_owned(),
            ticket: reservation.ticket,
            withdrawal,
            progress: store.progress_of(reservation.ticket),
        };
        (receipt, pending)
    }

    /// Whether [`DepositRequest::handle`] has work to do.
    pub fn needs_handling(&self) -> bool {
        self.pending.is_some()
    }

    /// Runs the asynchronous half: computes and deposits the contents of
    /// the drawer reserved when the response was generated.
    ///
    /// Returns `None` if there was nothing to compute, either because the
    /// response did not reserve a drawer or because this was already
    /// called. Otherwise returns whether the deposit was accepted.
    pub fn handle<M>(&mut self, node: &DepositNode<W, M>) -> Option<bool> {
        let pending = self.pending.take()?;
        Some(pending.run(|progress| {
            self.work.generate_contents(node.context(), progress)
        }))
    }
}

impl<W: DepositWork, M> Respond<DepositNode<W, M>> for DepositRequest<W> {
    type Response = DepositReceipt<W::Contents>;

    fn respond(&mut self, node: &DepositNode<W, M>) -> Option<Self::Response> {
        let (receipt, pending) = self.get_response(node);
        self.pending = pending;
        Some(receipt)
    }
}

impl<W: DepositWork + Clone> Clone for DepositRequest<W> {
    /// Clones the request as sent over the wire; a pending deposit stays
    /// with the source request.
    fn clone(&self) -> Self {
        DepositRequest {
            claims: self.claims.clone(),
            close_box: self.close_box,
            force_rehandle: self.force_rehandle,
            retention: self.retention,
            work: self.work.clone(),
            key: self.key.clone(),
            pending: None,
        }
    }
}

impl<W: DepositWork> fmt::Debug for DepositRequest<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepositRequest")
            .field("claims", &self.claims)
            .field("close_box", &self.close_box)
            .field("force_rehandle", &self.force_rehandle)
            .field("retention", &self.retention)
            .field("work", &self.work)
            .field("pending", &self.pending)
            .finish()
    }
}

/// A drawer reserved by the synchronous half, waiting to be filled.
///
/// Never leaves the node that created it. Dropping it without running it,
/// e.g. because the receipt could not be delivered, incinerates the drawer
/// so that the next request for the key starts over.
pub struct PendingDeposit<T> {
    ticket: Ticket,
    key: String,
    counter: Arc<UnitCounter>,
    store: Arc<ClaimStore<T>>,
}

impl<T> PendingDeposit<T> {
    /// The ticket of the drawer to fill.
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Runs `generate` and deposits its result. Errors and panics are
    /// deposited as failures.
    ///
    /// Returns whether the store accepted the deposit; it does not if the
    /// drawer expired or was incinerated meanwhile.
    pub fn run<F>(self, generate: F) -> bool
    where
        F: FnOnce(&UnitCounter) -> Result<T, anyhow::Error>,
    {
        self.counter.mark_start();
        let result = panic::catch_unwind(AssertUnwindSafe(|| generate(&self.counter)));
        match result {
            Ok(Ok(contents)) => self.store.deposit(self.ticket, contents),
            Ok(Err(err)) => {
                warn!(ticket = %self.ticket, key = %self.key, "deposit work failed: {err:#}");
                self.store.deposit_failure(self.ticket, format!("{err:#}"))
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!(ticket = %self.ticket, key = %self.key, "deposit work panicked: {message}");
                self.store
                    .deposit_failure(self.ticket, format!("panicked: {message}"))
            }
        }
    }
}

impl<T> Drop for PendingDeposit<T> {
    fn drop(&mut self) {
        if self.counter.started_at().is_none() && self.store.incinerate_ticket(self.ticket) {
            warn!(ticket = %self.ticket, key = %self.key, "incinerated drawer abandoned before its work ran");
        }
    }
}

impl<T> fmt::Debug for PendingDeposit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDeposit")
            .field("ticket", &self.ticket)
            .field("key", &self.key)
            .field("progress", &self.counter.snapshot())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
