// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus metrics for the claim store.

use sdb_ore::metric;
use sdb_ore::metrics::{IntCounterVec, IntGauge, MetricsRegistry};

use crate::store::IncinerationReason;
use crate::withdrawal::WithdrawalCode;

/// Metrics tracked by a [`ClaimStore`](crate::ClaimStore).
#[derive(Debug, Clone)]
pub struct ClaimMetrics {
    reservations: IntCounterVec,
    withdrawals: IntCounterVec,
    deposits: IntCounterVec,
    incinerations: IntCounterVec,
    live_drawers: IntGauge,
}

impl ClaimMetrics {
    /// Registers the claim store metrics into `registry`.
    pub fn register_into(registry: &MetricsRegistry) -> ClaimMetrics {
        ClaimMetrics {
            reservations: registry.register(metric!(
                name: "sdb_claim_reservations_total",
                help: "Reservation requests, by whether they created a drawer or joined one.",
                var_labels: ["outcome"],
            )),
            withdrawals: registry.register(metric!(
                name: "sdb_claim_withdrawals_total",
                help: "Withdrawal attempts, by withdrawal code.",
                var_labels: ["code"],
            )),
            deposits: registry.register(metric!(
                name: "sdb_claim_deposits_total",
                help: "Deposits, by whether they filled a drawer, recorded a failure, or were discarded.",
                var_labels: ["outcome"],
            )),
            incinerations: registry.register(metric!(
                name: "sdb_claim_incinerations_total",
                help: "Drawers incinerated, by reason.",
                var_labels: ["reason"],
            )),
            live_drawers: registry.register(metric!(
                name: "sdb_claim_live_drawers",
                help: "Drawers currently filling or filled.",
            )),
        }
    }

    pub(crate) fn reserved(&self, is_new: bool) {
        let outcome = if is_new { "new" } else { "joined" };
        self.reservations.with_label_values(&[outcome]).inc();
        if is_new {
            self.live_drawers.inc();
        }
    }

    pub(crate) fn withdrew(&self, code: WithdrawalCode) {
        self.withdrawals.with_label_values(&[code.as_str()]).inc();
    }

    pub(crate) fn deposited(&self, outcome: &str) {
        self.deposits.with_label_values(&[outcome]).inc();
    }

    pub(crate) fn incinerated(&self, reason: IncinerationReason) {
        self.incinerations
            .with_label_values(&[reason.as_str()])
            .inc();
        self.live_drawers.dec();
    }
}
