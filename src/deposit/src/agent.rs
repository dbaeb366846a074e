// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client side of deposit requests.
//!
//! A [`ClaimAgent`] submits one [`DepositRequest`] to a set of nodes and
//! keeps resubmitting it to each node, with the tickets the node issued,
//! until the node reports a terminal outcome or the agent's time runs out.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future;
use sdb_claim::{Ticket, Withdrawal};
use sdb_ore::cast::{CastFrom, CastLossy};
use sdb_transport::{Metrics, NoopMetrics, Outcome, TimeBoundedConnector};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::receipt::DepositReceipt;
use crate::request::{DepositRequest, DepositWork};

/// A node to collect from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    /// The node's name, as it reports it in receipts.
    pub name: String,
    /// The address the node serves deposit requests on.
    pub address: String,
}

impl NodeAddress {
    /// Creates a node address.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        NodeAddress {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// What an agent collected.
#[derive(Debug, Clone)]
pub struct Collection<T> {
    /// The terminal withdrawal from each node that produced one.
    pub withdrawals: BTreeMap<String, Withdrawal<T>>,
    /// The last receipt from each node that answered at all.
    pub receipts: BTreeMap<String, DepositReceipt<T>>,
    /// The nodes that produced no terminal withdrawal.
    pub missing: Vec<String>,
    /// The tickets the nodes issued, by node name.
    pub claims: BTreeMap<String, Ticket>,
}

impl<T> Collection<T> {
    /// The fraction of nodes that produced a terminal withdrawal.
    pub fn response_ratio(&self) -> f64 {
        let collected = self.withdrawals.len();
        let total = collected + self.missing.len();
        if total == 0 {
            return 1.0;
        }
        f64::cast_lossy(u64::cast_from(collected)) / f64::cast_lossy(u64::cast_from(total))
    }

    /// The contents retrieved, by node name.
    pub fn contents(&self) -> impl Iterator<Item = (&str, &T)> {
        self.withdrawals
            .iter()
            .filter_map(|(node, w)| w.contents.as_ref().map(|c| (node.as_str(), c)))
    }
}

/// What collecting from one node produced.
struct NodeResult<T> {
    withdrawal: Option<Withdrawal<T>>,
    receipt: Option<DepositReceipt<T>>,
    ticket: Option<Ticket>,
}

/// Drives a deposit request against a set of nodes.
#[derive(Debug)]
pub struct ClaimAgent<W: DepositWork, M = NoopMetrics> {
    request: DepositRequest<W>,
    nodes: Vec<NodeAddress>,
    config: AgentConfig,
    metrics: M,
}

impl<W: DepositWork + Clone> ClaimAgent<W> {
    /// Creates an agent that submits `request` to `nodes`.
    pub fn new(request: DepositRequest<W>, nodes: Vec<NodeAddress>, config: AgentConfig) -> Self {
        ClaimAgent {
            request,
            nodes,
            config,
            metrics: NoopMetrics,
        }
    }
}

impl<W: DepositWork + Clone, M: Metrics> ClaimAgent<W, M> {
    /// Reports the agent's exchanges to `metrics`.
    pub fn with_metrics<M2: Metrics>(self, metrics: M2) -> ClaimAgent<W, M2> {
        ClaimAgent {
            request: self.request,
            nodes: self.nodes,
            config: self.config,
            metrics,
        }
    }

    /// The request, with the tickets collected so far.
    pub fn request(&self) -> &DepositRequest<W> {
        &self.request
    }

    /// Replaces the request. Tickets collected for the old request are
    /// dropped.
    pub fn reset(&mut self, request: DepositRequest<W>) {
        self.request = request;
    }

    /// Collects from all nodes concurrently.
    ///
    /// The tickets nodes issued are kept in the agent's request, so a later
    /// call resumes where this one left off.
    pub async fn collect(&mut self) -> Collection<W::Contents> {
        let deadline = Instant::now() + self.config.deposit_withdrawal_timeout;
        let results = future::join_all(
            self.nodes
                .iter()
                .map(|node| self.collect_from(node, deadline)),
        )
        .await;

        let mut collection = Collection {
            withdrawals: BTreeMap::new(),
            receipts: BTreeMap::new(),
            missing: Vec::new(),
            claims: self.request.claims().clone(),
        };
        for (node, result) in self.nodes.iter().zip(results) {
            if let Some(ticket) = result.ticket {
                collection.claims.insert(node.name.clone(), ticket);
            }
            if let Some(receipt) = result.receipt {
                collection.receipts.insert(node.name.clone(), receipt);
            }
            match result.withdrawal {
                Some(withdrawal) => {
                    collection.withdrawals.insert(node.name.clone(), withdrawal);
                }
                None => collection.missing.push(node.name.clone()),
            }
        }
        if !collection.missing.is_empty() {
            info!(missing = ?collection.missing, key = self.request.key(), "nodes missing from collection");
        }
        self.request.set_claims(collection.claims.clone());
        collection
    }

    async fn collect_from(&self, node: &NodeAddress, deadline: Instant) -> NodeResult<W::Contents> {
        let mut request = self.request.clone();
        let mut result = NodeResult {
            withdrawal: None,
            receipt: None,
            ticket: request.claims().get(&node.name).copied(),
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(node = %node.name, "withdrawal timeout reached");
                break;
            }

            let pause = match self.exchange(node, &request, remaining).await {
                Outcome::Response(receipt) => {
                    request.update_claims(&receipt);
                    result.ticket = Some(receipt.ticket);
                    let disposition = receipt.disposition();
                    let progress = receipt.progress;
                    debug!(node = %node.name, ticket = %receipt.ticket, ?disposition, %progress, "deposit receipt");
                    if disposition.is_terminal() {
                        result.withdrawal = receipt.withdrawal.clone();
                        result.receipt = Some(receipt);
                        break;
                    }
                    result.receipt = Some(receipt);

                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match progress.estimated_remaining() {
                        Some(eta) if eta > remaining => {
                            info!(
                                node = %node.name,
                                eta = %humantime::format_duration(eta),
                                "giving up on node: work will not finish in time"
                            );
                            break;
                        }
                        Some(eta) if !eta.is_zero() => eta,
                        _ => self.config.deposit_poll_interval,
                    }
                }
                Outcome::NullResponse | Outcome::NoResponse => self.config.deposit_poll_interval,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(pause.min(remaining)).await;
        }
        result
    }

    /// Runs one exchange with `node`, bounded by the response timeout and
    /// `remaining`.
    async fn exchange(
        &self,
        node: &NodeAddress,
        request: &DepositRequest<W>,
        remaining: Duration,
    ) -> Outcome<DepositReceipt<W::Contents>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = TimeBoundedConnector::new(
            node.address.clone(),
            request.clone(),
            self.config.connector.connect_retry_interval,
            tx,
            self.config.deposit_response_timeout.min(remaining),
        )
        .watchdog_slice(self.config.connector.watchdog_slice)
        .with_metrics(self.metrics.clone());
        let handle = connector.handle();
        connector.run().await;
        let outcome = rx.recv().await.unwrap_or(Outcome::NoResponse);
        if outcome.is_no_response() {
            if let Some(err) = handle.error() {
                debug!(node = %node.name, "no deposit receipt: {err}");
            }
        }
        outcome
    }
}
