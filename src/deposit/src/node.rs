// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The receiving side of deposit requests.

use std::fmt;
use std::io;
use std::sync::Arc;

use sdb_claim::ClaimStore;
use sdb_ore::task;
use sdb_transport::{Messenger, Metrics, NoopMetrics};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, trace};

use crate::request::{DepositRequest, DepositWork};

/// What a node hands to the deposit requests it receives: its name, its
/// claim store, and the context its work runs against.
pub struct DepositNode<W: DepositWork, M = NoopMetrics> {
    name: String,
    store: Arc<ClaimStore<W::Contents>>,
    context: Arc<W::Context>,
    metrics: M,
}

impl<W: DepositWork> DepositNode<W> {
    /// Creates a node named `name`.
    ///
    /// The name is what clients key their tickets for this node by, so it
    /// must be unique among the nodes a client talks to.
    pub fn new(
        name: impl Into<String>,
        store: Arc<ClaimStore<W::Contents>>,
        context: Arc<W::Context>,
    ) -> Self {
        DepositNode {
            name: name.into(),
            store,
            context,
            metrics: NoopMetrics,
        }
    }
}

impl<W: DepositWork, M> DepositNode<W, M> {
    /// Reports the node's exchanges to `metrics`.
    pub fn with_metrics<M2: Metrics>(self, metrics: M2) -> DepositNode<W, M2> {
        DepositNode {
            name: self.name,
            store: self.store,
            context: self.context,
            metrics,
        }
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's claim store.
    pub fn store(&self) -> &Arc<ClaimStore<W::Contents>> {
        &self.store
    }

    /// The context work runs against.
    pub fn context(&self) -> &W::Context {
        &self.context
    }
}

impl<W: DepositWork, M: Metrics> DepositNode<W, M> {
    /// Accepts connections on `listener` and serves one deposit exchange on
    /// each, until accepting fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), io::Error> {
        info!(node = %self.name, address = ?listener.local_addr()?, "serving deposit requests");
        loop {
            let (stream, peer) = listener.accept().await?;
            let node = Arc::clone(&self);
            task::spawn(|| format!("deposit-exchange:{peer}"), async move {
                if let Err(err) = node.serve_connection(stream).await {
                    debug!(node = %node.name, %peer, "deposit exchange failed: {err}");
                }
            });
        }
    }

    /// Serves one deposit exchange on `stream`.
    ///
    /// The receipt is written before the request's work is started, on a
    /// blocking thread that outlives the exchange.
    pub async fn serve_connection<S>(self: &Arc<Self>, stream: S) -> Result<(), sdb_transport::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut messenger = Messenger::with_metrics(stream, self.metrics.clone());
        let mut request: DepositRequest<W> = messenger.receive_message(&**self).await?;
        trace!(node = %self.name, key = request.key(), timings = ?messenger.timings(), "answered deposit request");
        if request.needs_handling() {
            let node = Arc::clone(self);
            task::spawn_blocking(
                || "deposit-work",
                move || {
                    let deposited = request.handle(&node);
                    trace!(node = %node.name, key = request.key(), ?deposited, "deposit work finished");
                },
            );
        }
        Ok(())
    }
}

impl<W: DepositWork, M> fmt::Debug for DepositNode<W, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepositNode")
            .field("name", &self.name)
            .field("store", &self.store.admin_info())
            .finish_non_exhaustive()
    }
}
