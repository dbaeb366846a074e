// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Helpers for running deposit nodes in tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use sdb_claim::{ClaimMetrics, ClaimStore, ClaimStoreConfig, UnitCounter};
use sdb_deposit::{DepositNode, DepositWork, NodeAddress};
use sdb_ore::metrics::MetricsRegistry;
use sdb_ore::now::SYSTEM_TIME;
use sdb_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// Sums `0..n`, one unit per addend, sleeping `step_ms` per unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowSum {
    pub n: u64,
    pub step_ms: u64,
    pub fail: bool,
}

impl SlowSum {
    pub fn new(n: u64, step_ms: u64) -> Self {
        SlowSum {
            n,
            step_ms,
            fail: false,
        }
    }
}

/// Counts the computations a node ran.
#[derive(Debug, Default)]
pub struct Runs(AtomicUsize);

impl Runs {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl DepositWork for SlowSum {
    type Contents = u64;
    type Context = Runs;

    fn dedup_key(&self) -> String {
        format!("slow_sum:{}:{}", self.n, self.fail)
    }

    fn generate_contents(&self, runs: &Runs, progress: &UnitCounter) -> Result<u64, anyhow::Error> {
        runs.0.fetch_add(1, Ordering::SeqCst);
        progress.set_to_be_done(self.n);
        let mut sum = 0;
        for i in 0..self.n {
            if progress.is_killed() {
                bail!("killed after {i} units");
            }
            std::thread::sleep(Duration::from_millis(self.step_ms));
            sum += i;
            progress.inc();
        }
        if self.fail {
            bail!("sum of {} refused", self.n);
        }
        Ok(sum)
    }
}

/// A deposit node serving on a local port.
pub struct TestNode {
    pub node: Arc<DepositNode<SlowSum>>,
    pub address: String,
    _server: AbortOnDropHandle<()>,
}

impl TestNode {
    pub async fn start(name: &str) -> TestNode {
        let store = ClaimStore::new(
            &ClaimStoreConfig::default(),
            SYSTEM_TIME.clone(),
            ClaimMetrics::register_into(&MetricsRegistry::new()),
        );
        let node = Arc::new(DepositNode::new(
            name,
            Arc::new(store),
            Arc::new(Runs::default()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr").to_string();
        let server = task::spawn(|| format!("test-node:{name}"), {
            let node = Arc::clone(&node);
            async move {
                if let Err(err) = node.serve(listener).await {
                    panic!("node stopped serving: {err}");
                }
            }
        })
        .abort_on_drop();
        TestNode {
            node,
            address,
            _server: server,
        }
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(self.node.name(), self.address.clone())
    }

    pub fn runs(&self) -> usize {
        self.node.context().get()
    }
}
