// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deposit requests over TCP, against live nodes.

mod util;

use std::time::Duration;

use sdb_claim::{Retention, WithdrawalCode};
use sdb_deposit::{AgentConfig, ClaimAgent, DepositReceipt, DepositRequest, Disposition};
use sdb_transport::{Outcome, TimeBoundedConnector, write_message};
use tokio::sync::mpsc;

use crate::util::{SlowSum, TestNode};

async fn submit(address: &str, request: &DepositRequest<SlowSum>) -> DepositReceipt<u64> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    TimeBoundedConnector::new(
        address,
        request.clone(),
        Duration::from_millis(10),
        tx,
        Duration::from_secs(5),
    )
    .run()
    .await;
    match rx.recv().await {
        Some(Outcome::Response(receipt)) => receipt,
        outcome => panic!("no receipt: {outcome:?}"),
    }
}

fn fast_agent_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.deposit_response_timeout = Duration::from_secs(2);
    config.deposit_withdrawal_timeout = Duration::from_secs(10);
    config.deposit_poll_interval = Duration::from_millis(20);
    config.connector.connect_retry_interval = Duration::from_millis(10);
    config.connector.watchdog_slice = Duration::from_millis(10);
    config
}

#[sdb_ore::test(tokio::test(flavor = "multi_thread"))]
async fn poll_until_retrieved() {
    let node = TestNode::start("n1").await;
    let mut request = DepositRequest::new(SlowSum::new(10, 10));

    let first = submit(&node.address, &request).await;
    assert_eq!(first.node_name, "n1");
    assert_eq!(first.disposition(), Disposition::Pending);
    sdb_ore::assert_none!(first.withdrawal);
    request.update_claims(&first);

    let mut polls = 0;
    let receipt = loop {
        let receipt = submit(&node.address, &request).await;
        assert_eq!(receipt.ticket, first.ticket);
        if !receipt.rain_check() {
            break receipt;
        }
        assert_eq!(
            receipt.withdrawal.as_ref().map(|w| w.code),
            Some(WithdrawalCode::NoDeposit)
        );
        polls += 1;
        assert!(polls < 500, "never filled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(receipt.disposition(), Disposition::Retrieved);
    assert_eq!(receipt.contents(), Some(&45));
    assert_eq!(receipt.progress.done_so_far, Some(10));
    assert_eq!(receipt.progress.to_be_done, Some(10));
    let fill_time = receipt
        .withdrawal
        .as_ref()
        .and_then(|w| w.fill_time())
        .expect("fill time");
    assert!(fill_time >= Duration::from_millis(100), "{fill_time:?}");
    assert_eq!(node.runs(), 1);
}

#[sdb_ore::test(tokio::test(flavor = "multi_thread"))]
async fn failure_reaches_client() {
    let node = TestNode::start("n1").await;
    let mut request = DepositRequest::new(SlowSum {
        n: 2,
        step_ms: 1,
        fail: true,
    });
    request.update_claims(&submit(&node.address, &request).await);

    let receipt = loop {
        let receipt = submit(&node.address, &request).await;
        if !receipt.rain_check() {
            break receipt;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(receipt.disposition(), Disposition::Failed);
    assert_eq!(receipt.failure(), Some("sum of 2 refused"));
}

#[sdb_ore::test(tokio::test(flavor = "multi_thread"))]
async fn expired_request_is_rehandled_on_demand() {
    let node = TestNode::start("n1").await;
    // Too slow to finish within its retention.
    let mut request = DepositRequest::new(SlowSum::new(20, 20))
        .retention(Retention::ExpireAfter(Duration::from_millis(50)));
    let first = submit(&node.address, &request).await;
    request.update_claims(&first);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let expired = submit(&node.address, &request).await;
    assert_eq!(expired.ticket, first.ticket);
    assert_eq!(expired.disposition(), Disposition::Expired);

    let request = request
        .force_rehandle(true)
        .retention(Retention::CacheIndefinitely);
    let fresh = submit(&node.address, &request).await;
    assert_ne!(fresh.ticket, first.ticket);
    assert_eq!(fresh.disposition(), Disposition::Pending);
}

#[sdb_ore::test(tokio::test(flavor = "multi_thread"))]
async fn undelivered_receipt_frees_the_drawer() {
    let node = TestNode::start("n1").await;
    let mut request = DepositRequest::new(SlowSum::new(4, 1));

    // The client sends its request and hangs up before the receipt is
    // written.
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    write_message(&mut client, &request)
        .await
        .expect("write request");
    drop(client);
    let result = node.node.serve_connection(server).await;
    assert!(result.is_err(), "{result:?}");

    let info = node.node.store().admin_info();
    assert_eq!(info.filling, 0, "{info:?}");
    assert_eq!(info.incinerated, 1, "{info:?}");
    sdb_ore::assert_none!(node.node.store().lookup_key(request.key()));
    assert_eq!(node.runs(), 0);

    // The key is not wedged: the next request computes it.
    let first = submit(&node.address, &request).await;
    assert_eq!(first.disposition(), Disposition::Pending);
    request.update_claims(&first);
    let receipt = loop {
        let receipt = submit(&node.address, &request).await;
        if !receipt.rain_check() {
            break receipt;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(receipt.contents(), Some(&6));
    assert_eq!(node.runs(), 1);
}

#[sdb_ore::test(tokio::test(flavor = "multi_thread"))]
async fn agent_collects_from_every_node() {
    let nodes = [TestNode::start("n1").await, TestNode::start("n2").await];
    let mut agent = ClaimAgent::new(
        DepositRequest::new(SlowSum::new(5, 10)),
        nodes.iter().map(TestNode::address).collect(),
        fast_agent_config(),
    );

    let collection = agent.collect().await;
    assert!(collection.missing.is_empty(), "{:?}", collection.missing);
    assert_eq!(collection.response_ratio(), 1.0);
    assert_eq!(
        collection.contents().collect::<Vec<_>>(),
        vec![("n1", &10), ("n2", &10)]
    );
    assert_eq!(collection.claims.len(), 2);
    assert_eq!(agent.request().claims(), &collection.claims);
    for node in &nodes {
        assert_eq!(node.runs(), 1);
    }

    // Collecting again retrieves the cached drawers without recomputing.
    let again = agent.collect().await;
    assert_eq!(again.withdrawals.len(), 2);
    for node in &nodes {
        assert_eq!(node.runs(), 1);
    }
}

#[sdb_ore::test(tokio::test(flavor = "multi_thread"))]
async fn agent_reports_unreachable_nodes() {
    let live = TestNode::start("n1").await;
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        listener.local_addr().expect("local addr").to_string()
    };

    let mut config = fast_agent_config();
    config.deposit_response_timeout = Duration::from_millis(200);
    config.deposit_withdrawal_timeout = Duration::from_secs(1);
    let mut agent = ClaimAgent::new(
        DepositRequest::new(SlowSum::new(3, 1)),
        vec![live.address(), sdb_deposit::NodeAddress::new("n2", dead)],
        config,
    );

    let collection = agent.collect().await;
    assert_eq!(collection.missing, vec!["n2".to_string()]);
    assert_eq!(collection.response_ratio(), 0.5);
    assert_eq!(
        collection.withdrawals.get("n1").and_then(|w| w.contents),
        Some(3)
    );
    sdb_ore::assert_none!(collection.receipts.get("n2"));
}
