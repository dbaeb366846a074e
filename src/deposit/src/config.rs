// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Agent configuration.

use std::time::Duration;

use sdb_transport::ConnectorConfig;

/// Command line arguments for a [`ClaimAgent`](crate::ClaimAgent).
#[derive(Debug, Clone, clap::Parser)]
pub struct AgentConfig {
    /// The time limit for one exchange with one node.
    #[clap(
        long,
        env = "SDB_DEPOSIT_RESPONSE_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "5s"
    )]
    pub deposit_response_timeout: Duration,
    /// How long to keep polling nodes for their withdrawals, in total.
    #[clap(
        long,
        env = "SDB_DEPOSIT_WITHDRAWAL_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "60s"
    )]
    pub deposit_withdrawal_timeout: Duration,
    /// How long to wait before polling a node again when it gives no
    /// estimate of the remaining work.
    #[clap(
        long,
        env = "SDB_DEPOSIT_POLL_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "250ms"
    )]
    pub deposit_poll_interval: Duration,
    /// Timing of the connectors used for each exchange.
    #[clap(flatten)]
    pub connector: ConnectorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            deposit_response_timeout: Duration::from_secs(5),
            deposit_withdrawal_timeout: Duration::from_secs(60),
            deposit_poll_interval: Duration::from_millis(250),
            connector: ConnectorConfig::default(),
        }
    }
}
