// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connector configuration.

use std::time::Duration;

/// Command line arguments for time-bounded connectors.
///
/// Hosts embed this with `#[clap(flatten)]`.
#[derive(Debug, Clone, clap::Parser)]
pub struct ConnectorConfig {
    /// How long to wait between connection attempts refused by the peer.
    #[clap(
        long,
        env = "SDB_CONNECT_RETRY_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "100ms"
    )]
    pub connect_retry_interval: Duration,
    /// The time budget for connecting, and separately for the exchange once
    /// connected.
    #[clap(
        long,
        env = "SDB_EXCHANGE_TIME_LIMIT",
        value_parser = humantime::parse_duration,
        default_value = "30s"
    )]
    pub exchange_time_limit: Duration,
    /// How often the watchdog checks whether it was told to stand down.
    #[clap(
        long,
        env = "SDB_WATCHDOG_SLICE",
        value_parser = humantime::parse_duration,
        default_value = "100ms"
    )]
    pub watchdog_slice: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            connect_retry_interval: Duration::from_millis(100),
            exchange_time_limit: Duration::from_secs(30),
            watchdog_slice: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[sdb_ore::test]
    fn defaults_match_parser() {
        let parsed = ConnectorConfig::parse_from(["sdb"]);
        let default = ConnectorConfig::default();
        assert_eq!(parsed.connect_retry_interval, default.connect_retry_interval);
        assert_eq!(parsed.exchange_time_limit, default.exchange_time_limit);
        assert_eq!(parsed.watchdog_slice, default.watchdog_slice);
    }

    #[sdb_ore::test]
    fn parse_durations() {
        let config = ConnectorConfig::parse_from([
            "sdb",
            "--exchange-time-limit",
            "1m 30s",
            "--watchdog-slice",
            "20ms",
        ]);
        assert_eq!(config.exchange_time_limit, Duration::from_secs(90));
        assert_eq!(config.watchdog_slice, Duration::from_millis(20));
        assert!(ConnectorConfig::try_parse_from(["sdb", "--watchdog-slice", "soon"]).is_err());
    }
}
