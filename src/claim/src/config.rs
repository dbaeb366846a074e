// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Claim store configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Command line arguments for a claim store.
///
/// Hosts embed this with `#[clap(flatten)]`.
#[derive(Debug, Clone, clap::Parser)]
pub struct ClaimStoreConfig {
    /// The number of lock shards for the key index and the drawers.
    ///
    /// Reservations for keys in different shards never contend.
    #[clap(long, env = "SDB_CLAIM_STORE_SHARDS", default_value = "16")]
    pub claim_store_shards: NonZeroUsize,
    /// How often housekeeping sweeps expired drawers.
    #[clap(
        long,
        env = "SDB_CLAIM_STORE_HOUSEKEEPING_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "10s"
    )]
    pub claim_store_housekeeping_interval: Duration,
    /// How long an incinerated drawer is remembered, so that withdrawals of
    /// an expired ticket keep reporting it as expired.
    #[clap(
        long,
        env = "SDB_CLAIM_STORE_TOMBSTONE_TTL",
        value_parser = humantime::parse_duration,
        default_value = "10min"
    )]
    pub claim_store_tombstone_ttl: Duration,
}

impl Default for ClaimStoreConfig {
    fn default() -> Self {
        ClaimStoreConfig {
            claim_store_shards: NonZeroUsize::new(16).expect("nonzero"),
            claim_store_housekeeping_interval: Duration::from_secs(10),
            claim_store_tombstone_ttl: Duration::from_secs(10 * 60),
        }
    }
}
