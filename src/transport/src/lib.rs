// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Time-bounded request/response exchanges over TCP.
//!
//! A [`Messenger`] moves one framed request and one framed response over a
//! connection. A [`TimeBoundedConnector`] drives a single exchange on the
//! client side and guarantees an upper bound on how long it takes: a
//! [`Watchdog`] severs the connection once the time limit passes, turning a
//! hung peer into a failed exchange.
//!
//! Receiving peers call [`Messenger::receive_message`] with request types
//! that implement [`Respond`], which computes the response inline before it
//! is written back.

#![warn(missing_docs)]

mod codec;
mod config;
mod connector;
mod error;
mod messenger;
mod metrics;
mod watchdog;

pub use crate::codec::{MAX_FRAME_LEN, Message, read_message, write_message};
pub use crate::config::ConnectorConfig;
pub use crate::connector::{
    ConnectorHandle, ConnectorState, INFO_MIN_RETRIES, Outcome, TimeBoundedConnector,
};
pub use crate::error::{Error, SeverReason};
pub use crate::messenger::{ExchangeTimings, Messenger, NullMessage, Respond};
pub use crate::metrics::{ExchangeMetrics, Metrics, NoopMetrics, Phase};
pub use crate::watchdog::{Severer, Watchdog};
