// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Transport errors.

use std::fmt;
use std::io;
use std::time::Duration;

/// Why a connection was severed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverReason {
    /// The watchdog's time limit ran out.
    TimeLimit(Duration),
    /// The connector was shut down.
    Shutdown,
}

impl fmt::Display for SeverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeverReason::TimeLimit(limit) => {
                write!(f, "time limit of {} exceeded", humantime::format_duration(*limit))
            }
            SeverReason::Shutdown => f.write_str("shut down"),
        }
    }
}

/// An error from a messenger or connector.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading from or writing to the connection failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// The peer announced a frame larger than we accept.
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge {
        /// The announced length.
        len: u64,
        /// The largest length accepted.
        max: u64,
    },
    /// The connection was closed from our side mid-exchange.
    #[error("connection severed: {0}")]
    Severed(SeverReason),
    /// No connection could be established before the deadline.
    #[error("could not connect to {address} after {attempts} attempts")]
    ConnectTimedOut {
        /// The address connected to.
        address: String,
        /// The number of connection attempts made.
        attempts: usize,
        /// The error of the last attempt.
        #[source]
        last_error: Option<io::Error>,
    },
    /// The operation was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error means the time budget ran out, as opposed to the
    /// exchange failing.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Severed(SeverReason::TimeLimit(_)) | Error::ConnectTimedOut { .. }
        )
    }
}
