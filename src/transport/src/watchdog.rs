// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Forcible, time-bounded closing of connections.

use std::io;
use std::net::Shutdown;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sdb_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use socket2::{SockRef, Socket};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SeverReason;

/// The shortest slice a watchdog sleeps for between checks.
const MIN_SLICE: Duration = Duration::from_millis(1);

/// Closes a TCP connection from outside the task that drives it.
///
/// Severing shuts down both halves of the socket, so a read or write blocked
/// on the connection fails instead of hanging. Clones sever the same
/// connection; the first reason given wins.
#[derive(Debug, Clone)]
pub struct Severer {
    socket: Arc<Socket>,
    severed: CancellationToken,
    reason: Arc<Mutex<Option<SeverReason>>>,
}

impl Severer {
    /// Creates a severer for `stream`.
    pub fn new(stream: &TcpStream) -> Result<Severer, io::Error> {
        let socket = SockRef::from(stream).try_clone()?;
        Ok(Severer {
            socket: Arc::new(socket),
            severed: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        })
    }

    /// Severs the connection. Returns whether this call did the severing.
    pub fn sever(&self, reason: SeverReason) -> bool {
        {
            let mut current = self.reason.lock().expect("lock poisoned");
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        // Observers of `severed` must see the reason before the socket
        // errors out underneath them.
        self.severed.cancel();
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            // The peer may have closed the connection first.
            debug!(%reason, "shutting down severed socket: {err}");
        }
        true
    }

    /// The reason the connection was severed, if it was.
    pub fn reason(&self) -> Option<SeverReason> {
        *self.reason.lock().expect("lock poisoned")
    }

    /// Waits until the connection is severed and returns why.
    pub async fn severed(&self) -> SeverReason {
        self.severed.cancelled().await;
        self.reason().expect("reason recorded before cancellation")
    }
}

/// Severs a connection once a time limit passes, unless told to stand down
/// first.
///
/// The watchdog checks for a stand-down every `slice`, so it takes at most
/// one slice past the limit to sever and at most one slice to notice a
/// stand-down.
#[derive(Debug)]
pub struct Watchdog {
    stand_down: CancellationToken,
    task: AbortOnDropHandle<bool>,
}

impl Watchdog {
    /// Starts a watchdog that severs the connection behind `severer` after
    /// `time_limit`.
    pub fn start(severer: Severer, time_limit: Duration, slice: Duration) -> Watchdog {
        let stand_down = CancellationToken::new();
        let slice = slice.max(MIN_SLICE);
        let task = task::spawn(|| "watchdog", {
            let stand_down = stand_down.clone();
            async move {
                let deadline = Instant::now() + time_limit;
                loop {
                    if stand_down.is_cancelled() {
                        return false;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tokio::time::sleep(slice.min(deadline - now)).await;
                }
                info!(
                    time_limit = %humantime::format_duration(time_limit),
                    "watchdog severing connection"
                );
                severer.sever(SeverReason::TimeLimit(time_limit))
            }
        })
        .abort_on_drop();
        Watchdog { stand_down, task }
    }

    /// Tells the watchdog to stand down without waiting for it.
    pub fn stand_down(&self) {
        self.stand_down.cancel();
    }

    /// Tells the watchdog to stand down and waits for it to exit. Returns
    /// whether it severed the connection.
    pub async fn join(self) -> bool {
        self.stand_down.cancel();
        self.task.join().await.unwrap_or(false)
    }
}
