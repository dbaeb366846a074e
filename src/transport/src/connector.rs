// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Single request/response exchanges with a bounded wall-clock time.
//!
//! A [`TimeBoundedConnector`] connects to a peer, retrying while the peer
//! refuses connections, sends one message and reads one response. Both the
//! connect phase and the exchange are bounded by the connector's time limit;
//! the exchange is bounded by a [`Watchdog`] that severs the connection, so
//! a silent peer cannot hold the connector past its limit.
//!
//! Exactly one [`Outcome`] is delivered to the results channel per run,
//! whatever happens. Errors are retained on the [`ConnectorHandle`] for
//! diagnostics rather than delivered.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sdb_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::Message;
use crate::config::ConnectorConfig;
use crate::error::{Error, SeverReason};
use crate::messenger::Messenger;
use crate::metrics::{Metrics, NoopMetrics};
use crate::watchdog::{Severer, Watchdog};

/// The number of refused connection attempts after which retries are logged
/// at info rather than debug.
pub const INFO_MIN_RETRIES: usize = 5;

/// What a connector delivers to its results channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<In> {
    /// The peer responded.
    Response(In),
    /// The peer answered with a legitimately empty response.
    NullResponse,
    /// There is no response: connecting failed or timed out, the exchange
    /// was severed, or it failed. The handle has the error.
    NoResponse,
}

impl<In> Outcome<In> {
    /// The response, if there was one.
    pub fn into_response(self) -> Option<In> {
        match self {
            Outcome::Response(response) => Some(response),
            Outcome::NullResponse | Outcome::NoResponse => None,
        }
    }

    /// Reports whether the exchange failed to produce any answer.
    pub fn is_no_response(&self) -> bool {
        matches!(self, Outcome::NoResponse)
    }
}

/// The life cycle of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Not yet running.
    Idle,
    /// Trying to connect.
    Connecting,
    /// Connected; the exchange has not started.
    Connected,
    /// Waiting on the exchange.
    Exchanging,
    /// The exchange completed.
    Done,
    /// Connecting or the exchange ran out of time, or the connector was
    /// shut down while connecting.
    TimedOut,
    /// The connection or the exchange failed.
    Failed,
}

impl ConnectorState {
    /// Reports whether the connector has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectorState::Done | ConnectorState::TimedOut | ConnectorState::Failed
        )
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectorState::Idle => "idle",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Connected => "connected",
            ConnectorState::Exchanging => "exchanging",
            ConnectorState::Done => "done",
            ConnectorState::TimedOut => "timed out",
            ConnectorState::Failed => "failed",
        })
    }
}

/// Observes and controls a connector from outside the task running it.
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<ConnectorState>,
    error: Arc<Mutex<Option<Arc<Error>>>>,
}

impl ConnectorHandle {
    /// Stops the connector. A connection in progress is severed, and the
    /// connector delivers [`Outcome::NoResponse`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The connector's current state.
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Reports whether the connector is connecting or exchanging.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ConnectorState::Connecting | ConnectorState::Connected | ConnectorState::Exchanging
        )
    }

    /// The error that ended the connector, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.error.lock().expect("lock poisoned").clone()
    }

    /// Waits for the connector to reach a terminal state and returns it.
    ///
    /// Returns the last state seen if the connector is dropped first.
    pub async fn finished(&self) -> ConnectorState {
        let mut state = self.state.clone();
        if state.wait_for(ConnectorState::is_terminal).await.is_err() {
            debug!("connector dropped before finishing");
        }
        let current = *state.borrow();
        current
    }
}

/// Sends one message to one peer and delivers the response, within a time
/// limit.
pub struct TimeBoundedConnector<Out, In, M = NoopMetrics> {
    address: String,
    message: Out,
    retry_interval: Duration,
    time_limit: Duration,
    watchdog_slice: Duration,
    results: mpsc::UnboundedSender<Outcome<In>>,
    metrics: M,
    shutdown: CancellationToken,
    state: watch::Sender<ConnectorState>,
    error: Arc<Mutex<Option<Arc<Error>>>>,
    _response: PhantomData<fn() -> In>,
}

impl<Out, In, M> fmt::Debug for TimeBoundedConnector<Out, In, M>
where
    Out: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeBoundedConnector")
            .field("address", &self.address)
            .field("message", &self.message)
            .field("retry_interval", &self.retry_interval)
            .field("time_limit", &self.time_limit)
            .field("watchdog_slice", &self.watchdog_slice)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<Out, In> TimeBoundedConnector<Out, In, NoopMetrics>
where
    Out: Message,
    In: Message,
{
    /// Creates a connector that sends `message` to `address`.
    ///
    /// Refused connections are retried every `retry_interval` until
    /// `time_limit` passes. Once connected, the exchange gets its own
    /// `time_limit`.
    pub fn new(
        address: impl Into<String>,
        message: Out,
        retry_interval: Duration,
        results: mpsc::UnboundedSender<Outcome<In>>,
        time_limit: Duration,
    ) -> Self {
        TimeBoundedConnector {
            address: address.into(),
            message,
            retry_interval,
            time_limit,
            watchdog_slice: ConnectorConfig::default().watchdog_slice,
            results,
            metrics: NoopMetrics,
            shutdown: CancellationToken::new(),
            state: watch::Sender::new(ConnectorState::Idle),
            error: Arc::new(Mutex::new(None)),
            _response: PhantomData,
        }
    }

    /// Creates a connector with its timing taken from `config`.
    pub fn from_config(
        address: impl Into<String>,
        message: Out,
        config: &ConnectorConfig,
        results: mpsc::UnboundedSender<Outcome<In>>,
    ) -> Self {
        Self::new(
            address,
            message,
            config.connect_retry_interval,
            results,
            config.exchange_time_limit,
        )
        .watchdog_slice(config.watchdog_slice)
    }
}

impl<Out, In, M> TimeBoundedConnector<Out, In, M>
where
    Out: Message,
    In: Message,
    M: Metrics,
{
    /// Sets how often the watchdog checks whether to stand down.
    pub fn watchdog_slice(mut self, slice: Duration) -> Self {
        self.watchdog_slice = slice;
        self
    }

    /// Reports exchanges to `metrics`.
    pub fn with_metrics<M2: Metrics>(self, metrics: M2) -> TimeBoundedConnector<Out, In, M2> {
        TimeBoundedConnector {
            address: self.address,
            message: self.message,
            retry_interval: self.retry_interval,
            time_limit: self.time_limit,
            watchdog_slice: self.watchdog_slice,
            results: self.results,
            metrics,
            shutdown: self.shutdown,
            state: self.state,
            error: self.error,
            _response: PhantomData,
        }
    }

    /// Returns a handle to observe and shut down this connector.
    pub fn handle(&self) -> ConnectorHandle {
        ConnectorHandle {
            shutdown: self.shutdown.clone(),
            state: self.state.subscribe(),
            error: Arc::clone(&self.error),
        }
    }

    /// Runs the connector on a new task.
    pub fn spawn(self) -> AbortOnDropHandle<()> {
        let name = format!("connector:{}", self.address);
        task::spawn(|| name, self.run()).abort_on_drop()
    }

    /// Connects, exchanges, and delivers exactly one outcome.
    pub async fn run(self) {
        let outcome = match self.connect().await {
            Ok(stream) => self.exchange(stream).await,
            Err(err @ (Error::ConnectTimedOut { .. } | Error::Cancelled)) => {
                self.finish_with_error(ConnectorState::TimedOut, err);
                Outcome::NoResponse
            }
            Err(err) => {
                self.finish_with_error(ConnectorState::Failed, err);
                Outcome::NoResponse
            }
        };
        if self.results.send(outcome).is_err() {
            debug!(address = %self.address, "connector result dropped: receiver gone");
        }
    }

    async fn connect(&self) -> Result<TcpStream, Error> {
        self.state.send_replace(ConnectorState::Connecting);
        let deadline = Instant::now() + self.time_limit;
        let mut attempts = 0;
        let mut last_error = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;
            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                attempt = tokio::time::timeout(remaining, TcpStream::connect(&self.address)) => attempt,
            };
            match attempt {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(address = %self.address, "setting TCP_NODELAY: {err}");
                    }
                    debug!(address = %self.address, attempts, "connected");
                    return Ok(stream);
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    if attempts >= INFO_MIN_RETRIES {
                        info!(address = %self.address, attempts, "connection refused, retrying: {err}");
                    } else {
                        debug!(address = %self.address, attempts, "connection refused, retrying: {err}");
                    }
                    last_error = Some(err);
                }
                Ok(Err(err)) => {
                    warn!(address = %self.address, attempts, "connecting failed: {err}");
                    return Err(Error::Io(err));
                }
                // The attempt itself outlived the deadline.
                Err(_elapsed) => break,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.retry_interval.min(remaining)) => {}
            }
        }

        match &last_error {
            Some(err) => warn!(
                address = %self.address,
                attempts,
                "giving up connecting after {}: {err}",
                humantime::format_duration(self.time_limit)
            ),
            None => warn!(
                address = %self.address,
                attempts,
                "giving up connecting after {}",
                humantime::format_duration(self.time_limit)
            ),
        }
        Err(Error::ConnectTimedOut {
            address: self.address.clone(),
            attempts,
            last_error,
        })
    }

    async fn exchange(&self, stream: TcpStream) -> Outcome<In> {
        self.state.send_replace(ConnectorState::Connected);
        let severer = match Severer::new(&stream) {
            Ok(severer) => severer,
            Err(err) => {
                self.finish_with_error(ConnectorState::Failed, Error::Io(err));
                return Outcome::NoResponse;
            }
        };
        let watchdog = Watchdog::start(severer.clone(), self.time_limit, self.watchdog_slice);
        let mut messenger = Messenger::with_metrics(stream, self.metrics.clone());

        self.state.send_replace(ConnectorState::Exchanging);
        let result = tokio::select! {
            biased;
            reason = severer.severed() => Err(Error::Severed(reason)),
            _ = self.shutdown.cancelled() => {
                severer.sever(SeverReason::Shutdown);
                Err(Error::Severed(SeverReason::Shutdown))
            }
            result = messenger.send_message::<Out, In>(&self.message) => result,
        };
        watchdog.stand_down();
        trace!(address = %self.address, timings = ?messenger.timings(), "exchange finished");

        match result {
            Ok(Some(response)) => {
                self.state.send_replace(ConnectorState::Done);
                Outcome::Response(response)
            }
            Ok(None) => {
                self.state.send_replace(ConnectorState::Done);
                Outcome::NullResponse
            }
            Err(err) => {
                debug!(address = %self.address, "exchange failed: {err}");
                let state = if err.is_timeout() {
                    ConnectorState::TimedOut
                } else {
                    ConnectorState::Failed
                };
                self.finish_with_error(state, err);
                Outcome::NoResponse
            }
        }
    }

    fn finish_with_error(&self, state: ConnectorState, err: Error) {
        // The error must be visible by the time the state turns terminal.
        *self.error.lock().expect("lock poisoned") = Some(Arc::new(err));
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sdb_ore::test]
    fn terminal_states() {
        use ConnectorState::*;
        for state in [Idle, Connecting, Connected, Exchanging] {
            assert!(!state.is_terminal(), "{state}");
        }
        for state in [Done, TimedOut, Failed] {
            assert!(state.is_terminal(), "{state}");
        }
    }

    #[sdb_ore::test]
    fn outcome_accessors() {
        assert_eq!(Outcome::Response(3).into_response(), Some(3));
        sdb_ore::assert_none!(Outcome::<u32>::NullResponse.into_response());
        assert!(Outcome::<u32>::NoResponse.is_no_response());
        assert!(!Outcome::<u32>::NullResponse.is_no_response());
    }

    #[sdb_ore::test(tokio::test)]
    async fn shutdown_before_run_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = TimeBoundedConnector::<u32, u32>::new(
            "127.0.0.1:1",
            7,
            Duration::from_millis(10),
            tx,
            Duration::from_secs(5),
        );
        let handle = connector.handle();
        assert_eq!(handle.state(), ConnectorState::Idle);
        handle.shutdown();
        connector.run().await;
        assert_eq!(rx.recv().await, Some(Outcome::NoResponse));
        assert_eq!(handle.finished().await, ConnectorState::TimedOut);
        let err = handle.error().expect("error retained");
        assert!(matches!(*err, Error::Cancelled), "{err}");
    }
}
