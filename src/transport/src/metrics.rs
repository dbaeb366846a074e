// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Metrics support for messengers.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use sdb_ore::cast::CastFrom;
use sdb_ore::metric;
use sdb_ore::metrics::{Histogram, HistogramVec, IntCounter, IntCounterVec, MetricsRegistry};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A phase of one message exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading the peer's message.
    Receive,
    /// Computing the response to a received request.
    Respond,
    /// Writing and flushing our message.
    Send,
}

impl Phase {
    /// A short, stable name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Receive => "receive",
            Phase::Respond => "respond",
            Phase::Send => "send",
        }
    }
}

/// A trait for types that observe messenger metric events.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Callback reporting numbers of bytes sent.
    fn bytes_sent(&mut self, len: usize);
    /// Callback reporting numbers of bytes received.
    fn bytes_received(&mut self, len: usize);
    /// Callback reporting how long a phase of an exchange took.
    fn phase_completed(&mut self, phase: Phase, elapsed: Duration);
}

/// No-op [`Metrics`] implementation that ignores all events.
#[derive(Debug, Clone)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn bytes_sent(&mut self, _len: usize) {}
    fn bytes_received(&mut self, _len: usize) {}
    fn phase_completed(&mut self, _phase: Phase, _elapsed: Duration) {}
}

/// Prometheus-backed [`Metrics`].
#[derive(Debug, Clone)]
pub struct ExchangeMetrics {
    bytes_sent: IntCounter,
    bytes_received: IntCounter,
    receive_seconds: Histogram,
    respond_seconds: Histogram,
    send_seconds: Histogram,
}

impl ExchangeMetrics {
    /// Registers the exchange metrics into `registry`.
    pub fn register_into(registry: &MetricsRegistry) -> ExchangeMetrics {
        let bytes: IntCounterVec = registry.register(metric!(
            name: "sdb_transport_bytes_total",
            help: "Message bytes moved by messengers, by direction.",
            var_labels: ["direction"],
        ));
        let phases: HistogramVec = registry.register(metric!(
            name: "sdb_transport_exchange_phase_seconds",
            help: "Time spent in each phase of a message exchange.",
            var_labels: ["phase"],
        ));
        ExchangeMetrics {
            bytes_sent: bytes.with_label_values(&["sent"]),
            bytes_received: bytes.with_label_values(&["received"]),
            receive_seconds: phases.with_label_values(&[Phase::Receive.as_str()]),
            respond_seconds: phases.with_label_values(&[Phase::Respond.as_str()]),
            send_seconds: phases.with_label_values(&[Phase::Send.as_str()]),
        }
    }
}

impl Metrics for ExchangeMetrics {
    fn bytes_sent(&mut self, len: usize) {
        self.bytes_sent.inc_by(u64::cast_from(len));
    }

    fn bytes_received(&mut self, len: usize) {
        self.bytes_received.inc_by(u64::cast_from(len));
    }

    fn phase_completed(&mut self, phase: Phase, elapsed: Duration) {
        let histogram = match phase {
            Phase::Receive => &self.receive_seconds,
            Phase::Respond => &self.respond_seconds,
            Phase::Send => &self.send_seconds,
        };
        histogram.observe(elapsed.as_secs_f64());
    }
}

/// Stream wrapper that transparently logs `bytes_received` and `bytes_sent`
/// metrics.
#[pin_project::pin_project]
#[derive(Debug)]
pub(crate) struct Metered<S, M> {
    #[pin]
    inner: S,
    metrics: M,
}

impl<S, M> Metered<S, M> {
    pub fn new(inner: S, metrics: M) -> Self {
        Self { inner, metrics }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn metrics_mut(&mut self) -> &mut M {
        &mut self.metrics
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, M> AsyncRead for Metered<S, M>
where
    S: AsyncRead,
    M: Metrics,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let initial_len = buf.filled().len();

        let this = self.project();
        let poll = this.inner.poll_read(cx, buf);

        let len = buf.filled().len() - initial_len;
        if len > 0 {
            this.metrics.bytes_received(len);
        }

        poll
    }
}

impl<S, M> AsyncWrite for Metered<S, M>
where
    S: AsyncWrite,
    M: Metrics,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.project();
        let poll = this.inner.poll_write(cx, buf);

        if let Poll::Ready(Ok(len)) = &poll
            && *len > 0
        {
            this.metrics.bytes_sent(*len);
        }

        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
