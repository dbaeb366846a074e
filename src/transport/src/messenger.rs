// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! One request/response exchange over an open duplex stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

use crate::codec::{Message, read_message, write_message};
use crate::error::Error;
use crate::metrics::{Metered, Metrics, NoopMetrics, Phase};

/// A request that knows how to compute its own response.
///
/// [`Messenger::receive_message`] calls [`Respond::respond`] synchronously,
/// between reading the request and writing the response, so implementations
/// must be quick: any long computation belongs to a later, separate step.
pub trait Respond<C>: Message {
    /// The response type.
    type Response: Message;

    /// Computes the response. `None` sends an empty response, which the
    /// sender observes as `Ok(None)`.
    fn respond(&mut self, ctx: &C) -> Option<Self::Response>;
}

/// A message that carries nothing and is answered with an empty response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullMessage;

impl<C> Respond<C> for NullMessage {
    type Response = NullMessage;

    fn respond(&mut self, _ctx: &C) -> Option<NullMessage> {
        None
    }
}

/// How long the phases of the last exchange took.
///
/// Phases that the last exchange did not have are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeTimings {
    /// Reading the peer's message.
    pub receive: Option<Duration>,
    /// Computing the response.
    pub respond: Option<Duration>,
    /// Writing and flushing our message.
    pub send: Option<Duration>,
}

/// Sends and receives framed messages over one connection.
///
/// A messenger drives one exchange at a time; its methods take `&mut self`.
#[derive(Debug)]
pub struct Messenger<S, M = NoopMetrics> {
    stream: Metered<S, M>,
    timings: ExchangeTimings,
}

impl<S> Messenger<S, NoopMetrics>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream`.
    pub fn new(stream: S) -> Self {
        Self::with_metrics(stream, NoopMetrics)
    }
}

impl<S, M> Messenger<S, M>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: Metrics,
{
    /// Wraps `stream`, reporting to `metrics`.
    pub fn with_metrics(stream: S, metrics: M) -> Self {
        Messenger {
            stream: Metered::new(stream, metrics),
            timings: ExchangeTimings::default(),
        }
    }

    /// Sends `msg` and waits for the peer's response.
    ///
    /// Returns `Ok(None)` if the peer answered with an empty response.
    pub async fn send_message<Out, In>(&mut self, msg: &Out) -> Result<Option<In>, Error>
    where
        Out: Message,
        In: Message,
    {
        self.timings = ExchangeTimings::default();
        trace!(?msg, "sending message");

        let start = Instant::now();
        write_message(&mut self.stream, msg).await?;
        self.stream.flush().await?;
        self.record(Phase::Send, start.elapsed());

        let start = Instant::now();
        let response: Option<In> = read_message(&mut self.stream).await?;
        self.record(Phase::Receive, start.elapsed());
        trace!(?response, "received response");

        Ok(response)
    }

    /// Reads one request, writes the response it computes for itself, and
    /// returns the request for further handling.
    pub async fn receive_message<C, Req>(&mut self, ctx: &C) -> Result<Req, Error>
    where
        Req: Respond<C>,
    {
        self.timings = ExchangeTimings::default();

        let start = Instant::now();
        let mut request: Req = read_message(&mut self.stream).await?;
        self.record(Phase::Receive, start.elapsed());
        trace!(?request, "received message");

        let start = Instant::now();
        let response = request.respond(ctx);
        self.record(Phase::Respond, start.elapsed());

        let start = Instant::now();
        write_message(&mut self.stream, &response).await?;
        self.stream.flush().await?;
        self.record(Phase::Send, start.elapsed());
        trace!(?response, "sent response");

        Ok(request)
    }

    fn record(&mut self, phase: Phase, elapsed: Duration) {
        match phase {
            Phase::Receive => self.timings.receive = Some(elapsed),
            Phase::Respond => self.timings.respond = Some(elapsed),
            Phase::Send => self.timings.send = Some(elapsed),
        }
        self.stream.metrics_mut().phase_completed(phase, elapsed);
    }

    /// The timings of the last exchange, complete or not.
    pub fn timings(&self) -> ExchangeTimings {
        self.timings
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Unwraps the stream.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use sdb_ore::metrics::{self, MetricsRegistry};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::metrics::ExchangeMetrics;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add(u32, u32);

    impl Respond<u32> for Add {
        type Response = u32;

        fn respond(&mut self, offset: &u32) -> Option<u32> {
            Some(self.0 + self.1 + offset)
        }
    }

    fn pair() -> (Messenger<DuplexStream>, Messenger<DuplexStream>) {
        let (a, b) = tokio::io::duplex(4096);
        (Messenger::new(a), Messenger::new(b))
    }

    #[sdb_ore::test(tokio::test)]
    async fn request_response() {
        let (mut client, mut server) = pair();
        let serve = async {
            let request: Add = server.receive_message(&100u32).await.expect("receive");
            (request.0, request.1, server.timings())
        };
        let (response, (a, b, timings)) =
            tokio::join!(client.send_message::<_, u32>(&Add(1, 2)), serve);
        assert_eq!(response.expect("send"), Some(103));
        assert_eq!((a, b), (1, 2));
        assert!(timings.receive.is_some());
        assert!(timings.respond.is_some());
        assert!(timings.send.is_some());

        let timings = client.timings();
        assert!(timings.send.is_some());
        assert!(timings.receive.is_some());
        assert!(timings.respond.is_none());
    }

    #[sdb_ore::test(tokio::test)]
    async fn null_response_is_not_an_error() {
        let (mut client, mut server) = pair();
        let serve = server.receive_message::<(), NullMessage>(&());
        let (response, request) =
            tokio::join!(client.send_message::<_, NullMessage>(&NullMessage), serve);
        sdb_ore::assert_none!(response.expect("send"));
        assert_eq!(request.expect("receive"), NullMessage);
    }

    #[sdb_ore::test(tokio::test)]
    async fn peer_hangup_is_io_error() {
        let (mut client, server) = pair();
        drop(server);
        let err = client
            .send_message::<_, u32>(&Add(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
    }

    #[sdb_ore::test(tokio::test)]
    async fn metrics_are_reported() {
        let registry = MetricsRegistry::new();
        let exchange_metrics = ExchangeMetrics::register_into(&registry);
        let (a, b) = tokio::io::duplex(4096);
        let mut client = Messenger::with_metrics(a, exchange_metrics.clone());
        let mut server = Messenger::with_metrics(b, exchange_metrics);
        let (response, _) = tokio::join!(
            client.send_message::<_, u32>(&Add(2, 2)),
            server.receive_message::<u32, Add>(&0),
        );
        assert_eq!(response.expect("send"), Some(4));

        let sent = metrics::counter_value(
            &registry,
            "sdb_transport_bytes_total",
            &[("direction", "sent")],
        )
        .expect("bytes sent recorded");
        let received = metrics::counter_value(
            &registry,
            "sdb_transport_bytes_total",
            &[("direction", "received")],
        )
        .expect("bytes received recorded");
        assert!(sent > 0.0);
        assert_eq!(sent, received);
    }
}
