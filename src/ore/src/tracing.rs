// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tracing utilities.
//!
//! This module contains application tracing configuration for processes that
//! host a claim store or drive deposit exchanges.

use std::io;
use std::str::FromStr;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::format::{Writer, format};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Configures the stderr log.
#[derive(Debug, Clone)]
pub struct StderrLogConfig {
    /// An optional prefix for each stderr log line, usually the node name.
    pub prefix: Option<String>,
    /// A filter which determines which events are emitted to the log.
    pub filter: Targets,
}

impl StderrLogConfig {
    /// Builds a configuration from a filter directive such as
    /// `info,sdb_transport=debug`.
    pub fn from_directives(
        prefix: Option<String>,
        directives: &str,
    ) -> Result<StderrLogConfig, anyhow::Error> {
        Ok(StderrLogConfig {
            prefix,
            filter: Targets::from_str(directives)?,
        })
    }
}

impl Default for StderrLogConfig {
    fn default() -> Self {
        StderrLogConfig {
            prefix: None,
            filter: Targets::new().with_default(Level::INFO),
        }
    }
}

/// Enables application tracing via the [`tracing`] and [`tracing_subscriber`]
/// crates, logging to stderr.
///
/// Fails if a global subscriber has already been installed.
pub fn configure(config: StderrLogConfig) -> Result<(), anyhow::Error> {
    tracing_subscriber::registry()
        .with(log_layer(config, io::stderr))
        .try_init()?;
    Ok(())
}

/// Builds the log layer that [`configure`] installs, writing to
/// `make_writer` instead of stderr.
pub fn log_layer<S, W>(config: StderrLogConfig, make_writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer::<S>()
        .event_format(PrefixFormat {
            inner: format(),
            prefix: config.prefix,
        })
        .with_writer(make_writer)
        .with_ansi(false)
        .with_filter(config.filter)
}

/// Returns the level of a specific target from a [`Targets`].
pub fn target_level(targets: &Targets, target: &str) -> Level {
    if targets.would_enable(target, &Level::TRACE) {
        Level::TRACE
    } else if targets.would_enable(target, &Level::DEBUG) {
        Level::DEBUG
    } else if targets.would_enable(target, &Level::INFO) {
        Level::INFO
    } else if targets.would_enable(target, &Level::WARN) {
        Level::WARN
    } else {
        Level::ERROR
    }
}

/// A wrapper around a [`FormatEvent`] that adds an optional prefix to each
/// event.
#[derive(Debug)]
pub struct PrefixFormat<F> {
    inner: F,
    prefix: Option<String>,
}

impl<F, C, N> FormatEvent<C, N> for PrefixFormat<F>
where
    C: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<C, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, C, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(writer, "{}: ", prefix)?;
        }
        self.inner.format_event(ctx, writer, event)
    }
}
