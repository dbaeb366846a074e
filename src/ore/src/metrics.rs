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

//! Metrics for the safe deposit box crates.
//!
//! Each subsystem keeps its metrics in a scoped-to-it struct, which gets
//! registered (once) to the host's (or a test's) prometheus registry:
//!
//! ```rust
//! # use sdb_ore::metrics::{IntCounterVec, MetricsRegistry};
//! # use sdb_ore::metric;
//! #[derive(Debug, Clone)]
//! struct Metrics {
//!     pub withdrawals: IntCounterVec,
//! }
//!
//! impl Metrics {
//!     pub fn register_into(registry: &MetricsRegistry) -> Metrics {
//!         Metrics {
//!             withdrawals: registry.register(metric!(
//!                 name: "sdb_withdrawals_total",
//!                 help: "withdrawals by outcome",
//!                 var_labels: ["code"],
//!             )),
//!         }
//!     }
//! }
//! ```

use prometheus::core::{Atomic, Collector, GenericCounter, GenericCounterVec, GenericGauge, Opts};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, Registry};

pub use prometheus::Opts as PrometheusOpts;
pub use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge};

/// Buckets for latencies between one millisecond and one minute.
pub const LATENCY_BUCKETS: [f64; 15] = [
    0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 8.192,
    32.768, 65.536,
];

/// Define a metric for use with [`MetricsRegistry::register`].
#[macro_export]
macro_rules! metric {
    (
        name: $name:expr,
        help: $help:expr
        $(, const_labels: { $($cl_key:expr => $cl_value:expr ),* })?
        $(, var_labels: [ $($vl_name:expr),* ])?
        $(,)?
    ) => {{
        let const_labels: ::std::collections::HashMap<String, String> = (&[
            $($(
                ($cl_key.to_string(), $cl_value.to_string()),
            )*)?
        ]).into_iter().cloned().collect();
        let var_labels: ::std::vec::Vec<String> = vec![
            $(
                $($vl_name.into(),)*
            )?];
        $crate::metrics::PrometheusOpts::new($name, $help)
            .const_labels(const_labels)
            .variable_labels(var_labels)
    }}
}

/// A prometheus registry shared by the subsystems of one process.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Registry,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        MetricsRegistry {
            inner: Registry::new(),
        }
    }

    /// Register a metric defined with the [`metric`] macro.
    ///
    /// Panics if a metric with the same name is already registered; metric
    /// structs are meant to be registered once per registry.
    pub fn register<M>(&self, opts: prometheus::Opts) -> M
    where
        M: MakeCollector,
    {
        let collector = M::make_collector(opts);
        self.inner
            .register(Box::new(collector.clone()))
            .expect("registering metric");
        collector
    }

    /// Gather all the metrics from the metrics registry for reporting.
    ///
    /// See also [`prometheus::Registry::gather`].
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.gather()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        MetricsRegistry::new()
    }
}

/// A wrapper for creating prometheus metrics more conveniently.
///
/// Together with the [`metric`] macro, this trait is mainly used by
/// [`MetricsRegistry`] and should not normally be used outside the metric
/// registration flow.
pub trait MakeCollector: Collector + Clone + 'static {
    /// Creates a new collector.
    fn make_collector(opts: Opts) -> Self;
}

impl<T> MakeCollector for GenericCounter<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: Opts) -> Self {
        Self::with_opts(opts).expect("defining a counter")
    }
}

impl<T> MakeCollector for GenericCounterVec<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: Opts) -> Self {
        let labels = opts.variable_labels.clone();
        let labels = labels.iter().map(String::as_str).collect::<Vec<_>>();
        Self::new(opts, &labels).expect("defining a counter vec")
    }
}

impl<T> MakeCollector for GenericGauge<T>
where
    T: Atomic + 'static,
{
    fn make_collector(opts: Opts) -> Self {
        Self::with_opts(opts).expect("defining a gauge")
    }
}

impl MakeCollector for HistogramVec {
    fn make_collector(opts: Opts) -> Self {
        let labels = opts.variable_labels.clone();
        let labels = labels.iter().map(String::as_str).collect::<Vec<_>>();
        Self::new(
            HistogramOpts {
                common_opts: opts,
                buckets: LATENCY_BUCKETS.to_vec(),
            },
            &labels,
        )
        .expect("defining a histogram vec")
    }
}

/// Returns the value of the counter `name` with the given label values, if
/// it has been observed.
///
/// Intended for tests that assert on metric side effects.
pub fn counter_value(registry: &MetricsRegistry, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    registry
        .gather()
        .into_iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric().to_vec())
        .find(|metric| {
            labels.iter().all(|(k, v)| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == *k && pair.get_value() == *v)
            })
        })
        .map(|metric| metric.get_counter().get_value())
}
