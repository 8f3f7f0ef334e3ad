//! Generic, name-keyed metrics sink over the `prometheus` crate.
//!
//! Grounded on the teacher's root `src/metrics.rs`, which wraps a
//! `prometheus::Registry` behind a small typed facade rather than letting
//! call sites touch the registry directly. Unlike the teacher's fixed set of
//! named metrics, callers here register counters/gauges/histograms by name on
//! first use, and every subsequent call with that name must pass the same
//! label key set — mismatches are a programming error, not a runtime one the
//! caller can recover from.

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Fixed histogram buckets (seconds) shared by every timing metric, so
/// dashboards built against one histogram line up with every other.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

struct Registered {
    label_keys: Vec<String>,
    counter: Option<IntCounterVec>,
    gauge: Option<IntGaugeVec>,
    histogram: Option<HistogramVec>,
}

/// A single process-wide metrics sink. Cheap to clone (wraps an `Arc`
/// internally via `Registry`'s own ref-counting; we hold a `Mutex` around the
/// bookkeeping map only).
pub struct MetricsSink {
    namespace: String,
    registry: Registry,
    series: Mutex<HashMap<String, Registered>>,
}

impl MetricsSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            registry: Registry::new(),
            series: Mutex::new(HashMap::new()),
        }
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}_{}", self.namespace, name)
    }

    fn sorted(labels: &[(&str, &str)]) -> Vec<String> {
        let mut keys: Vec<String> = labels.iter().map(|(k, _)| k.to_string()).collect();
        keys.sort();
        keys
    }

    pub fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.with_counter(name, labels, |c, values| {
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            c.with_label_values(&values).inc()
        });
    }

    pub fn incr_counter_by(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        self.with_counter(name, labels, |c, values| {
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            c.with_label_values(&values).inc_by(value)
        });
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let mut series = self.series.lock().expect("metrics series lock poisoned");
        let keys = Self::sorted(labels);
        let entry = series.entry(name.to_string()).or_insert_with(|| {
            let gauge = IntGaugeVec::new(
                Opts::new(self.full_name(name), format!("gauge {name}")),
                &keys.iter().map(String::as_str).collect::<Vec<_>>(),
            )
            .expect("valid gauge opts");
            self.registry
                .register(Box::new(gauge.clone()))
                .expect("gauge registration");
            Registered {
                label_keys: keys.clone(),
                counter: None,
                gauge: Some(gauge),
                histogram: None,
            }
        });
        assert_eq!(
            entry.label_keys, keys,
            "metric {name} re-registered with a different label key set"
        );
        let gauge = entry.gauge.as_ref().expect("gauge series");
        let values = Self::ordered_values(&entry.label_keys, labels);
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        gauge.with_label_values(&values).set(value);
    }

    pub fn observe_duration(&self, name: &str, labels: &[(&str, &str)], seconds: f64) {
        let mut series = self.series.lock().expect("metrics series lock poisoned");
        let keys = Self::sorted(labels);
        let entry = series.entry(name.to_string()).or_insert_with(|| {
            let histogram = HistogramVec::new(
                HistogramOpts::new(self.full_name(name), format!("duration {name}"))
                    .buckets(DEFAULT_BUCKETS.to_vec()),
                &keys.iter().map(String::as_str).collect::<Vec<_>>(),
            )
            .expect("valid histogram opts");
            self.registry
                .register(Box::new(histogram.clone()))
                .expect("histogram registration");
            Registered {
                label_keys: keys.clone(),
                counter: None,
                gauge: None,
                histogram: Some(histogram),
            }
        });
        assert_eq!(
            entry.label_keys, keys,
            "metric {name} re-registered with a different label key set"
        );
        let histogram = entry.histogram.as_ref().expect("histogram series");
        let values = Self::ordered_values(&entry.label_keys, labels);
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        histogram.with_label_values(&values).observe(seconds);
    }

    /// Unlabeled histogram, used by call sites that time a single fixed
    /// operation (e.g. broker publish latency) and don't need a label set.
    pub fn unlabeled_histogram(&self, name: &str) -> Histogram {
        Histogram::with_opts(
            HistogramOpts::new(self.full_name(name), format!("duration {name}"))
                .buckets(exponential_buckets(0.005, 2.0, 12).unwrap_or_default()),
        )
        .expect("valid histogram opts")
    }

    fn with_counter(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        f: impl FnOnce(&IntCounterVec, Vec<String>),
    ) {
        let mut series = self.series.lock().expect("metrics series lock poisoned");
        let keys = Self::sorted(labels);
        let entry = series.entry(name.to_string()).or_insert_with(|| {
            let counter = IntCounterVec::new(
                Opts::new(self.full_name(name), format!("counter {name}")),
                &keys.iter().map(String::as_str).collect::<Vec<_>>(),
            )
            .expect("valid counter opts");
            self.registry
                .register(Box::new(counter.clone()))
                .expect("counter registration");
            Registered {
                label_keys: keys.clone(),
                counter: Some(counter),
                gauge: None,
                histogram: None,
            }
        });
        assert_eq!(
            entry.label_keys, keys,
            "metric {name} re-registered with a different label key set"
        );
        let counter = entry.counter.as_ref().expect("counter series");
        let values = Self::ordered_values(&entry.label_keys, labels);
        f(counter, values);
    }

    fn ordered_values(keys: &[String], labels: &[(&str, &str)]) -> Vec<String> {
        keys.iter()
            .map(|k| {
                labels
                    .iter()
                    .find(|(lk, _)| lk == k)
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Render the registry in Prometheus text exposition format, for the
    /// `/metrics` endpoint.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buf)
            .expect("metrics encoding");
        String::from_utf8(buf).expect("prometheus text encoder produces utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_across_calls() {
        let sink = MetricsSink::new("test");
        sink.incr_counter("events_total", &[("queue", "broker")]);
        sink.incr_counter("events_total", &[("queue", "broker")]);
        let rendered = sink.render();
        assert!(rendered.contains("test_events_total"));
    }

    #[test]
    #[should_panic(expected = "different label key set")]
    fn mismatched_label_keys_panics() {
        let sink = MetricsSink::new("test");
        sink.incr_counter("events_total", &[("queue", "broker")]);
        sink.incr_counter("events_total", &[("resource", "broker")]);
    }
}
