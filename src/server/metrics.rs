//! Prometheus metrics endpoint
//!
//! Small Prometheus text-format exporter built on `std::sync::atomic`,
//! `parking_lot` and `axum`. Each server instance owns its registry so tests
//! can assert on counters without sharing global state.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::server::http::AppState;

// ---------------------------------------------------------------------------
// Atomic helpers
// ---------------------------------------------------------------------------

/// A simple atomic counter backed by `AtomicU64`.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that stores an `f64` via bit-casting into `AtomicU64`.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, val: f64) {
        self.0.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Counters keyed by label values.
#[derive(Debug)]
pub struct CounterVec {
    label_names: Vec<String>,
    entries: RwLock<HashMap<Vec<String>, Arc<Counter>>>,
}

impl CounterVec {
    fn new(label_names: &[&str]) -> Self {
        Self {
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, label_values: &[&str]) {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        // Fast path: read lock
        {
            let map = self.entries.read();
            if let Some(counter) = map.get(&key) {
                counter.inc();
                return;
            }
        }
        let mut map = self.entries.write();
        map.entry(key)
            .or_insert_with(|| Arc::new(Counter::default()))
            .inc();
    }

    pub fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        self.entries.read().get(&key).map(|c| c.get()).unwrap_or(0)
    }
}

/// A histogram that observes values into pre-defined buckets.
#[derive(Debug)]
pub struct Histogram {
    /// Upper-bound for each bucket (sorted ascending, last = +Inf implied).
    buckets: Vec<f64>,
    /// Cumulative count per bucket, plus one for +Inf.
    counts: Vec<AtomicU64>,
    /// Running sum of all observed values (bit-cast f64).
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0.0_f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, val: f64) {
        for (i, bound) in self.buckets.iter().enumerate() {
            if val <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counts[self.buckets.len()].fetch_add(1, Ordering::Relaxed);

        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let new_val = f64::from_bits(current) + val;
            if self
                .sum
                .compare_exchange_weak(
                    current,
                    new_val.to_bits(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum MetricData {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
    CounterVec(Arc<CounterVec>),
}

impl MetricData {
    fn type_str(&self) -> &'static str {
        match self {
            MetricData::Counter(_) | MetricData::CounterVec(_) => "counter",
            MetricData::Gauge(_) => "gauge",
            MetricData::Histogram(_) => "histogram",
        }
    }
}

#[derive(Debug)]
struct MetricDescriptor {
    name: String,
    help: String,
    data: MetricData,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: RwLock<Vec<MetricDescriptor>>,
}

impl MetricsRegistry {
    fn register(&self, name: &str, help: &str, data: MetricData) {
        self.metrics.write().push(MetricDescriptor {
            name: name.to_string(),
            help: help.to_string(),
            data,
        });
    }

    pub fn register_counter(&self, name: &str, help: &str) -> Arc<Counter> {
        let counter = Arc::new(Counter::default());
        self.register(name, help, MetricData::Counter(Arc::clone(&counter)));
        counter
    }

    pub fn register_counter_vec(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Arc<CounterVec> {
        let vec = Arc::new(CounterVec::new(label_names));
        self.register(name, help, MetricData::CounterVec(Arc::clone(&vec)));
        vec
    }

    pub fn register_gauge(&self, name: &str, help: &str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::default());
        self.register(name, help, MetricData::Gauge(Arc::clone(&gauge)));
        gauge
    }

    pub fn register_histogram(&self, name: &str, help: &str, buckets: Vec<f64>) -> Arc<Histogram> {
        let histogram = Arc::new(Histogram::new(buckets));
        self.register(name, help, MetricData::Histogram(Arc::clone(&histogram)));
        histogram
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metrics = self.metrics.read();
        let mut out = String::with_capacity(4096);

        for desc in metrics.iter() {
            let _ = writeln!(out, "# HELP {} {}", desc.name, desc.help);
            let _ = writeln!(out, "# TYPE {} {}", desc.name, desc.data.type_str());

            match &desc.data {
                MetricData::Counter(counter) => {
                    let _ = writeln!(out, "{} {}", desc.name, counter.get());
                }
                MetricData::Gauge(gauge) => {
                    let _ = writeln!(out, "{} {}", desc.name, format_f64(gauge.get()));
                }
                MetricData::Histogram(histogram) => {
                    render_histogram(&mut out, &desc.name, histogram);
                }
                MetricData::CounterVec(vec) => {
                    let map = vec.entries.read();
                    let mut sorted: Vec<_> = map.iter().collect();
                    sorted.sort_by(|a, b| a.0.cmp(b.0));
                    for (label_values, counter) in sorted {
                        let labels = format_labels(&vec.label_names, label_values);
                        let _ = writeln!(out, "{}{} {}", desc.name, labels, counter.get());
                    }
                }
            }
        }

        out
    }
}

fn format_f64(v: f64) -> String {
    if v == v.floor() && v.is_finite() {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn format_labels(names: &[String], values: &[String]) -> String {
    let mut buf = String::from("{");
    for (i, (name, value)) in names.iter().zip(values.iter()).enumerate() {
        if i > 0 {
            buf.push(',');
        }
        let _ = write!(buf, "{}=\"{}\"", name, escape_label_value(value));
    }
    buf.push('}');
    buf
}

fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn render_histogram(out: &mut String, name: &str, h: &Histogram) {
    for (i, bound) in h.buckets.iter().enumerate() {
        let count = h.counts[i].load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, format_f64(*bound), count);
    }
    let inf_count = h.counts[h.buckets.len()].load(Ordering::Relaxed);
    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, inf_count);
    let _ = writeln!(out, "{}_sum {}", name, format_f64(h.get_sum()));
    let _ = writeln!(out, "{}_count {}", name, h.get_count());
}

// ---------------------------------------------------------------------------
// Media proxy metrics
// ---------------------------------------------------------------------------

/// Metric handles used by the media handlers and the write-back pool.
pub struct MediaMetrics {
    registry: MetricsRegistry,
    started_at: Instant,
    pub requests_total: Arc<CounterVec>,
    pub cache_lookups_total: Arc<CounterVec>,
    pub transforms_total: Arc<Counter>,
    pub transform_failures_total: Arc<Counter>,
    pub transform_seconds: Arc<Histogram>,
    pub upstream_errors_total: Arc<CounterVec>,
    pub forbidden_origins_total: Arc<Counter>,
    pub rate_limited_total: Arc<Counter>,
    pub writeback_persisted_total: Arc<Counter>,
    pub writeback_failed_total: Arc<Counter>,
    pub writeback_dropped_total: Arc<Counter>,
    uptime_seconds: Arc<Gauge>,
}

impl Default for MediaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaMetrics {
    pub fn new() -> Self {
        let registry = MetricsRegistry::default();

        let requests_total = registry.register_counter_vec(
            "media_proxy_requests_total",
            "Media requests by endpoint and outcome",
            &["endpoint", "outcome"],
        );
        let cache_lookups_total = registry.register_counter_vec(
            "media_proxy_cache_lookups_total",
            "Variant cache lookups by result",
            &["result"],
        );
        let transforms_total =
            registry.register_counter("media_proxy_transforms_total", "Images transformed");
        let transform_failures_total = registry.register_counter(
            "media_proxy_transform_failures_total",
            "Image transforms that failed to decode or encode",
        );
        let transform_seconds = registry.register_histogram(
            "media_proxy_transform_seconds",
            "Time spent decoding, resizing and encoding",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        );
        let upstream_errors_total = registry.register_counter_vec(
            "media_proxy_upstream_errors_total",
            "Origin fetch failures by status",
            &["status"],
        );
        let forbidden_origins_total = registry.register_counter(
            "media_proxy_forbidden_origins_total",
            "Requests rejected by the origin allowlist",
        );
        let rate_limited_total = registry.register_counter(
            "media_proxy_rate_limited_total",
            "Requests rejected by the rate limiter",
        );
        let writeback_persisted_total = registry.register_counter(
            "media_proxy_writeback_persisted_total",
            "Variants written back to the object store",
        );
        let writeback_failed_total = registry.register_counter(
            "media_proxy_writeback_failed_total",
            "Variant writes that failed",
        );
        let writeback_dropped_total = registry.register_counter(
            "media_proxy_writeback_dropped_total",
            "Variant writes dropped because the queue was full",
        );
        let uptime_seconds =
            registry.register_gauge("media_proxy_uptime_seconds", "Process uptime in seconds");

        Self {
            registry,
            started_at: Instant::now(),
            requests_total,
            cache_lookups_total,
            transforms_total,
            transform_failures_total,
            transform_seconds,
            upstream_errors_total,
            forbidden_origins_total,
            rate_limited_total,
            writeback_persisted_total,
            writeback_failed_total,
            writeback_dropped_total,
            uptime_seconds,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn render(&self) -> String {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64().floor());
        self.registry.render()
    }
}

/// Axum handler that returns all metrics in Prometheus text exposition format.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
        .into_response()
}
