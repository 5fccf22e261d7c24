use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names recorded by the engine and the server.
pub mod names {
    pub const UPDATES_APPLIED: &str = "microproto.updates.applied";
    /// Label `reason` = `ProtoError::error_kind()`.
    pub const UPDATES_REJECTED: &str = "microproto.updates.rejected";
    pub const BROADCAST_FRAMES: &str = "microproto.broadcast.frames";
    /// Label `reason`: `queue_full`, `closed`, `idle`, `version_mismatch`.
    pub const SESSIONS_DROPPED: &str = "microproto.sessions.dropped";
    pub const SESSIONS_ESTABLISHED: &str = "microproto.sessions.established";
    pub const SCHEMA_BYTES: &str = "microproto.schema.bytes";
}

#[derive(Default)]
struct Counter(AtomicU64);

/// f64 stored as raw bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn update(&self, f: impl Fn(f64) -> f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }
}

/// Running summary; observations are not retained.
#[derive(Default)]
struct Histogram(Mutex<HistogramSummary>);

impl Histogram {
    fn observe(&self, value: f64) {
        let mut s = self.0.lock();
        if s.count == 0 {
            s.min = value;
            s.max = value;
        } else {
            s.min = s.min.min(value);
            s.max = s.max.max(value);
        }
        s.count += 1;
        s.sum += value;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Metric key: name + labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample<T> {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<(String, String)>,
    pub value: T,
}

/// Point-in-time copy of every metric, sorted by name then labels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: String,
    pub counters: Vec<MetricSample<u64>>,
    pub gauges: Vec<MetricSample<f64>>,
    pub histograms: Vec<MetricSample<HistogramSummary>>,
}

fn collect<M, T>(map: &HashMap<MetricKey, M>, read: impl Fn(&M) -> T) -> Vec<MetricSample<T>> {
    let mut samples: Vec<MetricSample<T>> = map
        .iter()
        .map(|(key, m)| MetricSample {
            name: key.name.clone(),
            labels: key.labels.clone(),
            value: read(m),
        })
        .collect();
    samples.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
    samples
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

/// Run `f` on the metric for `key`, creating it under the write lock on first use.
fn with_metric<M: Default>(map: &RwLock<HashMap<MetricKey, M>>, key: MetricKey, f: impl FnOnce(&M)) {
    if let Some(m) = map.read().get(&key) {
        f(m);
        return;
    }
    let mut map = map.write();
    f(map.entry(key).or_default());
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_metric(&self.counters, MetricKey::new(name, labels), |c| {
            c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_metric(&self.gauges, MetricKey::new(name, labels), |g| {
            g.update(|_| value)
        });
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_metric(&self.gauges, MetricKey::new(name, labels), |g| {
            g.update(|v| v + delta)
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_metric(&self.histograms, MetricKey::new(name, labels), |h| {
            h.observe(value)
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.0.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(|h| h.0.lock().clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now().to_rfc3339(),
            counters: collect(&*self.counters.read(), |c| c.0.load(Ordering::Relaxed)),
            gauges: collect(&*self.gauges.read(), Gauge::get),
            histograms: collect(&*self.histograms.read(), |h| h.0.lock().clone()),
        }
    }
}
