use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram. Older ones fall out of the window.
pub const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    /// Counter total, gauge value, or histogram p50.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

/// Summary statistics over a histogram's window.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Observations ever recorded.
    pub count: u64,
    /// Observations currently in the window.
    pub window: u64,
    pub sum: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Series identity. Labels are sorted so call-site order does not matter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> =
            labels.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        labels.sort();
        Self { name: name.to_owned(), labels }
    }
}

/// One metric kind keyed by series. Lookups take the read lock; only the first
/// touch of a series takes the write lock.
struct Family<M> {
    series: RwLock<HashMap<SeriesKey, Arc<M>>>,
}

impl<M: Default> Family<M> {
    fn get_or_create(&self, name: &str, labels: &[(&str, &str)]) -> Arc<M> {
        let key = SeriesKey::new(name, labels);
        if let Some(m) = self.series.read().get(&key) {
            return Arc::clone(m);
        }
        Arc::clone(self.series.write().entry(key).or_default())
    }

    fn get(&self, name: &str, labels: &[(&str, &str)]) -> Option<Arc<M>> {
        self.series.read().get(&SeriesKey::new(name, labels)).cloned()
    }

    fn each(&self) -> Vec<(SeriesKey, Arc<M>)> {
        self.series
            .read()
            .iter()
            .map(|(k, m)| (k.clone(), Arc::clone(m)))
            .collect()
    }
}

impl<M> Default for Family<M> {
    fn default() -> Self {
        Self { series: RwLock::new(HashMap::new()) }
    }
}

#[derive(Default)]
struct Counter(AtomicU64);

/// f64 stored as raw bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct Histogram {
    window: Mutex<VecDeque<f64>>,
    total: AtomicU64,
}

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.window.lock();
        if window.len() == HISTOGRAM_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.window.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let quantile = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.total.load(Ordering::Relaxed),
            window: n as u64,
            sum,
            mean: sum / n as f64,
            p50: quantile(0.5),
            p95: quantile(0.95),
            p99: quantile(0.99),
        }
    }
}

/// Thread-safe in-process metrics recorder. Independent instances never share
/// series, so each orchestrator can own one.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.get_or_create(name, labels).0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(name, labels)
            .map_or(0, |c| c.0.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.get_or_create(name, labels).set(value);
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges.get(name, labels).map_or(0.0, |g| g.get())
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms.get_or_create(name, labels).observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .get(name, labels)
            .map(|h| h.summary())
            .unwrap_or_default()
    }

    /// Every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut rows: Vec<(SeriesKey, MetricSample)> = Vec::new();
        let sample = |key: &SeriesKey, metric_type, value, summary| MetricSample {
            name: key.name.clone(),
            labels: key.labels.iter().cloned().collect(),
            metric_type,
            value,
            summary,
        };
        for (key, c) in self.counters.each() {
            let s = sample(&key, MetricType::Counter, c.0.load(Ordering::Relaxed) as f64, None);
            rows.push((key, s));
        }
        for (key, g) in self.gauges.each() {
            let s = sample(&key, MetricType::Gauge, g.get(), None);
            rows.push((key, s));
        }
        for (key, h) in self.histograms.each() {
            let summary = h.summary();
            let s = sample(&key, MetricType::Histogram, summary.p50, Some(summary));
            rows.push((key, s));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, s)| s).collect()
    }
}
