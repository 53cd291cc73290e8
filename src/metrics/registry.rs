//! # 指标注册表
//!
//! A process-wide table of named counters, gauges and histograms.
//!
//! The table itself is [`MetricRegistry`]. [`RegistryCell`] owns the lazily
//! built, resettable instance that request handlers share: the first caller
//! builds the registry with the well-known metrics, everyone else gets the
//! same `Arc`, and [`RegistryCell::reset`] drops it so the next access starts
//! from zero.
//!
//! ```
//! use cats_server::metrics::registry::{RegistryCell, CATS_LOGINS_TOTAL};
//!
//! let cell = RegistryCell::new();
//! let registry = cell.get_or_create();
//! registry.increment(CATS_LOGINS_TOTAL, &[]).unwrap();
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::MetricError;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_RESPONSE_TIME_SECONDS: &str = "http_response_time_seconds";
pub const LOGGED_IN_USERS: &str = "logged_in_users";
pub const API_DATA_LATENCY_SECONDS: &str = "api_data_latency_seconds";
pub const CATS_LOGINS_TOTAL: &str = "cats_logins_total";
pub const CATS_LOGOUTS_TOTAL: &str = "cats_logouts_total";
pub const CATS_ERRORS_TOTAL: &str = "cats_errors_total";
pub const CATS_ACTIVE_USERS: &str = "cats_active_users";

pub const RESPONSE_TIME_BUCKETS: [f64; 6] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0];
pub const API_LATENCY_BUCKETS: [f64; 6] = [0.1, 0.3, 0.5, 1.0, 2.0, 5.0];

/// The metrics every fresh registry starts with.
pub fn well_known_metrics() -> Vec<MetricDesc> {
    vec![
        MetricDesc::counter(HTTP_REQUESTS_TOTAL, "Total HTTP requests")
            .labels(&["method", "path", "status"])
            .preset_label("app", "cats"),
        MetricDesc::histogram(HTTP_RESPONSE_TIME_SECONDS, "Response time histogram", &RESPONSE_TIME_BUCKETS).labels(&["method", "path"]),
        MetricDesc::gauge(LOGGED_IN_USERS, "Currently logged in users").labels(&["environment"]),
        MetricDesc::histogram(API_DATA_LATENCY_SECONDS, "API data fetching latency", &API_LATENCY_BUCKETS),
        MetricDesc::counter(CATS_LOGINS_TOTAL, "Total number of logins"),
        MetricDesc::counter(CATS_LOGOUTS_TOTAL, "Total number of logouts"),
        MetricDesc::counter(CATS_ERRORS_TOTAL, "Total number of errors"),
        MetricDesc::gauge(CATS_ACTIVE_USERS, "Current number of active users"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a metric: what it is called, how it is partitioned.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDesc {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    /// Declared label names, in exposition order.
    pub label_names: Vec<String>,
    /// Constant labels attached to every sample, rendered before the declared ones.
    pub preset_labels: Vec<(String, String)>,
    /// Finite upper bounds, histograms only. `+Inf` is implied.
    pub buckets: Vec<f64>,
}

impl MetricDesc {
    fn new(name: &str, help: &str, kind: MetricKind) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind,
            label_names: Vec::new(),
            preset_labels: Vec::new(),
            buckets: Vec::new(),
        }
    }

    pub fn counter(name: &str, help: &str) -> Self {
        Self::new(name, help, MetricKind::Counter)
    }

    pub fn gauge(name: &str, help: &str) -> Self {
        Self::new(name, help, MetricKind::Gauge)
    }

    pub fn histogram(name: &str, help: &str, buckets: &[f64]) -> Self {
        let mut desc = Self::new(name, help, MetricKind::Histogram);
        desc.buckets = buckets.to_vec();
        desc
    }

    pub fn labels(mut self, names: &[&str]) -> Self {
        self.label_names = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn preset_label(mut self, name: &str, value: &str) -> Self {
        self.preset_labels.push((name.to_string(), value.to_string()));
        self
    }

    fn validate(&self) -> Result<(), MetricError> {
        let invalid = |reason: String| MetricError::InvalidDescriptor {
            name: self.name.clone(),
            reason,
        };
        if !is_metric_name(&self.name) {
            return Err(invalid("metric names must match [a-zA-Z_:][a-zA-Z0-9_:]*".to_string()));
        }
        let mut seen = HashSet::new();
        let all_labels = self.preset_labels.iter().map(|(name, _)| name).chain(&self.label_names);
        for label in all_labels {
            if !is_label_name(label) {
                return Err(invalid(format!("label `{label}` must match [a-zA-Z_][a-zA-Z0-9_]* and not start with __")));
            }
            if self.kind == MetricKind::Histogram && label == "le" {
                return Err(invalid("`le` is reserved for histogram buckets".to_string()));
            }
            if !seen.insert(label.as_str()) {
                return Err(invalid(format!("label `{label}` is declared more than once")));
            }
        }
        if self.kind == MetricKind::Histogram {
            let finite = self.buckets.iter().all(|b| b.is_finite());
            let increasing = self.buckets.windows(2).all(|w| w[0] < w[1]);
            if self.buckets.is_empty() || !finite || !increasing {
                return Err(MetricError::InvalidBuckets(self.name.clone()));
            }
        }
        Ok(())
    }
}

fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// `__` prefixes are reserved for the scraper's internal labels.
fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
}

/// Point-in-time copy of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    /// One entry per label-value combination, sorted by label values.
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Preset labels followed by declared labels.
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Counter(u64),
    Gauge(f64),
    Histogram(HistogramSample),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSample {
    /// `(upper bound, cumulative count)`, ending with `(+Inf, count)`.
    pub buckets: Vec<(f64, u64)>,
    pub sum: f64,
    pub count: u64,
}

/// `f64` stored as raw bits so it can be updated without a lock.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.0.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
struct HistogramCell {
    /// Per-bucket (non-cumulative) counts; the last slot is `+Inf`.
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramCell {
    fn new(bucket_count: usize) -> Self {
        Self {
            counts: vec![0; bucket_count + 1],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, bounds: &[f64], value: f64) {
        let idx = bounds.iter().position(|bound| value <= *bound).unwrap_or(bounds.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }

    fn sample(&self, bounds: &[f64]) -> HistogramSample {
        let mut cumulative: u64 = 0;
        let buckets = bounds
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(&self.counts)
            .map(|(bound, count)| {
                cumulative += *count;
                (bound, cumulative)
            })
            .collect();
        HistogramSample {
            buckets,
            sum: self.sum,
            count: self.count,
        }
    }
}

type LabelKey = Vec<String>;

#[derive(Debug)]
enum Series {
    Counter(DashMap<LabelKey, AtomicU64>),
    Gauge(DashMap<LabelKey, AtomicF64>),
    Histogram(DashMap<LabelKey, Mutex<HistogramCell>>),
}

/// Runs `f` against the cell for `key`, creating it on first use.
fn with_cell<V, R>(map: &DashMap<LabelKey, V>, key: LabelKey, init: impl FnOnce() -> V, f: impl FnOnce(&V) -> R) -> R {
    if let Some(cell) = map.get(&key) {
        return f(cell.value());
    }
    let cell = map.entry(key).or_insert_with(init);
    f(cell.value())
}

#[derive(Debug)]
struct Metric {
    desc: MetricDesc,
    series: Series,
}

impl Metric {
    fn new(desc: MetricDesc) -> Self {
        let series = match desc.kind {
            MetricKind::Counter => Series::Counter(DashMap::new()),
            MetricKind::Gauge => Series::Gauge(DashMap::new()),
            MetricKind::Histogram => Series::Histogram(DashMap::new()),
        };
        let metric = Self { desc, series };
        // Unlabeled metrics are visible (at zero) before their first update.
        if metric.desc.label_names.is_empty() {
            match &metric.series {
                Series::Counter(map) => {
                    map.insert(Vec::new(), AtomicU64::new(0));
                }
                Series::Gauge(map) => {
                    map.insert(Vec::new(), AtomicF64::default());
                }
                Series::Histogram(map) => {
                    map.insert(Vec::new(), Mutex::new(HistogramCell::new(metric.desc.buckets.len())));
                }
            }
        }
        metric
    }

    /// Orders `labels` by the declared label names, rejecting missing, extra
    /// or repeated names.
    fn label_key(&self, labels: &[(&str, &str)]) -> Result<LabelKey, MetricError> {
        let declared = &self.desc.label_names;
        if labels.len() == declared.len() {
            let key: Option<LabelKey> = declared
                .iter()
                .map(|name| {
                    let mut hits = labels.iter().filter(|(k, _)| *k == name.as_str());
                    match (hits.next(), hits.next()) {
                        (Some((_, value)), None) => Some(value.to_string()),
                        _ => None,
                    }
                })
                .collect();
            if let Some(key) = key {
                return Ok(key);
            }
        }
        Err(MetricError::LabelMismatch {
            name: self.desc.name.clone(),
            expected: declared.clone(),
            got: labels.iter().map(|(k, _)| k.to_string()).collect(),
        })
    }

    fn kind_mismatch(&self, expected: MetricKind) -> MetricError {
        MetricError::KindMismatch {
            name: self.desc.name.clone(),
            expected: expected.as_str(),
            actual: self.desc.kind.as_str(),
        }
    }

    fn sample_labels(&self, key: &[String]) -> Vec<(String, String)> {
        self.desc
            .preset_labels
            .iter()
            .cloned()
            .chain(self.desc.label_names.iter().cloned().zip(key.iter().cloned()))
            .collect()
    }

    fn read(&self, key: &LabelKey) -> Option<SampleValue> {
        match &self.series {
            Series::Counter(map) => map.get(key).map(|c| SampleValue::Counter(c.load(Ordering::Relaxed))),
            Series::Gauge(map) => map.get(key).map(|g| SampleValue::Gauge(g.get())),
            Series::Histogram(map) => map.get(key).map(|h| SampleValue::Histogram(h.lock().sample(&self.desc.buckets))),
        }
    }

    fn snapshot(&self) -> MetricSnapshot {
        let mut values: Vec<(LabelKey, SampleValue)> = match &self.series {
            Series::Counter(map) => map
                .iter()
                .map(|e| (e.key().clone(), SampleValue::Counter(e.value().load(Ordering::Relaxed))))
                .collect(),
            Series::Gauge(map) => map.iter().map(|e| (e.key().clone(), SampleValue::Gauge(e.value().get()))).collect(),
            Series::Histogram(map) => map
                .iter()
                .map(|e| (e.key().clone(), SampleValue::Histogram(e.value().lock().sample(&self.desc.buckets))))
                .collect(),
        };
        values.sort_by(|a, b| a.0.cmp(&b.0));
        MetricSnapshot {
            name: self.desc.name.clone(),
            help: self.desc.help.clone(),
            kind: self.desc.kind,
            samples: values
                .into_iter()
                .map(|(key, value)| Sample {
                    labels: self.sample_labels(&key),
                    value,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct MetricTable {
    ordered: Vec<Arc<Metric>>,
    by_name: HashMap<String, Arc<Metric>>,
}

/// A set of uniquely named metrics.
///
/// All updates are safe from any number of threads without outside locking.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    table: RwLock<MetricTable>,
}

impl MetricRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding [`well_known_metrics`].
    pub fn with_well_known_metrics() -> Self {
        let registry = Self::new();
        for desc in well_known_metrics() {
            if let Err(err) = registry.ensure_registered(desc) {
                log::error!("failed to register well-known metric: {err}");
            }
        }
        registry
    }

    /// Registers `desc` unless a metric of that name already exists.
    ///
    /// Registering the same descriptor twice is a no-op that keeps the
    /// accumulated values; a different descriptor under an existing name is a
    /// [`MetricError::Conflict`].
    pub fn ensure_registered(&self, desc: MetricDesc) -> Result<(), MetricError> {
        desc.validate()?;
        if let Some(existing) = self.table.read().by_name.get(&desc.name) {
            return Self::same_shape(existing, &desc);
        }
        let mut table = self.table.write();
        if let Some(existing) = table.by_name.get(&desc.name) {
            return Self::same_shape(existing, &desc);
        }
        let metric = Arc::new(Metric::new(desc));
        table.by_name.insert(metric.desc.name.clone(), Arc::clone(&metric));
        table.ordered.push(metric);
        Ok(())
    }

    fn same_shape(existing: &Metric, desc: &MetricDesc) -> Result<(), MetricError> {
        if existing.desc == *desc {
            Ok(())
        } else {
            Err(MetricError::Conflict(desc.name.clone()))
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.read().by_name.contains_key(name)
    }

    /// Names in registration order.
    pub fn metric_names(&self) -> Vec<String> {
        self.table.read().ordered.iter().map(|m| m.desc.name.clone()).collect()
    }

    fn lookup(&self, name: &str) -> Result<Arc<Metric>, MetricError> {
        self.table
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| MetricError::UnknownMetric(name.to_string()))
    }

    /// Adds one to a counter.
    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) -> Result<(), MetricError> {
        let metric = self.lookup(name)?;
        let Series::Counter(map) = &metric.series else {
            return Err(metric.kind_mismatch(MetricKind::Counter));
        };
        let key = metric.label_key(labels)?;
        with_cell(map, key, || AtomicU64::new(0), |c| c.fetch_add(1, Ordering::Relaxed));
        Ok(())
    }

    /// Moves a gauge by `delta`, which may be negative.
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], delta: f64) -> Result<(), MetricError> {
        let metric = self.lookup(name)?;
        let Series::Gauge(map) = &metric.series else {
            return Err(metric.kind_mismatch(MetricKind::Gauge));
        };
        let key = metric.label_key(labels)?;
        with_cell(map, key, AtomicF64::default, |g| g.add(delta));
        Ok(())
    }

    /// Records one observation into a histogram.
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) -> Result<(), MetricError> {
        let metric = self.lookup(name)?;
        let Series::Histogram(map) = &metric.series else {
            return Err(metric.kind_mismatch(MetricKind::Histogram));
        };
        let key = metric.label_key(labels)?;
        let bounds = &metric.desc.buckets;
        with_cell(map, key, || Mutex::new(HistogramCell::new(bounds.len())), |h| h.lock().observe(bounds, value));
        Ok(())
    }

    /// Current value of one series, `None` if that label combination was never touched.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Result<Option<SampleValue>, MetricError> {
        let metric = self.lookup(name)?;
        let key = metric.label_key(labels)?;
        Ok(metric.read(&key))
    }

    /// Copies every metric in registration order.
    ///
    /// Each series is read atomically, but two metrics may be captured at
    /// slightly different instants.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let metrics: Vec<Arc<Metric>> = self.table.read().ordered.clone();
        metrics.iter().map(|metric| metric.snapshot()).collect()
    }
}

/// Lazily built, resettable home of a shared [`MetricRegistry`].
#[derive(Debug, Default)]
pub struct RegistryCell {
    slot: RwLock<Option<Arc<MetricRegistry>>>,
}

impl RegistryCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current registry, building it on first use.
    ///
    /// Concurrent first callers race for the write lock; the winner registers
    /// the well-known metrics and the rest find it populated.
    pub fn get_or_create(&self) -> Arc<MetricRegistry> {
        if let Some(registry) = self.slot.read().as_ref() {
            return Arc::clone(registry);
        }
        let mut slot = self.slot.write();
        let registry = slot.get_or_insert_with(|| {
            log::debug!("building metric registry");
            Arc::new(MetricRegistry::with_well_known_metrics())
        });
        Arc::clone(registry)
    }

    /// Drops the current registry. Holders of the old `Arc` keep a consistent,
    /// detached view; the next [`get_or_create`](Self::get_or_create) starts from zero.
    pub fn reset(&self) {
        if self.slot.write().take().is_some() {
            log::info!("metric registry reset");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.read().is_some()
    }
}

static GLOBAL: LazyLock<Arc<RegistryCell>> = LazyLock::new(|| Arc::new(RegistryCell::new()));

/// The process-wide registry cell.
pub fn global() -> Arc<RegistryCell> {
    Arc::clone(&GLOBAL)
}

/// Process-wide [`RegistryCell::get_or_create`].
pub fn get_or_create_registry() -> Arc<MetricRegistry> {
    GLOBAL.get_or_create()
}

/// Process-wide [`RegistryCell::reset`].
pub fn reset() {
    GLOBAL.reset()
}
