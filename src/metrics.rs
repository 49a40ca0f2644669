//! Prometheus metrics for appends, reads, locks, and snapshots.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `brook_appends_total` | Counter | `stream_type`, `outcome` |
//! | `brook_append_duration_seconds` | Histogram | `stream_type` |
//! | `brook_append_failures_total` | Counter | `stream_type`, `kind` |
//! | `brook_reads_total` | Counter | `stream_type` |
//! | `brook_read_duration_seconds` | Histogram | `stream_type` |
//! | `brook_lock_acquire_total` | Counter | `outcome` |
//! | `brook_lock_acquire_duration_seconds` | Histogram | `outcome` |
//! | `brook_lock_acquire_attempts` | Histogram | |
//! | `brook_lock_contention_waits_total` | Counter | |
//! | `brook_lock_held_duration_seconds` | Histogram | |
//! | `brook_snapshot_cache_total` | Counter | `projection_type`, `result` |
//! | `brook_snapshot_build_duration_seconds` | Histogram | `projection_type` |
//! | `brook_snapshot_events_replayed` | Histogram | `projection_type` |
//! | `brook_reducer_hash_mismatch_total` | Counter | `projection_type` |
//! | `brook_snapshot_persist_total` | Counter | `projection_type` |
//! | `brook_snapshot_persist_duration_seconds` | Histogram | `projection_type` |
//! | `brook_storage_retries_total` | Counter | `operation` |
//!
//! ```
//! use brook_es::metrics::BrookMetrics;
//! use prometheus::Registry;
//!
//! let registry = Registry::new();
//! let metrics = BrookMetrics::new(&registry).expect("fresh registry");
//! metrics.storage_retry("put");
//! assert_eq!(metrics.storage_retry_count("put"), 1.0);
//! ```

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};

/// Maximum length for label values. Longer values are truncated.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Every metric family registered by [`BrookMetrics::new`].
pub const METRIC_NAMES: &[&str] = &[
    "brook_appends_total",
    "brook_append_duration_seconds",
    "brook_append_failures_total",
    "brook_reads_total",
    "brook_read_duration_seconds",
    "brook_lock_acquire_total",
    "brook_lock_acquire_duration_seconds",
    "brook_lock_acquire_attempts",
    "brook_lock_contention_waits_total",
    "brook_lock_held_duration_seconds",
    "brook_snapshot_cache_total",
    "brook_snapshot_build_duration_seconds",
    "brook_snapshot_events_replayed",
    "brook_reducer_hash_mismatch_total",
    "brook_snapshot_persist_total",
    "brook_snapshot_persist_duration_seconds",
    "brook_storage_retries_total",
];

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];
const COUNT_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

/// Errors raised while registering or encoding metrics.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// A metric family could not be registered (e.g. duplicate name).
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// The registry could not be rendered in text format.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Metric handles shared by every component of an
/// [`EventStore`](crate::EventStore).
///
/// Cheap to clone; every clone records into the same families.
#[derive(Clone)]
pub struct BrookMetrics {
    appends_total: CounterVec,
    append_duration: HistogramVec,
    append_failures_total: CounterVec,
    reads_total: CounterVec,
    read_duration: HistogramVec,
    lock_acquire_total: CounterVec,
    lock_acquire_duration: HistogramVec,
    lock_acquire_attempts: HistogramVec,
    lock_contention_waits_total: IntCounter,
    lock_held_duration: HistogramVec,
    snapshot_cache_total: CounterVec,
    snapshot_build_duration: HistogramVec,
    snapshot_events_replayed: HistogramVec,
    reducer_hash_mismatch_total: CounterVec,
    snapshot_persist_total: CounterVec,
    snapshot_persist_duration: HistogramVec,
    storage_retries_total: CounterVec,
}

impl std::fmt::Debug for BrookMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrookMetrics").finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> MetricsResult<CounterVec> {
    let metric = CounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: &[f64],
    labels: &[&str],
) -> MetricsResult<HistogramVec> {
    let metric = HistogramVec::new(
        HistogramOpts::new(name, help).buckets(buckets.to_vec()),
        labels,
    )?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl BrookMetrics {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any family fails to register (e.g. the registry
    /// already holds a `BrookMetrics`).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let lock_contention_waits_total = IntCounter::with_opts(Opts::new(
            "brook_lock_contention_waits_total",
            "Busy lock polls while waiting for a stream lease",
        ))?;
        registry.register(Box::new(lock_contention_waits_total.clone()))?;

        Ok(Self {
            appends_total: counter(
                registry,
                "brook_appends_total",
                "Append operations by outcome",
                &["stream_type", "outcome"],
            )?,
            append_duration: histogram(
                registry,
                "brook_append_duration_seconds",
                "Append latency including lock acquisition",
                LATENCY_BUCKETS,
                &["stream_type"],
            )?,
            append_failures_total: counter(
                registry,
                "brook_append_failures_total",
                "Failed appends by error kind",
                &["stream_type", "kind"],
            )?,
            reads_total: counter(
                registry,
                "brook_reads_total",
                "Event batches read",
                &["stream_type"],
            )?,
            read_duration: histogram(
                registry,
                "brook_read_duration_seconds",
                "Latency of a single batch read",
                LATENCY_BUCKETS,
                &["stream_type"],
            )?,
            lock_acquire_total: counter(
                registry,
                "brook_lock_acquire_total",
                "Lease acquisitions by outcome",
                &["outcome"],
            )?,
            lock_acquire_duration: histogram(
                registry,
                "brook_lock_acquire_duration_seconds",
                "Time spent acquiring a lease",
                LATENCY_BUCKETS,
                &["outcome"],
            )?,
            lock_acquire_attempts: histogram(
                registry,
                "brook_lock_acquire_attempts",
                "Attempts needed per lease acquisition",
                COUNT_BUCKETS,
                &[],
            )?,
            lock_contention_waits_total,
            lock_held_duration: histogram(
                registry,
                "brook_lock_held_duration_seconds",
                "Time a lease was held before release",
                LATENCY_BUCKETS,
                &[],
            )?,
            snapshot_cache_total: counter(
                registry,
                "brook_snapshot_cache_total",
                "Snapshot cache lookups by result",
                &["projection_type", "result"],
            )?,
            snapshot_build_duration: histogram(
                registry,
                "brook_snapshot_build_duration_seconds",
                "Snapshot build latency",
                LATENCY_BUCKETS,
                &["projection_type"],
            )?,
            snapshot_events_replayed: histogram(
                registry,
                "brook_snapshot_events_replayed",
                "Events folded per snapshot build",
                COUNT_BUCKETS,
                &["projection_type"],
            )?,
            reducer_hash_mismatch_total: counter(
                registry,
                "brook_reducer_hash_mismatch_total",
                "Base snapshots discarded because the reducer hash changed",
                &["projection_type"],
            )?,
            snapshot_persist_total: counter(
                registry,
                "brook_snapshot_persist_total",
                "Snapshots written",
                &["projection_type"],
            )?,
            snapshot_persist_duration: histogram(
                registry,
                "brook_snapshot_persist_duration_seconds",
                "Snapshot write latency",
                LATENCY_BUCKETS,
                &["projection_type"],
            )?,
            storage_retries_total: counter(
                registry,
                "brook_storage_retries_total",
                "Retried storage calls by operation",
                &["operation"],
            )?,
        })
    }

    // --- event log ---

    /// Records a finished append.
    ///
    /// # Arguments
    ///
    /// * `stream_type` - Stream type of the target stream.
    /// * `outcome` - `"committed"`, `"idempotent"`, `"empty"` or `"failed"`.
    /// * `secs` - End-to-end latency in seconds.
    pub fn append_completed(&self, stream_type: &str, outcome: &str, secs: f64) {
        let stream_type = truncate_label(stream_type);
        self.appends_total
            .with_label_values(&[stream_type, truncate_label(outcome)])
            .inc();
        self.append_duration
            .with_label_values(&[stream_type])
            .observe(secs);
    }

    /// Records a failed append by error kind.
    pub fn append_failed(&self, stream_type: &str, kind: &str) {
        self.append_failures_total
            .with_label_values(&[truncate_label(stream_type), truncate_label(kind)])
            .inc();
    }

    /// Records one batch read.
    pub fn read_completed(&self, stream_type: &str, secs: f64) {
        let stream_type = truncate_label(stream_type);
        self.reads_total.with_label_values(&[stream_type]).inc();
        self.read_duration
            .with_label_values(&[stream_type])
            .observe(secs);
    }

    /// Returns the append count for a stream type and outcome.
    #[must_use]
    pub fn append_count(&self, stream_type: &str, outcome: &str) -> f64 {
        self.appends_total
            .with_label_values(&[truncate_label(stream_type), truncate_label(outcome)])
            .get()
    }

    /// Returns the failure count for a stream type and error kind.
    #[must_use]
    pub fn append_failure_count(&self, stream_type: &str, kind: &str) -> f64 {
        self.append_failures_total
            .with_label_values(&[truncate_label(stream_type), truncate_label(kind)])
            .get()
    }

    /// Returns the number of batch reads for a stream type.
    #[must_use]
    pub fn read_count(&self, stream_type: &str) -> f64 {
        self.reads_total
            .with_label_values(&[truncate_label(stream_type)])
            .get()
    }

    // --- lock ---

    /// Records a finished lease acquisition.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `"acquired"`, `"busy"` or `"error"`.
    /// * `secs` - Time spent acquiring.
    /// * `attempts` - Number of attempts made.
    pub fn lock_acquired(&self, outcome: &str, secs: f64, attempts: u32) {
        let outcome = truncate_label(outcome);
        self.lock_acquire_total.with_label_values(&[outcome]).inc();
        self.lock_acquire_duration
            .with_label_values(&[outcome])
            .observe(secs);
        self.lock_acquire_attempts
            .with_label_values(&[])
            .observe(f64::from(attempts));
    }

    /// Records a busy poll while waiting for a lease.
    pub fn lock_contention_wait(&self) {
        self.lock_contention_waits_total.inc();
    }

    /// Records how long a lease was held.
    pub fn lock_held(&self, secs: f64) {
        self.lock_held_duration.with_label_values(&[]).observe(secs);
    }

    /// Returns the acquisition count for an outcome.
    #[must_use]
    pub fn lock_acquire_count(&self, outcome: &str) -> f64 {
        self.lock_acquire_total
            .with_label_values(&[truncate_label(outcome)])
            .get()
    }

    /// Returns the number of busy polls recorded.
    #[must_use]
    pub fn lock_contention_waits(&self) -> u64 {
        self.lock_contention_waits_total.get()
    }

    // --- snapshots ---

    /// Records a snapshot cache lookup; `result` is `"hit"` or `"miss"`.
    pub fn snapshot_cache(&self, projection_type: &str, result: &str) {
        self.snapshot_cache_total
            .with_label_values(&[truncate_label(projection_type), truncate_label(result)])
            .inc();
    }

    /// Records a finished snapshot build.
    pub fn snapshot_built(&self, projection_type: &str, secs: f64, events_replayed: u64) {
        let projection_type = truncate_label(projection_type);
        self.snapshot_build_duration
            .with_label_values(&[projection_type])
            .observe(secs);
        self.snapshot_events_replayed
            .with_label_values(&[projection_type])
            .observe(events_replayed as f64);
    }

    /// Records a base snapshot discarded because its reducer hash differs.
    pub fn reducer_hash_mismatch(&self, projection_type: &str) {
        self.reducer_hash_mismatch_total
            .with_label_values(&[truncate_label(projection_type)])
            .inc();
    }

    /// Records a snapshot write.
    pub fn snapshot_persisted(&self, projection_type: &str, secs: f64) {
        let projection_type = truncate_label(projection_type);
        self.snapshot_persist_total
            .with_label_values(&[projection_type])
            .inc();
        self.snapshot_persist_duration
            .with_label_values(&[projection_type])
            .observe(secs);
    }

    /// Returns the cache lookup count for a projection type and result.
    #[must_use]
    pub fn snapshot_cache_count(&self, projection_type: &str, result: &str) -> f64 {
        self.snapshot_cache_total
            .with_label_values(&[truncate_label(projection_type), truncate_label(result)])
            .get()
    }

    /// Returns the number of builds recorded for a projection type.
    #[must_use]
    pub fn snapshot_build_count(&self, projection_type: &str) -> u64 {
        self.snapshot_build_duration
            .with_label_values(&[truncate_label(projection_type)])
            .get_sample_count()
    }

    /// Returns the total events replayed across builds of a projection type.
    #[must_use]
    pub fn events_replayed_total(&self, projection_type: &str) -> f64 {
        self.snapshot_events_replayed
            .with_label_values(&[truncate_label(projection_type)])
            .get_sample_sum()
    }

    /// Returns the reducer hash mismatch count for a projection type.
    #[must_use]
    pub fn reducer_hash_mismatch_count(&self, projection_type: &str) -> f64 {
        self.reducer_hash_mismatch_total
            .with_label_values(&[truncate_label(projection_type)])
            .get()
    }

    /// Returns the number of snapshots written for a projection type.
    #[must_use]
    pub fn snapshot_persist_count(&self, projection_type: &str) -> f64 {
        self.snapshot_persist_total
            .with_label_values(&[truncate_label(projection_type)])
            .get()
    }

    // --- storage ---

    /// Records one retried storage call.
    pub fn storage_retry(&self, operation: &str) {
        self.storage_retries_total
            .with_label_values(&[truncate_label(operation)])
            .inc();
    }

    /// Returns the retry count for a storage operation.
    #[must_use]
    pub fn storage_retry_count(&self, operation: &str) -> f64 {
        self.storage_retries_total
            .with_label_values(&[truncate_label(operation)])
            .get()
    }
}

/// Renders every family in `registry` in Prometheus text format.
///
/// # Errors
///
/// Returns [`MetricsError::Encoding`] if encoding fails.
pub fn encode_text(registry: &Registry) -> MetricsResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| MetricsError::Encoding(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
}

/// Truncates a label value on a UTF-8 boundary at or before
/// [`MAX_LABEL_VALUE_LEN`] bytes.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn every_family_is_exported() {
        let registry = Registry::new();
        let metrics = BrookMetrics::new(&registry).expect("registration should succeed");

        // Label-vectors only appear once a child exists.
        metrics.append_completed("account", "committed", 0.01);
        metrics.append_failed("account", "conflict");
        metrics.read_completed("account", 0.001);
        metrics.lock_acquired("acquired", 0.002, 1);
        metrics.lock_contention_wait();
        metrics.lock_held(0.01);
        metrics.snapshot_cache("balance", "hit");
        metrics.snapshot_built("balance", 0.02, 3);
        metrics.reducer_hash_mismatch("balance");
        metrics.snapshot_persisted("balance", 0.001);
        metrics.storage_retry("put");

        let text = encode_text(&registry).expect("encoding should succeed");
        for name in METRIC_NAMES {
            assert!(text.contains(name), "missing metric family {name}");
        }
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        BrookMetrics::new(&registry).expect("first registration should succeed");
        assert!(matches!(
            BrookMetrics::new(&registry),
            Err(MetricsError::Registration(_))
        ));
    }

    #[test]
    fn accessors_reflect_recorded_values() {
        let metrics = BrookMetrics::new(&Registry::new()).expect("registration should succeed");
        metrics.snapshot_built("balance", 0.01, 4);
        metrics.snapshot_built("balance", 0.01, 6);
        assert_eq!(metrics.snapshot_build_count("balance"), 2);
        assert_eq!(metrics.events_replayed_total("balance"), 10.0);

        metrics.lock_contention_wait();
        metrics.lock_contention_wait();
        assert_eq!(metrics.lock_contention_waits(), 2);
    }

    #[test]
    fn label_truncation_is_utf8_safe() {
        let long = "é".repeat(MAX_LABEL_VALUE_LEN);
        let truncated = truncate_label(&long);
        assert!(truncated.len() <= MAX_LABEL_VALUE_LEN);
        assert!(truncated.chars().all(|c| c == 'é'));
        assert_eq!(truncate_label("short"), "short");
    }
}
