//! Label-checked metric vectors.
//!
//! Each vector declares its label scheme at construction, either 2-label
//! `{pipeline, job}` or 3-label `{pipeline, job, state}`, and that shape
//! never changes afterwards. Updates supply a full label tuple; an arity
//! mismatch is rejected without touching the metric, so instrumentation can
//! never corrupt or abort the work it is measuring. Label-set stability is
//! the compatibility contract with the external scraping system.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Label scheme for per-datum metrics.
pub const DATUM_LABELS: &[&str] = &["pipeline", "job"];

/// Label scheme for per-datum metrics split by outcome state.
pub const DATUM_LABELS_WITH_STATE: &[&str] = &["pipeline", "job", "state"];

/// An update supplied the wrong number of label values.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("expected {expected} label values but got {got}")]
pub struct LabelArityError {
    pub expected: usize,
    pub got: usize,
}

fn check_arity(declared: &[&str], values: &[&str]) -> Result<Vec<String>, LabelArityError> {
    if values.len() != declared.len() {
        return Err(LabelArityError {
            expected: declared.len(),
            got: values.len(),
        });
    }
    Ok(values.iter().map(ToString::to_string).collect())
}

// Metric cells stay usable even after a panic poisoned the mutex; the map
// itself is still structurally sound.
fn recover<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// A set of monotonic counters keyed by label tuple.
pub struct CounterVec {
    name: &'static str,
    labels: &'static [&'static str],
    cells: Mutex<HashMap<Vec<String>, f64>>,
}

impl CounterVec {
    /// Declare a counter vector with a fixed label scheme.
    #[must_use]
    pub fn new(name: &'static str, labels: &'static [&'static str]) -> Self {
        Self {
            name,
            labels,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Metric name, as exposed to the scraping system.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declared label names.
    #[must_use]
    pub fn label_names(&self) -> &'static [&'static str] {
        self.labels
    }

    /// Run `f` against the cell for `values`, creating it at zero on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`LabelArityError`] without touching any cell when `values`
    /// does not match the declared label count.
    pub fn with_cell<R>(
        &self,
        values: &[&str],
        f: impl FnOnce(&mut f64) -> R,
    ) -> Result<R, LabelArityError> {
        let key = check_arity(self.labels, values)?;
        let mut cells = recover(self.cells.lock());
        Ok(f(cells.entry(key).or_insert(0.0)))
    }

    /// Current value of the cell for `values`; `None` when never updated.
    #[must_use]
    pub fn value(&self, values: &[&str]) -> Option<f64> {
        let key: Vec<String> = values.iter().map(ToString::to_string).collect();
        recover(self.cells.lock()).get(&key).copied()
    }

    /// All populated cells, for exposition.
    #[must_use]
    pub fn samples(&self) -> Vec<(Vec<String>, f64)> {
        let cells = recover(self.cells.lock());
        let mut out: Vec<_> = cells.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// One histogram cell: cumulative bucket counts plus count/sum.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: Vec<f64>,
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new(bounds: Vec<f64>) -> Self {
        let buckets = bounds.len();
        Self {
            bounds,
            bucket_counts: vec![0; buckets],
            count: 0,
            sum: 0.0,
        }
    }

    /// Record one observation.
    pub fn observe(&mut self, value: f64) {
        for (bound, count) in self.bounds.iter().zip(self.bucket_counts.iter_mut()) {
            if value <= *bound {
                *count += 1;
            }
        }
        self.count += 1;
        self.sum += value;
    }

    /// Number of recorded observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of recorded observations.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Cumulative count per upper bound, for exposition.
    #[must_use]
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.bounds
            .iter()
            .copied()
            .zip(self.bucket_counts.iter().copied())
            .collect()
    }
}

/// A set of histograms keyed by label tuple, sharing one bucket layout.
pub struct HistogramVec {
    name: &'static str,
    labels: &'static [&'static str],
    bounds: Vec<f64>,
    cells: Mutex<HashMap<Vec<String>, Histogram>>,
}

impl HistogramVec {
    /// Declare a histogram vector with a fixed label scheme and buckets.
    #[must_use]
    pub fn new(name: &'static str, labels: &'static [&'static str], bounds: Vec<f64>) -> Self {
        Self {
            name,
            labels,
            bounds,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Metric name, as exposed to the scraping system.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declared label names.
    #[must_use]
    pub fn label_names(&self) -> &'static [&'static str] {
        self.labels
    }

    /// Run `f` against the histogram for `values`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`LabelArityError`] without touching any cell when `values`
    /// does not match the declared label count.
    pub fn with_cell<R>(
        &self,
        values: &[&str],
        f: impl FnOnce(&mut Histogram) -> R,
    ) -> Result<R, LabelArityError> {
        let key = check_arity(self.labels, values)?;
        let mut cells = recover(self.cells.lock());
        let cell = cells
            .entry(key)
            .or_insert_with(|| Histogram::new(self.bounds.clone()));
        Ok(f(cell))
    }

    /// Observation count of the cell for `values`; `None` when never
    /// observed.
    #[must_use]
    pub fn sample_count(&self, values: &[&str]) -> Option<u64> {
        let key: Vec<String> = values.iter().map(ToString::to_string).collect();
        recover(self.cells.lock()).get(&key).map(Histogram::count)
    }

    /// All populated cells, for exposition.
    #[must_use]
    pub fn samples(&self) -> Vec<(Vec<String>, Histogram)> {
        let cells = recover(self.cells.lock());
        let mut out: Vec<_> = cells.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// Exponential bucket upper bounds: `start * factor^i` for `i in 0..count`.
#[must_use]
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    let mut bounds = Vec::with_capacity(count);
    let mut bound = start;
    for _ in 0..count {
        bounds.push(bound);
        bound *= factor;
    }
    bounds
}

/// Every metric vector the driver reports to.
///
/// Constructed once per [`Driver`](crate::Driver) and owned by it for its
/// lifetime. There is no process-wide registry, so multiple drivers
/// coexist in one process.
pub struct DriverMetrics {
    pub datum_count: CounterVec,
    pub datum_proc_time: HistogramVec,
    pub datum_proc_seconds: CounterVec,
    pub datum_download_time: HistogramVec,
    pub datum_download_seconds: CounterVec,
    pub datum_download_size: HistogramVec,
    pub datum_download_bytes: CounterVec,
    pub datum_upload_time: HistogramVec,
    pub datum_upload_seconds: CounterVec,
    pub datum_upload_size: HistogramVec,
    pub datum_upload_bytes: CounterVec,
}

impl DriverMetrics {
    #[must_use]
    pub fn new() -> Self {
        let time_buckets = || exponential_buckets(1.0, 2.0, 20);
        let size_buckets = || exponential_buckets(1.0, 2.0, 20);
        Self {
            datum_count: CounterVec::new("datum_count", DATUM_LABELS_WITH_STATE),
            datum_proc_time: HistogramVec::new(
                "datum_proc_time",
                DATUM_LABELS_WITH_STATE,
                time_buckets(),
            ),
            datum_proc_seconds: CounterVec::new("datum_proc_seconds_count", DATUM_LABELS),
            datum_download_time: HistogramVec::new(
                "datum_download_time",
                DATUM_LABELS,
                time_buckets(),
            ),
            datum_download_seconds: CounterVec::new("datum_download_seconds_count", DATUM_LABELS),
            datum_download_size: HistogramVec::new(
                "datum_download_size",
                DATUM_LABELS,
                size_buckets(),
            ),
            datum_download_bytes: CounterVec::new("datum_download_bytes_count", DATUM_LABELS),
            datum_upload_time: HistogramVec::new("datum_upload_time", DATUM_LABELS, time_buckets()),
            datum_upload_seconds: CounterVec::new("datum_upload_seconds_count", DATUM_LABELS),
            datum_upload_size: HistogramVec::new("datum_upload_size", DATUM_LABELS, size_buckets()),
            datum_upload_bytes: CounterVec::new("datum_upload_bytes_count", DATUM_LABELS),
        }
    }
}

impl Default for DriverMetrics {
    fn default() -> Self {
        Self::new()
    }
}
