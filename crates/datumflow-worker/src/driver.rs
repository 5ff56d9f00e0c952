//! Process-local driver state.
//!
//! One [`Driver`] exists per worker process. It owns the immutable pipeline
//! descriptor, the coordination-store client, the staging collaborators, and
//! every metric vector it reports to. Nothing is global, so multiple
//! drivers coexist in one process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use datumflow_state::error as state_error;
use datumflow_state::CoordStore;
use datumflow_types::ids::{CommitRef, JobId};
use datumflow_types::job::{JobRecord, JobState};
use datumflow_types::pipeline::PipelineSpec;
use datumflow_types::stats::ProcessStats;

use crate::errors::{outcome_label, DriverError};
use crate::logging::TaggedLogger;
use crate::metrics::{CounterVec, DriverMetrics, Histogram, HistogramVec};
use crate::stager::{ContentStore, Fetcher};

/// Opaque start/stop capability for worker processes. Provisioning itself
/// lives outside this crate.
pub trait Provisioner: Send + Sync {
    /// Start worker replicas for a pipeline.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn start_worker(&self, pipeline: &PipelineSpec) -> anyhow::Result<()>;

    /// Stop worker replicas for a pipeline.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn stop_worker(&self, pipeline: &PipelineSpec) -> anyhow::Result<()>;
}

/// Provisioner that does nothing (for tests and single-process setups).
pub struct NoopProvisioner;

impl Provisioner for NoopProvisioner {
    fn start_worker(&self, _pipeline: &PipelineSpec) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop_worker(&self, _pipeline: &PipelineSpec) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-worker execution driver.
pub struct Driver {
    pipeline: Arc<PipelineSpec>,
    store: Arc<CoordStore>,
    provisioner: Arc<dyn Provisioner>,
    content_store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
    scratch_root: PathBuf,
    worker_id: String,
    metrics: DriverMetrics,
}

impl Driver {
    /// Build a driver for one worker process.
    ///
    /// All metric vectors are constructed here; their label schemes never
    /// change afterwards.
    #[must_use]
    pub fn new(
        pipeline: Arc<PipelineSpec>,
        store: Arc<CoordStore>,
        provisioner: Arc<dyn Provisioner>,
        content_store: Arc<dyn ContentStore>,
        fetcher: Arc<dyn Fetcher>,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            pipeline,
            store,
            provisioner,
            content_store,
            fetcher,
            scratch_root,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            metrics: DriverMetrics::new(),
        }
    }

    /// The immutable pipeline this worker executes.
    #[must_use]
    pub fn pipeline(&self) -> &PipelineSpec {
        &self.pipeline
    }

    /// Coordination-store client handle.
    #[must_use]
    pub fn store(&self) -> &CoordStore {
        &self.store
    }

    /// Node-provisioning collaborator handle.
    #[must_use]
    pub fn provisioner(&self) -> &dyn Provisioner {
        self.provisioner.as_ref()
    }

    pub(crate) fn content_store(&self) -> &dyn ContentStore {
        self.content_store.as_ref()
    }

    pub(crate) fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub(crate) fn scratch_root(&self) -> &PathBuf {
        &self.scratch_root
    }

    /// Process-unique worker identifier.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The metric vectors owned by this driver, for exposition.
    #[must_use]
    pub fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    /// Atomically transition a job, writing state, stats-commit reference,
    /// and reason as one mutation.
    ///
    /// # Errors
    ///
    /// See [`CoordStore::update_job_state`].
    pub fn update_job_state(
        &self,
        job_id: &JobId,
        stats_commit: Option<&CommitRef>,
        new_state: JobState,
        reason: &str,
    ) -> state_error::Result<JobRecord> {
        self.store
            .update_job_state(job_id, stats_commit, new_state, reason)
    }

    // ── Label-checked metric updates ────────────────────────────────
    //
    // The pipeline label comes from the driver's descriptor and the job
    // label from the logger's context; callers supply at most the state.
    // A mismatch against the vector's declared scheme logs one line and
    // leaves the metric untouched; it never aborts the measured operation.

    pub(crate) fn update_counter(
        &self,
        vec: &CounterVec,
        logger: &TaggedLogger,
        state: Option<&str>,
        f: impl FnOnce(&mut f64),
    ) {
        let mut values = vec![self.pipeline.id.as_str(), logger.job_label()];
        if let Some(state) = state {
            values.push(state);
        }
        if let Err(err) = vec.with_cell(&values, f) {
            logger.log(format!("failed to update counter {}: {err}", vec.name()));
        }
    }

    pub(crate) fn update_histogram(
        &self,
        vec: &HistogramVec,
        logger: &TaggedLogger,
        state: Option<&str>,
        f: impl FnOnce(&mut Histogram),
    ) {
        let mut values = vec![self.pipeline.id.as_str(), logger.job_label()];
        if let Some(state) = state {
            values.push(state);
        }
        if let Err(err) = vec.with_cell(&values, f) {
            logger.log(format!("failed to update histogram {}: {err}", vec.name()));
        }
    }

    // ── Derived stat reporters ──────────────────────────────────────

    /// Count a datum entering user-code execution.
    pub(crate) fn report_user_code_stats(&self, logger: &TaggedLogger) {
        self.update_counter(&self.metrics.datum_count, logger, Some("started"), |c| {
            *c += 1.0;
        });
    }

    /// The single finalizer for every user-code exit path: classifies the
    /// outcome into a state label and reports exactly one sample.
    pub(crate) fn report_deferred_user_code_stats(
        &self,
        result: &Result<(), DriverError>,
        start: Instant,
        logger: &TaggedLogger,
    ) {
        let state = outcome_label(result);
        let secs = start.elapsed().as_secs_f64();
        self.update_counter(&self.metrics.datum_count, logger, Some(state), |c| {
            *c += 1.0;
        });
        self.update_histogram(&self.metrics.datum_proc_time, logger, Some(state), |h| {
            h.observe(secs);
        });
        self.update_counter(&self.metrics.datum_proc_seconds, logger, None, |c| {
            *c += secs;
        });
    }

    /// Report staged-input byte counts.
    pub(crate) fn report_download_size_stats(&self, bytes: u64, logger: &TaggedLogger) {
        #[allow(clippy::cast_precision_loss)]
        let size = bytes as f64;
        self.update_histogram(&self.metrics.datum_download_size, logger, None, |h| {
            h.observe(size);
        });
        self.update_counter(&self.metrics.datum_download_bytes, logger, None, |c| {
            *c += size;
        });
    }

    /// Report staging wall time and fold it into the stats accumulator.
    pub(crate) fn report_download_time_stats(
        &self,
        start: Instant,
        stats: &mut ProcessStats,
        logger: &TaggedLogger,
    ) {
        let secs = start.elapsed().as_secs_f64();
        stats.download_secs += secs;
        self.update_histogram(&self.metrics.datum_download_time, logger, None, |h| {
            h.observe(secs);
        });
        self.update_counter(&self.metrics.datum_download_seconds, logger, None, |c| {
            *c += secs;
        });
    }

    /// Report output-upload wall time and size and fold them into the stats
    /// accumulator.
    pub fn report_upload_stats(
        &self,
        start: Instant,
        stats: &mut ProcessStats,
        logger: &TaggedLogger,
    ) {
        let secs = start.elapsed().as_secs_f64();
        stats.upload_secs += secs;
        self.update_histogram(&self.metrics.datum_upload_time, logger, None, |h| {
            h.observe(secs);
        });
        self.update_counter(&self.metrics.datum_upload_seconds, logger, None, |c| {
            *c += secs;
        });
        #[allow(clippy::cast_precision_loss)]
        let size = stats.upload_bytes as f64;
        self.update_histogram(&self.metrics.datum_upload_size, logger, None, |h| {
            h.observe(size);
        });
        self.update_counter(&self.metrics.datum_upload_bytes, logger, None, |c| {
            *c += size;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{exponential_buckets, DATUM_LABELS, DATUM_LABELS_WITH_STATE};
    use crate::testutil::test_driver;

    fn logger() -> (TaggedLogger, crate::logging::CapturedLogs) {
        let (logger, logs) = TaggedLogger::capture();
        (logger.with_job(JobId::new("job-id")), logs)
    }

    #[test]
    fn worker_ids_are_process_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = test_driver(dir.path());
        let b = test_driver(dir.path());
        assert_ne!(a.worker_id(), b.worker_id());
    }

    #[test]
    fn counter_update_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (logger, logs) = logger();

        let counter = CounterVec::new("test_counter", DATUM_LABELS);
        driver.update_counter(&counter, &logger, None, |c| *c += 1.0);

        assert!(logs.lines().is_empty(), "valid update must not log");
        assert_eq!(counter.value(&["foo", "job-id"]), Some(1.0));

        // A state value against the 2-label scheme is rejected and logged.
        driver.update_counter(&counter, &logger, Some("bar"), |c| *c += 1.0);
        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("expected 2 label values but got 3"));
        assert_eq!(counter.value(&["foo", "job-id"]), Some(1.0));
    }

    #[test]
    fn counter_update_with_state() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (logger, logs) = logger();

        let counter = CounterVec::new("test_counter_with_state", DATUM_LABELS_WITH_STATE);

        // Omitting the state against the 3-label scheme is rejected.
        driver.update_counter(&counter, &logger, None, |c| *c += 1.0);
        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("expected 3 label values but got 2"));
        assert!(counter.samples().is_empty());

        driver.update_counter(&counter, &logger, Some("bar"), |c| *c += 1.0);
        assert_eq!(counter.value(&["foo", "job-id", "bar"]), Some(1.0));
        assert_eq!(logs.lines().len(), 1, "valid update must not log");
    }

    #[test]
    fn histogram_update_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (logger, logs) = logger();

        let histogram = HistogramVec::new(
            "test_histogram",
            DATUM_LABELS,
            exponential_buckets(1.0, 2.0, 20),
        );
        driver.update_histogram(&histogram, &logger, Some("bar"), |h| h.observe(0.0));
        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("expected 2 label values but got 3"));
        assert!(histogram.samples().is_empty());

        driver.update_histogram(&histogram, &logger, None, |h| h.observe(0.0));
        assert_eq!(histogram.sample_count(&["foo", "job-id"]), Some(1));
    }

    #[test]
    fn histogram_update_with_state() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (logger, logs) = logger();

        let histogram = HistogramVec::new(
            "test_histogram_with_state",
            DATUM_LABELS_WITH_STATE,
            exponential_buckets(1.0, 2.0, 20),
        );
        driver.update_histogram(&histogram, &logger, Some("bar"), |h| h.observe(0.0));
        assert_eq!(histogram.sample_count(&["foo", "job-id", "bar"]), Some(1));
        assert!(logs.lines().is_empty());

        driver.update_histogram(&histogram, &logger, None, |h| h.observe(0.0));
        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("expected 3 label values but got 2"));
        assert_eq!(histogram.sample_count(&["foo", "job-id", "bar"]), Some(1));
    }

    #[test]
    fn deferred_stats_report_exactly_one_sample() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (logger, _logs) = logger();

        let start = Instant::now();
        driver.report_deferred_user_code_stats(&Ok(()), start, &logger);
        assert_eq!(
            driver
                .metrics()
                .datum_count
                .value(&["foo", "job-id", "success"]),
            Some(1.0)
        );
        assert_eq!(
            driver
                .metrics()
                .datum_proc_time
                .sample_count(&["foo", "job-id", "success"]),
            Some(1)
        );

        driver.report_deferred_user_code_stats(
            &Err(DriverError::Timeout { limit_secs: 1.0 }),
            start,
            &logger,
        );
        assert_eq!(
            driver
                .metrics()
                .datum_count
                .value(&["foo", "job-id", "timeout"]),
            Some(1.0)
        );
    }

    #[test]
    fn upload_stats_fold_into_accumulator() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        let (logger, _logs) = logger();

        let mut stats = ProcessStats {
            upload_bytes: 2048,
            ..ProcessStats::default()
        };
        driver.report_upload_stats(Instant::now(), &mut stats, &logger);
        assert!(stats.upload_secs >= 0.0);
        assert_eq!(
            driver
                .metrics()
                .datum_upload_bytes
                .value(&["foo", "job-id"]),
            Some(2048.0)
        );
        assert_eq!(
            driver
                .metrics()
                .datum_upload_size
                .sample_count(&["foo", "job-id"]),
            Some(1)
        );
    }
}
