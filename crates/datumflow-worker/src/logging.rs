//! Structured logging for worker operations.
//!
//! [`TaggedLogger`] carries job and datum identity so every line emitted
//! while processing a datum is attributable. Production loggers sink to
//! `tracing`; tests swap in a capture sink and assert on the emitted lines.

use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use datumflow_types::ids::{DatumId, JobId};

/// Initialize structured logging with tracing-subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to the provided level.
pub fn init(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[derive(Clone)]
enum Sink {
    Tracing,
    Capture(Arc<Mutex<Vec<String>>>),
}

/// Logger tagged with job and datum identity.
#[derive(Clone)]
pub struct TaggedLogger {
    job: Option<JobId>,
    datum: Option<DatumId>,
    sink: Sink,
}

impl TaggedLogger {
    /// Logger that sinks to `tracing`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            job: None,
            datum: None,
            sink: Sink::Tracing,
        }
    }

    /// Logger that records lines into a buffer (for tests).
    #[must_use]
    pub fn capture() -> (Self, CapturedLogs) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let logger = Self {
            job: None,
            datum: None,
            sink: Sink::Capture(buffer.clone()),
        };
        (logger, CapturedLogs(buffer))
    }

    /// Tag subsequent lines with a job id.
    #[must_use]
    pub fn with_job(mut self, job: JobId) -> Self {
        self.job = Some(job);
        self
    }

    /// Tag subsequent lines with a datum id.
    #[must_use]
    pub fn with_datum(mut self, datum: DatumId) -> Self {
        self.datum = Some(datum);
        self
    }

    /// The job label for metric tuples; empty when no job is tagged.
    #[must_use]
    pub fn job_label(&self) -> &str {
        self.job.as_ref().map_or("", JobId::as_str)
    }

    /// The datum label; empty when no datum is tagged.
    #[must_use]
    pub fn datum_label(&self) -> &str {
        self.datum.as_ref().map_or("", DatumId::as_str)
    }

    /// Emit one tagged line.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        match &self.sink {
            Sink::Tracing => {
                tracing::info!(
                    job = self.job_label(),
                    datum = self.datum_label(),
                    "{message}"
                );
            }
            Sink::Capture(buffer) => {
                if let Ok(mut lines) = buffer.lock() {
                    lines.push(message.to_string());
                }
            }
        }
    }
}

impl Default for TaggedLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the lines recorded by a capture logger.
pub struct CapturedLogs(Arc<Mutex<Vec<String>>>);

impl CapturedLogs {
    /// Snapshot of all lines emitted so far.
    ///
    /// # Panics
    ///
    /// Panics if the capture buffer mutex is poisoned.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
