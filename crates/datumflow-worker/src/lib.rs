//! Per-worker execution driver for Datumflow pipelines.
//!
//! For each datum the outer worker loop obtains, this crate stages its
//! inputs into a scratch directory, runs the user transform against them
//! under a time budget, records the outcome through the coordination store,
//! and reports metrics about every step.

pub mod driver;
pub mod errors;
pub mod logging;
pub mod metrics;
pub(crate) mod runner;
pub mod stager;
#[cfg(test)]
mod testutil;

// Re-export public API for convenience
pub use driver::{Driver, NoopProvisioner, Provisioner};
pub use errors::DriverError;
pub use logging::TaggedLogger;
pub use metrics::DriverMetrics;
pub use stager::{ContentStore, Fetcher, LocalContentStore};
