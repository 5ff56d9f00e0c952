//! Coordination-store access for the Datumflow worker driver.
//!
//! Provides the [`CoordStore`] client (six logical collections: jobs,
//! pipelines, plans, shards, chunks, merges, accessed exclusively through
//! atomic transactions) and the job-state manager built on top of it.

#![warn(clippy::pedantic)]

pub mod error;
pub mod jobs;
pub mod schema;
pub mod store;

pub use error::StateError;
pub use jobs::delete_job;
pub use store::{CoordStore, StoreTxn};
