//! Shared model types for the Datumflow worker driver.
//!
//! Pure data types used by the coordination-store client and the worker
//! crate. Kept in their own crate so persistence and execution can share
//! them without circular dependencies.

pub mod ids;
pub mod input;
pub mod job;
pub mod pipeline;
pub mod plan;
pub mod stats;
