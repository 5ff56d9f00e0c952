//! Collection table definitions.
//!
//! One table per logical collection. Every row is a single JSON document
//! keyed by its entity id; chunks and merges are additionally scoped by the
//! owning job so teardown can remove them by prefix.

/// Idempotent DDL for the six collections.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS plans (
    job_id TEXT PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shards (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    job_id TEXT NOT NULL,
    id INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (job_id, id)
);

CREATE TABLE IF NOT EXISTS merges (
    job_id TEXT NOT NULL,
    id INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (job_id, id)
);

CREATE INDEX IF NOT EXISTS idx_chunks_job ON chunks (job_id);
CREATE INDEX IF NOT EXISTS idx_merges_job ON merges (job_id);
";
