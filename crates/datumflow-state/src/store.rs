//! `SQLite`-backed coordination-store client.
//!
//! Uses a single `Mutex<Connection>` for thread safety. All reads and
//! writes go through [`CoordStore::with_transaction`]: the closure runs
//! against a consistent snapshot and commits atomically, and a detected
//! write conflict retries the whole closure up to a bound before being
//! surfaced as [`StateError::Conflict`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use datumflow_types::ids::{JobId, PipelineId};
use datumflow_types::job::JobRecord;
use datumflow_types::pipeline::PipelineSpec;
use datumflow_types::plan::{ChunkRecord, MergeRecord, PlanRecord, ShardRecord};

use crate::error::{self, StateError};
use crate::schema::CREATE_TABLES;

/// Upper bound on transparent conflict retries per transaction.
const MAX_TXN_ATTEMPTS: u32 = 5;

/// Linear backoff step between conflict retries.
const RETRY_BACKOFF_MS: u64 = 20;

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Client for the cluster coordination store.
///
/// Create with [`CoordStore::open`] for file-backed persistence or
/// [`CoordStore::in_memory`] for tests.
pub struct CoordStore {
    conn: Mutex<Connection>,
}

impl CoordStore {
    /// Open or create a coordination-store database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created, or
    /// [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Run `f` inside an atomic transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back when it returns `Err`.
    /// Write conflicts (`SQLITE_BUSY`/`SQLITE_LOCKED`) retry the whole
    /// closure with linear backoff; after [`MAX_TXN_ATTEMPTS`] the conflict
    /// is surfaced as [`StateError::Conflict`]. `f` must therefore be safe
    /// to re-run from scratch.
    ///
    /// # Errors
    ///
    /// Returns the closure's error unchanged, or [`StateError::Conflict`]
    /// after exhausting retries.
    pub fn with_transaction<T, F>(&self, mut f: F) -> error::Result<T>
    where
        F: FnMut(&StoreTxn<'_>) -> error::Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let run = {
                let mut conn = self.lock_conn()?;
                run_in_txn(&mut conn, &mut f)
            };
            match run {
                Ok(value) => return Ok(value),
                Err(err) if is_conflict(&err) => {
                    if attempt >= MAX_TXN_ATTEMPTS {
                        return Err(StateError::Conflict { attempts: attempt });
                    }
                    tracing::debug!(attempt, "coordination store write conflict; retrying");
                    std::thread::sleep(Duration::from_millis(
                        RETRY_BACKOFF_MS * u64::from(attempt),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn run_in_txn<T, F>(conn: &mut Connection, f: &mut F) -> error::Result<T>
where
    F: FnMut(&StoreTxn<'_>) -> error::Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let txn = StoreTxn { tx };
    let value = f(&txn)?;
    txn.tx.commit()?;
    Ok(value)
}

/// True for optimistic-concurrency losses worth retrying.
fn is_conflict(err: &StateError) -> bool {
    match err {
        StateError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Handle to an open transaction, with typed accessors per collection.
///
/// Borrowed by the closure passed to [`CoordStore::with_transaction`];
/// operations like job deletion take it as a parameter so they compose into
/// a larger caller-owned atomic unit instead of opening their own.
pub struct StoreTxn<'conn> {
    tx: Transaction<'conn>,
}

impl StoreTxn<'_> {
    fn get_doc<T: DeserializeOwned, P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> error::Result<Option<T>> {
        let mut stmt = self.tx.prepare(sql)?;
        match stmt.query_row(params, |row| row.get::<_, String>(0)) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_docs<T: DeserializeOwned, P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> error::Result<Vec<T>> {
        let mut stmt = self.tx.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for data in rows {
            out.push(serde_json::from_str(&data?)?);
        }
        Ok(out)
    }

    fn encode<T: Serialize>(value: &T) -> error::Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Read a job record. `Ok(None)` when no record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or decode failure.
    pub fn get_job(&self, id: &JobId) -> error::Result<Option<JobRecord>> {
        self.get_doc("SELECT data FROM jobs WHERE id = ?1", [id.as_str()])
    }

    /// Upsert a job record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or encode failure.
    pub fn put_job(&self, job: &JobRecord) -> error::Result<()> {
        self.tx.execute(
            "INSERT INTO jobs (id, data, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET data = ?2, updated_at = ?3",
            rusqlite::params![job.job.as_str(), Self::encode(job)?, Self::now_sqlite()],
        )?;
        Ok(())
    }

    /// Delete a job record. Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    pub fn delete_job_record(&self, id: &JobId) -> error::Result<()> {
        self.tx
            .execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
        Ok(())
    }

    // ── Pipelines ───────────────────────────────────────────────────

    /// Read a pipeline spec. `Ok(None)` when no record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or decode failure.
    pub fn get_pipeline(&self, id: &PipelineId) -> error::Result<Option<PipelineSpec>> {
        self.get_doc("SELECT data FROM pipelines WHERE id = ?1", [id.as_str()])
    }

    /// Upsert a pipeline spec.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or encode failure.
    pub fn put_pipeline(&self, spec: &PipelineSpec) -> error::Result<()> {
        self.tx.execute(
            "INSERT INTO pipelines (id, data, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET data = ?2, updated_at = ?3",
            rusqlite::params![spec.id.as_str(), Self::encode(spec)?, Self::now_sqlite()],
        )?;
        Ok(())
    }

    // ── Plans ───────────────────────────────────────────────────────

    /// Read the plan for a job. `Ok(None)` when no plan exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or decode failure.
    pub fn get_plan(&self, job: &JobId) -> error::Result<Option<PlanRecord>> {
        self.get_doc("SELECT data FROM plans WHERE job_id = ?1", [job.as_str()])
    }

    /// Upsert the plan for a job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or encode failure.
    pub fn put_plan(&self, plan: &PlanRecord) -> error::Result<()> {
        self.tx.execute(
            "INSERT INTO plans (job_id, data) VALUES (?1, ?2) \
             ON CONFLICT(job_id) DO UPDATE SET data = ?2",
            rusqlite::params![plan.job.as_str(), Self::encode(plan)?],
        )?;
        Ok(())
    }

    /// Delete the plan for a job, if present.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    pub fn delete_plan(&self, job: &JobId) -> error::Result<()> {
        self.tx
            .execute("DELETE FROM plans WHERE job_id = ?1", [job.as_str()])?;
        Ok(())
    }

    // ── Shards ──────────────────────────────────────────────────────

    /// Upsert a shard assignment.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or encode failure.
    pub fn put_shard(&self, shard: &ShardRecord) -> error::Result<()> {
        self.tx.execute(
            "INSERT INTO shards (id, data) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET data = ?2",
            rusqlite::params![shard.id, Self::encode(shard)?],
        )?;
        Ok(())
    }

    /// List all shard assignments, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or decode failure.
    pub fn list_shards(&self) -> error::Result<Vec<ShardRecord>> {
        self.list_docs("SELECT data FROM shards ORDER BY id", [])
    }

    // ── Chunks ──────────────────────────────────────────────────────

    /// Upsert a chunk record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or encode failure.
    pub fn put_chunk(&self, chunk: &ChunkRecord) -> error::Result<()> {
        self.tx.execute(
            "INSERT INTO chunks (job_id, id, data) VALUES (?1, ?2, ?3) \
             ON CONFLICT(job_id, id) DO UPDATE SET data = ?3",
            rusqlite::params![chunk.job.as_str(), chunk.id, Self::encode(chunk)?],
        )?;
        Ok(())
    }

    /// List a job's chunk records, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or decode failure.
    pub fn list_chunks(&self, job: &JobId) -> error::Result<Vec<ChunkRecord>> {
        self.list_docs(
            "SELECT data FROM chunks WHERE job_id = ?1 ORDER BY id",
            [job.as_str()],
        )
    }

    /// Delete every chunk record for a job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    pub fn delete_chunks(&self, job: &JobId) -> error::Result<()> {
        self.tx
            .execute("DELETE FROM chunks WHERE job_id = ?1", [job.as_str()])?;
        Ok(())
    }

    // ── Merges ──────────────────────────────────────────────────────

    /// Upsert a merge record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or encode failure.
    pub fn put_merge(&self, merge: &MergeRecord) -> error::Result<()> {
        self.tx.execute(
            "INSERT INTO merges (job_id, id, data) VALUES (?1, ?2, ?3) \
             ON CONFLICT(job_id, id) DO UPDATE SET data = ?3",
            rusqlite::params![merge.job.as_str(), merge.id, Self::encode(merge)?],
        )?;
        Ok(())
    }

    /// List a job's merge records, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or decode failure.
    pub fn list_merges(&self, job: &JobId) -> error::Result<Vec<MergeRecord>> {
        self.list_docs(
            "SELECT data FROM merges WHERE job_id = ?1 ORDER BY id",
            [job.as_str()],
        )
    }

    /// Delete every merge record for a job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    pub fn delete_merges(&self, job: &JobId) -> error::Result<()> {
        self.tx
            .execute("DELETE FROM merges WHERE job_id = ?1", [job.as_str()])?;
        Ok(())
    }
}
