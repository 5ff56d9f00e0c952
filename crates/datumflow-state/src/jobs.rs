//! Job-state management.
//!
//! All job mutation funnels through here: [`CoordStore::update_job_state`]
//! for transitions and [`delete_job`] for teardown. Transitions are
//! monotonic over `created -> running -> {success, failure, killed}`;
//! terminal states absorb.

use datumflow_types::ids::{CommitRef, JobId};
use datumflow_types::job::{JobRecord, JobState};

use crate::error::{self, StateError};
use crate::store::{CoordStore, StoreTxn};

fn rank(state: JobState) -> u8 {
    match state {
        JobState::Created => 0,
        JobState::Running => 1,
        JobState::Success | JobState::Failure | JobState::Killed => 2,
    }
}

impl CoordStore {
    /// Atomically transition a job to `new_state`.
    ///
    /// The state, stats-commit reference, and reason are written as one
    /// mutation: readers observe the whole triple or none of it. Writing a
    /// terminal state a job is already in is an idempotent no-op; a
    /// `running -> running` write counts a restart.
    ///
    /// # Errors
    ///
    /// [`StateError::JobNotFound`] when no record exists,
    /// [`StateError::InvalidTransition`] when the job is already in a
    /// different terminal state or the transition would move backwards
    /// (the record is left unchanged), [`StateError::Conflict`] when the
    /// bounded retry policy is exhausted.
    pub fn update_job_state(
        &self,
        job_id: &JobId,
        stats_commit: Option<&CommitRef>,
        new_state: JobState,
        reason: &str,
    ) -> error::Result<JobRecord> {
        self.with_transaction(|txn| {
            let mut record = txn
                .get_job(job_id)?
                .ok_or_else(|| StateError::JobNotFound(job_id.clone()))?;

            if record.state.is_terminal() {
                if record.state == new_state {
                    return Ok(record);
                }
                return Err(StateError::InvalidTransition {
                    job: job_id.clone(),
                    from: record.state,
                    to: new_state,
                });
            }
            if rank(new_state) < rank(record.state) {
                return Err(StateError::InvalidTransition {
                    job: job_id.clone(),
                    from: record.state,
                    to: new_state,
                });
            }

            if record.state == JobState::Running && new_state == JobState::Running {
                record.restart += 1;
            }
            record.state = new_state;
            record.stats_commit = stats_commit.cloned();
            record.reason = reason.to_string();
            txn.put_job(&record)?;

            tracing::info!(
                job = %record.job,
                state = %record.state,
                reason,
                "job state updated"
            );
            Ok(record)
        })
    }
}

/// Delete a job and everything keyed by it: the job record, every chunk and
/// merge record, and the plan entry if present.
///
/// Takes an already-open transaction so callers can fold the deletion into
/// a larger atomic unit (e.g. alongside writing a successor job). Never
/// opens or retries its own transaction.
///
/// # Errors
///
/// Returns [`StateError`] on storage failure; the caller's transaction
/// rolls back and nothing is deleted.
pub fn delete_job(txn: &StoreTxn<'_>, job: &JobRecord) -> error::Result<()> {
    txn.delete_chunks(&job.job)?;
    txn.delete_merges(&job.job)?;
    txn.delete_plan(&job.job)?;
    txn.delete_job_record(&job.job)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datumflow_types::ids::PipelineId;
    use datumflow_types::plan::{ChunkRecord, ChunkState, MergeRecord, MergeState, PlanRecord};

    fn store_with_job(id: &str) -> CoordStore {
        let store = CoordStore::in_memory().unwrap();
        store
            .with_transaction(|txn| {
                txn.put_job(&JobRecord::new(JobId::new(id), PipelineId::new("p")))
            })
            .unwrap();
        store
    }

    #[test]
    fn full_lifecycle_is_accepted() {
        let store = store_with_job("j1");
        let id = JobId::new("j1");

        let record = store
            .update_job_state(&id, None, JobState::Running, "worker picked up job")
            .unwrap();
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.reason, "worker picked up job");

        let record = store
            .update_job_state(
                &id,
                Some(&CommitRef::new("stats-1")),
                JobState::Success,
                "all datums processed",
            )
            .unwrap();
        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.stats_commit, Some(CommitRef::new("stats-1")));
    }

    #[test]
    fn missing_job_is_validation_error() {
        let store = CoordStore::in_memory().unwrap();
        let err = store
            .update_job_state(&JobId::new("ghost"), None, JobState::Running, "")
            .unwrap_err();
        assert!(matches!(err, StateError::JobNotFound(_)));
    }

    #[test]
    fn terminal_state_rejects_and_leaves_record_unchanged() {
        let store = store_with_job("j1");
        let id = JobId::new("j1");
        store
            .update_job_state(&id, None, JobState::Killed, "user request")
            .unwrap();

        let err = store
            .update_job_state(&id, Some(&CommitRef::new("late")), JobState::Success, "late")
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        let record = store
            .with_transaction(|txn| txn.get_job(&id))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, JobState::Killed);
        assert_eq!(record.reason, "user request");
        assert!(record.stats_commit.is_none());
    }

    #[test]
    fn terminal_rewrite_of_same_state_is_noop() {
        let store = store_with_job("j1");
        let id = JobId::new("j1");
        store
            .update_job_state(&id, None, JobState::Failure, "datum failed")
            .unwrap();

        let record = store
            .update_job_state(&id, None, JobState::Failure, "different reason")
            .unwrap();
        // Idempotent: the original reason survives.
        assert_eq!(record.reason, "datum failed");
    }

    #[test]
    fn backwards_transition_rejected() {
        let store = store_with_job("j1");
        let id = JobId::new("j1");
        store
            .update_job_state(&id, None, JobState::Running, "")
            .unwrap();

        let err = store
            .update_job_state(&id, None, JobState::Created, "")
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn running_to_running_counts_restart() {
        let store = store_with_job("j1");
        let id = JobId::new("j1");
        store
            .update_job_state(&id, None, JobState::Running, "")
            .unwrap();
        let record = store
            .update_job_state(&id, None, JobState::Running, "worker restarted")
            .unwrap();
        assert_eq!(record.restart, 1);
    }

    #[test]
    fn state_sequence_is_non_decreasing() {
        let store = store_with_job("j1");
        let id = JobId::new("j1");
        let mut observed = vec![JobState::Created];

        for attempt in [
            JobState::Running,
            JobState::Created,
            JobState::Success,
            JobState::Running,
            JobState::Failure,
        ] {
            if let Ok(record) = store.update_job_state(&id, None, attempt, "") {
                observed.push(record.state);
            }
        }

        for pair in observed.windows(2) {
            assert!(rank(pair[0]) <= rank(pair[1]), "sequence decreased: {observed:?}");
        }
        let record = store
            .with_transaction(|txn| txn.get_job(&id))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, JobState::Success);
    }

    fn seed_job_with_partitions(store: &CoordStore, id: &str) -> JobRecord {
        let record = JobRecord::new(JobId::new(id), PipelineId::new("p"));
        store
            .with_transaction(|txn| {
                txn.put_job(&record)?;
                txn.put_plan(&PlanRecord {
                    job: record.job.clone(),
                    chunks: vec![4, 8],
                })?;
                for chunk_id in 0..2 {
                    txn.put_chunk(&ChunkRecord {
                        job: record.job.clone(),
                        id: chunk_id,
                        state: ChunkState::Complete,
                    })?;
                }
                txn.put_merge(&MergeRecord {
                    job: record.job.clone(),
                    id: 0,
                    state: MergeState::Complete,
                })
            })
            .unwrap();
        record
    }

    #[test]
    fn delete_job_removes_job_chunks_merges_and_plan() {
        let store = CoordStore::in_memory().unwrap();
        let record = seed_job_with_partitions(&store, "j1");

        store
            .with_transaction(|txn| delete_job(txn, &record))
            .unwrap();

        store
            .with_transaction(|txn| {
                assert!(txn.get_job(&record.job)?.is_none());
                assert!(txn.get_plan(&record.job)?.is_none());
                assert!(txn.list_chunks(&record.job)?.is_empty());
                assert!(txn.list_merges(&record.job)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_job_composes_with_caller_transaction() {
        let store = CoordStore::in_memory().unwrap();
        let old = seed_job_with_partitions(&store, "j1");

        // Delete the old job and write its successor in one atomic unit.
        store
            .with_transaction(|txn| {
                delete_job(txn, &old)?;
                txn.put_job(&JobRecord::new(JobId::new("j2"), PipelineId::new("p")))
            })
            .unwrap();

        store
            .with_transaction(|txn| {
                assert!(txn.get_job(&JobId::new("j1"))?.is_none());
                assert!(txn.get_job(&JobId::new("j2"))?.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn aborted_transaction_keeps_every_record() {
        let store = CoordStore::in_memory().unwrap();
        let record = seed_job_with_partitions(&store, "j1");

        let result: error::Result<()> = store.with_transaction(|txn| {
            delete_job(txn, &record)?;
            Err(StateError::LockPoisoned)
        });
        assert!(result.is_err());

        store
            .with_transaction(|txn| {
                assert!(txn.get_job(&record.job)?.is_some());
                assert!(txn.get_plan(&record.job)?.is_some());
                assert_eq!(txn.list_chunks(&record.job)?.len(), 2);
                assert_eq!(txn.list_merges(&record.job)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
