use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ota_common::deploy::{JobState, JobStatus, StateSnapshot};
use uuid::Uuid;

/// Job states this daemon currently knows about.
///
/// Shared by the broker callback, the deploy worker and the state reporter;
/// all access goes through one mutex so reporter snapshots are atomic with
/// respect to concurrent mutation. Entries leave the map only when the
/// cloud acks them, so terminal states keep being reported until then.
#[derive(Debug, Clone, Default)]
pub struct JobMap {
    inner: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

impl JobMap {
    /// Record a newly received job. Returns false when the job is already
    /// known, which makes broker redelivery a no-op.
    pub fn insert_received(&self, job_id: Uuid) -> bool {
        let mut jobs = self.inner.lock().unwrap();

        if jobs.contains_key(&job_id) {
            return false;
        }

        jobs.insert(
            job_id,
            JobState {
                status: JobStatus::Received,
                error_msg: None,
            },
        );

        true
    }

    pub fn complete(&self, job_id: Uuid) {
        self.inner.lock().unwrap().insert(
            job_id,
            JobState {
                status: JobStatus::Completed,
                error_msg: None,
            },
        );
    }

    pub fn fail(&self, job_id: Uuid, error_msg: String) {
        self.inner.lock().unwrap().insert(
            job_id,
            JobState {
                status: JobStatus::Failed,
                error_msg: Some(error_msg),
            },
        );
    }

    /// Ack-driven eviction, the only way a job leaves the map.
    pub fn evict(&self, job_id: &Uuid) -> bool {
        self.inner.lock().unwrap().remove(job_id).is_some()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivered_jobs_are_not_reinserted() {
        let jobs = JobMap::default();
        let job_id = Uuid::new_v4();

        assert!(jobs.insert_received(job_id));
        jobs.complete(job_id);

        // A redelivery must not reset the completed state.
        assert!(!jobs.insert_received(job_id));
        assert_eq!(
            jobs.snapshot().get(&job_id).unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn terminal_states_stay_until_acked() {
        let jobs = JobMap::default();
        let done = Uuid::new_v4();
        let broken = Uuid::new_v4();

        jobs.insert_received(done);
        jobs.insert_received(broken);
        jobs.complete(done);
        jobs.fail(broken, "disk full".to_string());

        let snapshot = jobs.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get(&broken).unwrap().error_msg.as_deref(),
            Some("disk full")
        );

        assert!(jobs.evict(&done));
        assert!(!jobs.evict(&done));
        assert_eq!(jobs.snapshot().len(), 1);
    }

    #[test]
    fn acks_for_unknown_jobs_are_harmless() {
        let jobs = JobMap::default();
        assert!(!jobs.evict(&Uuid::new_v4()));
    }
}
