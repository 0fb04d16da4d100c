use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use super::error::JobError;
use super::record::{Job, JobStatus, Transition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Process-lifetime registry of every admitted job.
///
/// One lock guards the whole map, so a status and its outcome are always
/// published together. Records are never removed. Every successful
/// transition bumps a change counter that blocking submitters wait on.
#[derive(Debug)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, Job>>,
    changes: watch::Sender<u64>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            jobs: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Job>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Job>> {
        self.jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, job: Job) -> Result<(), JobError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(JobError::DuplicateId(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Snapshot of the job as of the call.
    pub fn get(&self, id: &str) -> Result<Job, JobError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Atomically applies `transition` and returns the post-transition snapshot.
    pub fn transition(&self, id: &str, transition: Transition) -> Result<Job, JobError> {
        let action = transition.action();
        let snapshot = {
            let mut jobs = self.write();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            job.apply(transition, Utc::now())
                .map_err(|status| JobError::InvalidState {
                    id: id.to_string(),
                    status,
                    action,
                })?;
            job.clone()
        };

        debug!(job_id = %id, action, status = %snapshot.status(), "Job transitioned");
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
        Ok(snapshot)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in self.read().values() {
            counts.bump(job.status());
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Suspends until the job reaches a terminal status. Does not time out;
    /// wrap in `tokio::time::timeout` to bound the wait.
    pub async fn wait_for_terminal(&self, id: &str) -> Result<Job, JobError> {
        // Subscribe before the first read so a transition in between still wakes us.
        let mut changes = self.changes.subscribe();
        loop {
            let job = self.get(id)?;
            if job.status().is_terminal() {
                return Ok(job);
            }
            if changes.changed().await.is_err() {
                return Err(JobError::Unavailable);
            }
        }
    }
}
