use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::JobError;
use super::params::{AdmissionLimits, GenerationRequest};
use super::queue::WorkQueue;
use super::record::{FailureKind, Job, JobFailure, Transition};
use super::store::JobStore;

/// Validates requests, records them and hands their ids to the worker.
#[derive(Debug, Clone)]
pub struct AdmissionGateway {
    store: Arc<JobStore>,
    queue: WorkQueue,
    limits: AdmissionLimits,
    sync_wait_timeout: Option<Duration>,
}

impl AdmissionGateway {
    pub fn new(
        store: Arc<JobStore>,
        queue: WorkQueue,
        limits: AdmissionLimits,
        sync_wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            queue,
            limits,
            sync_wait_timeout,
        }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Admits the request and returns its id without waiting for execution.
    /// Nothing is stored or queued when validation fails.
    pub fn submit(&self, request: &GenerationRequest) -> Result<String, JobError> {
        if self.queue.is_closed() {
            return Err(JobError::Unavailable);
        }

        let params = request.validate(&self.limits)?;
        let id = Uuid::new_v4().to_string();
        let format = params.format;
        let duration_secs = params.audio_duration;

        self.store
            .insert(Job::new(id.clone(), params, Utc::now()))?;

        if let Err(e) = self.queue.enqueue(id.clone()) {
            // The worker shut down between the check above and now.
            warn!(job_id = %id, "Worker unavailable, rejecting admitted job");
            let failure = JobFailure::new(FailureKind::Rejected, e.to_string());
            if let Err(err) = self.store.transition(&id, Transition::Reject(failure)) {
                warn!(job_id = %id, error = %err, "Failed to mark rejected job");
            }
            return Err(e);
        }

        info!(
            job_id = %id,
            format = %format,
            duration_secs,
            queue_depth = self.queue.len(),
            "Job admitted"
        );
        Ok(id)
    }

    /// Admits the request and suspends until it is Completed or Failed.
    pub async fn submit_and_wait(
        &self,
        request: &GenerationRequest,
        timeout: Option<Duration>,
    ) -> Result<Job, JobError> {
        let id = self.submit(request)?;
        self.wait(&id, timeout).await
    }

    /// Waits for a terminal state. `timeout` overrides the configured default;
    /// on expiry the job keeps running and [`JobError::WaitTimeout`] is returned.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<Job, JobError> {
        let finished = self.store.wait_for_terminal(id);
        match timeout.or(self.sync_wait_timeout) {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .map_err(|_| JobError::WaitTimeout(id.to_string()))?,
            None => finished.await,
        }
    }
}
