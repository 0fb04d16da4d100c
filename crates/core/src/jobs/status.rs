//! Read-only views over the store, plus cancellation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::error::JobError;
use super::queue::WorkQueue;
use super::record::{FailureKind, Job, JobResult, JobStatus, ResultMetadata, Transition};
use super::store::{JobStore, StatusCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Inline,
    Artifact,
}

/// Result metadata without the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSummary {
    pub delivery: Delivery,
    #[serde(flatten)]
    pub metadata: ResultMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    pub retrieval_hint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub request_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

impl StatusView {
    pub fn from_job(job: &Job) -> Self {
        let result = job.result().map(|result| {
            let (delivery, artifact_path) = match result {
                JobResult::Inline { .. } => (Delivery::Inline, None),
                JobResult::Artifact { path, .. } => (Delivery::Artifact, Some(path.clone())),
            };
            ResultSummary {
                delivery,
                metadata: result.metadata().clone(),
                artifact_path,
                retrieval_hint: format!("Use /api/result/{} to download", job.id),
            }
        });

        Self {
            request_id: job.id.clone(),
            status: job.status(),
            created_at: job.created_at,
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            duration_ms: job.duration_ms(),
            result,
            error: job.failure().map(|f| f.message.clone()),
            error_kind: job.failure().map(|f| f.kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ids still sitting in the work queue.
    pub queue_size: usize,
    pub pending_count: usize,
    pub status_counts: StatusCounts,
    pub total_requests: usize,
}

#[derive(Debug, Clone)]
pub struct StatusApi {
    store: Arc<JobStore>,
    queue: WorkQueue,
}

impl StatusApi {
    pub fn new(store: Arc<JobStore>, queue: WorkQueue) -> Self {
        Self { store, queue }
    }

    pub fn status(&self, id: &str) -> Result<StatusView, JobError> {
        self.store.get(id).map(|job| StatusView::from_job(&job))
    }

    /// The payload of a completed job. Repeated calls return the same result.
    pub fn result(&self, id: &str) -> Result<JobResult, JobError> {
        let job = self.store.get(id)?;
        job.result().cloned().ok_or_else(|| JobError::NotReady {
            id: id.to_string(),
            status: job.status(),
        })
    }

    /// Cancels a job that has not started yet.
    pub fn cancel(&self, id: &str) -> Result<StatusView, JobError> {
        let job = self.store.transition(id, Transition::Cancel)?;
        info!(job_id = %id, "Job cancelled");
        Ok(StatusView::from_job(&job))
    }

    pub fn queue_stats(&self) -> QueueStats {
        let counts = self.store.counts();
        QueueStats {
            queue_size: self.queue.len(),
            pending_count: counts.pending,
            status_counts: counts,
            total_requests: counts.total(),
        }
    }
}
