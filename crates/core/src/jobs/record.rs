//! The job record and its lifecycle state machine.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::params::GenerationParams;
use crate::audio::AudioFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client can learn about a finished result without downloading it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMetadata {
    pub format: AudioFormat,
    pub content_type: &'static str,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Parameters echoed back by the engine, if it reported any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Materialized output of a completed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Encoded bytes held for inline or polled retrieval.
    Inline {
        bytes: Arc<[u8]>,
        metadata: ResultMetadata,
    },
    /// A file on disk referenced by path.
    Artifact {
        path: PathBuf,
        metadata: ResultMetadata,
    },
}

impl JobResult {
    pub fn metadata(&self) -> &ResultMetadata {
        match self {
            Self::Inline { metadata, .. } | Self::Artifact { metadata, .. } => metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The generation engine returned an error.
    Engine,
    /// Encoding or persisting the engine output failed.
    Materialize,
    /// The worker thread panicked while running the job.
    Panicked,
    /// The caller cancelled the job before it started.
    Cancelled,
    /// The worker was gone, or shut down, before the job could run.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub const CANCELLED_MESSAGE: &'static str = "Cancelled by user";

    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, Self::CANCELLED_MESSAGE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(JobResult),
    Failure(JobFailure),
}

/// Status changes a job can undergo after admission.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Complete(JobResult),
    Fail(JobFailure),
    Cancel,
    /// Pending straight to Failed with a cause other than cancellation.
    Reject(JobFailure),
}

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::Reject(_) => "reject",
        }
    }

    fn allowed_from(&self, status: JobStatus) -> bool {
        matches!(
            (self, status),
            (Self::Start, JobStatus::Pending)
                | (Self::Cancel, JobStatus::Pending)
                | (Self::Reject(_), JobStatus::Pending)
                | (Self::Complete(_), JobStatus::Processing)
                | (Self::Fail(_), JobStatus::Processing)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub params: GenerationParams,
    status: JobStatus,
    outcome: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, params: GenerationParams, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            params,
            status: JobStatus::Pending,
            outcome: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn result(&self) -> Option<&JobResult> {
        match &self.outcome {
            Some(JobOutcome::Success(result)) => Some(result),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.outcome {
            Some(JobOutcome::Failure(failure)) => Some(failure),
            _ => None,
        }
    }

    /// Applies `transition` if the current status allows it. On rejection the
    /// job is left untouched and the offending status is returned.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), JobStatus> {
        if !transition.allowed_from(self.status) {
            return Err(self.status);
        }

        match transition {
            Transition::Start => {
                self.status = JobStatus::Processing;
                self.started_at = Some(now);
            }
            Transition::Complete(result) => {
                self.status = JobStatus::Completed;
                self.outcome = Some(JobOutcome::Success(result));
                self.completed_at = Some(now);
            }
            Transition::Fail(failure) | Transition::Reject(failure) => {
                self.status = JobStatus::Failed;
                self.outcome = Some(JobOutcome::Failure(failure));
                self.completed_at = Some(now);
            }
            Transition::Cancel => {
                self.status = JobStatus::Failed;
                self.outcome = Some(JobOutcome::Failure(JobFailure::cancelled()));
                self.completed_at = Some(now);
            }
        }

        Ok(())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let completed_at = self.completed_at?;
        let started_at = self.started_at.unwrap_or(self.created_at);
        Some((completed_at - started_at).num_milliseconds().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::params::{AdmissionLimits, GenerationRequest};

    fn pending_job() -> Job {
        let params = GenerationRequest::with_prompt("synthwave")
            .validate(&AdmissionLimits::default())
            .expect("valid params");
        Job::new("job-1".to_string(), params, Utc::now())
    }

    fn artifact_result() -> JobResult {
        JobResult::Artifact {
            path: PathBuf::from("/tmp/out.wav"),
            metadata: ResultMetadata {
                format: AudioFormat::Wav,
                content_type: AudioFormat::Wav.content_type(),
                size_bytes: 44,
                sample_rate: None,
                channels: None,
                frames: None,
                duration_secs: None,
                params: None,
            },
        }
    }

    #[test]
    fn new_job_is_pending_without_outcome_or_progress_timestamps() {
        let job = pending_job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.outcome().is_none());
        assert!(job.started_at().is_none());
        assert!(job.completed_at().is_none());
    }

    #[test]
    fn happy_path_sets_timestamps_and_result() {
        let mut job = pending_job();
        let started = Utc::now();
        job.apply(Transition::Start, started).expect("start");
        assert_eq!(job.status(), JobStatus::Processing);
        assert_eq!(job.started_at(), Some(started));
        assert!(job.completed_at().is_none());
        assert!(job.outcome().is_none());

        job.apply(Transition::Complete(artifact_result()), Utc::now())
            .expect("complete");
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.completed_at().is_some());
        assert!(job.result().is_some());
        assert!(job.failure().is_none());
    }

    #[test]
    fn cancel_only_applies_to_pending() {
        let mut job = pending_job();
        job.apply(Transition::Cancel, Utc::now()).expect("cancel");
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(
            job.failure().map(|f| f.kind),
            Some(FailureKind::Cancelled)
        );
        assert!(job.started_at().is_none());

        let mut running = pending_job();
        running.apply(Transition::Start, Utc::now()).expect("start");
        assert_eq!(
            running.apply(Transition::Cancel, Utc::now()),
            Err(JobStatus::Processing)
        );
    }

    #[test]
    fn terminal_jobs_reject_every_transition() {
        let mut job = pending_job();
        job.apply(Transition::Start, Utc::now()).expect("start");
        job.apply(
            Transition::Fail(JobFailure::new(FailureKind::Engine, "out of memory")),
            Utc::now(),
        )
        .expect("fail");

        let snapshot = job.clone();
        for transition in [
            Transition::Start,
            Transition::Cancel,
            Transition::Complete(artifact_result()),
            Transition::Fail(JobFailure::new(FailureKind::Engine, "again")),
        ] {
            assert_eq!(
                job.apply(transition, Utc::now()),
                Err(JobStatus::Failed)
            );
        }
        assert_eq!(job, snapshot);
    }

    #[test]
    fn completion_requires_processing() {
        let mut job = pending_job();
        assert_eq!(
            job.apply(Transition::Complete(artifact_result()), Utc::now()),
            Err(JobStatus::Pending)
        );
        assert_eq!(job.status(), JobStatus::Pending);
    }
}
