use thiserror::Error;

use super::record::JobStatus;

/// Errors surfaced synchronously to callers of the job API. Execution-time
/// failures are never returned here; they are recorded on the job instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),

    #[error("request not found: {0}")]
    NotFound(String),

    #[error("request {id} is {status}, not completed")]
    NotReady { id: String, status: JobStatus },

    #[error("cannot {action} request {id} in {status} status")]
    InvalidState {
        id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("duplicate request id: {0}")]
    DuplicateId(String),

    #[error("request {0} did not finish within the wait timeout")]
    WaitTimeout(String),

    #[error("generation worker is not running")]
    Unavailable,
}
