//! The single worker that drains the work queue.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::JobError;
use super::materializer::Materializer;
use super::params::GenerationParams;
use super::queue::QueueReceiver;
use super::record::{FailureKind, JobFailure, JobResult, JobStatus, Transition};
use super::store::JobStore;
use crate::engine::{EngineRequest, GenerationEngine};
use crate::logging::panic_payload_to_string;

const SHUTDOWN_MESSAGE: &str = "server shut down before the job started";

/// Owns the engine. Only one job runs at a time because there is only one
/// loop and it awaits each job before taking the next id.
#[derive(Clone)]
pub struct Executor {
    store: Arc<JobStore>,
    engine: Arc<dyn GenerationEngine>,
    materializer: Arc<Materializer>,
}

impl Executor {
    pub fn new(
        store: Arc<JobStore>,
        engine: Arc<dyn GenerationEngine>,
        materializer: Arc<Materializer>,
    ) -> Self {
        Self {
            store,
            engine,
            materializer,
        }
    }

    /// Starts the worker loop. It ends when `shutdown` fires or every queue
    /// sender is dropped; a job already running is finished first.
    pub fn spawn(self, receiver: QueueReceiver, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver, shutdown))
    }

    async fn run(self, mut receiver: QueueReceiver, shutdown: CancellationToken) {
        info!(engine = self.engine.name(), "Executor started");
        loop {
            let job_id = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            self.process(&job_id).await;
        }

        // Nothing will run what is still queued; fail it so waiters return.
        let leftover = receiver.close_and_drain();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Rejecting jobs still queued at shutdown");
        }
        for job_id in &leftover {
            self.reject(job_id);
        }
        info!("Executor stopped");
    }

    fn reject(&self, job_id: &str) {
        let Ok(job) = self.store.get(job_id) else {
            return;
        };
        if job.status() != JobStatus::Pending {
            return;
        }
        self.materializer.cleanup_inputs(job_id, &job.params);
        let failure = JobFailure::new(FailureKind::Rejected, SHUTDOWN_MESSAGE);
        if let Err(e) = self.store.transition(job_id, Transition::Reject(failure)) {
            debug!(job_id, error = %e, "Queued job changed state during shutdown");
        }
    }

    async fn process(&self, job_id: &str) {
        let job = match self.store.transition(job_id, Transition::Start) {
            Ok(job) => job,
            Err(JobError::InvalidState { status, .. }) => {
                // Cancelled while queued; the cancel won the race.
                debug!(job_id, status = %status, "Skipping job that is no longer pending");
                if let Ok(job) = self.store.get(job_id) {
                    self.materializer.cleanup_inputs(job_id, &job.params);
                }
                return;
            }
            Err(e) => {
                warn!(job_id, error = %e, "Dequeued unknown job");
                return;
            }
        };

        info!(
            job_id,
            format = %job.params.format,
            duration_secs = job.params.audio_duration,
            hold_in_memory = job.params.hold_in_memory,
            "Job started"
        );

        let params = job.params;
        let joined = {
            let engine = Arc::clone(&self.engine);
            let materializer = Arc::clone(&self.materializer);
            let id = job_id.to_string();
            let params = params.clone();
            tokio::task::spawn_blocking(move || {
                execute(engine.as_ref(), materializer.as_ref(), &id, &params)
            })
            .await
        };

        let transition = match joined {
            Ok(Ok(result)) => Transition::Complete(result),
            Ok(Err(failure)) => Transition::Fail(failure),
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    let payload = join_err.into_panic();
                    panic_payload_to_string(&*payload)
                } else {
                    "worker task was cancelled".to_string()
                };
                Transition::Fail(JobFailure::new(
                    FailureKind::Panicked,
                    format!("generation panicked: {message}"),
                ))
            }
        };

        // Inputs go before the outcome is published so a waiter never sees
        // a finished job whose staged upload still exists.
        self.materializer.cleanup_inputs(job_id, &params);

        match self.store.transition(job_id, transition) {
            Ok(finished) => match finished.status() {
                JobStatus::Completed => info!(
                    job_id,
                    duration_ms = finished.duration_ms().unwrap_or_default(),
                    size_bytes = finished
                        .result()
                        .map(|r| r.metadata().size_bytes)
                        .unwrap_or_default(),
                    "Job completed"
                ),
                _ => error!(
                    job_id,
                    duration_ms = finished.duration_ms().unwrap_or_default(),
                    error = finished.failure().map(|f| f.message.as_str()).unwrap_or_default(),
                    "Job failed"
                ),
            },
            Err(e) => error!(job_id, error = %e, "Failed to record job outcome"),
        }
    }
}

fn execute(
    engine: &dyn GenerationEngine,
    materializer: &Materializer,
    job_id: &str,
    params: &GenerationParams,
) -> Result<JobResult, JobFailure> {
    let request = EngineRequest {
        job_id,
        params,
        in_memory: params.hold_in_memory,
        output_dir: materializer.output_dir(),
        scratch_dir: materializer.scratch_dir(),
    };

    let output = engine
        .generate(&request)
        .map_err(|e| JobFailure::new(FailureKind::Engine, format!("{e:#}")))?;

    materializer
        .materialize(job_id, params, output)
        .map_err(|e| JobFailure::new(FailureKind::Materialize, format!("{e:#}")))
}
