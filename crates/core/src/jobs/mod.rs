//! Request lifecycle: admission, the single-worker queue, result
//! materialization and the read side.

mod admission;
mod error;
mod executor;
mod materializer;
mod params;
mod queue;
mod record;
mod status;
mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use admission::AdmissionGateway;
pub use error::JobError;
pub use executor::Executor;
pub use materializer::{remove_staged_file, Materializer};
pub use params::{
    AdmissionLimits, CfgType, GenerationParams, GenerationRequest, LoraAdapter, SchedulerType,
    DEFAULT_LYRICS,
};
pub use queue::{work_queue, QueueReceiver, WorkQueue};
pub use record::{
    FailureKind, Job, JobFailure, JobOutcome, JobResult, JobStatus, ResultMetadata, Transition,
};
pub use status::{Delivery, QueueStats, ResultSummary, StatusApi, StatusView};
pub use store::{JobStore, StatusCounts};

use crate::audio::AudioEncoder;
use crate::config::{PathsConfig, QueueConfig};
use crate::engine::GenerationEngine;

/// The wired-up job subsystem: one store, one queue, one running executor.
pub struct JobSystem {
    gateway: AdmissionGateway,
    status: StatusApi,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl JobSystem {
    /// Builds the components and spawns the executor. Must be called inside a
    /// tokio runtime.
    pub fn start(
        engine: Arc<dyn GenerationEngine>,
        encoder: Arc<dyn AudioEncoder>,
        paths: &PathsConfig,
        queue_config: &QueueConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let store = Arc::new(JobStore::new());
        let (queue, receiver) = work_queue();
        let materializer = Arc::new(Materializer::new(encoder, paths));

        let sync_wait_timeout = match queue_config.sync_wait_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let gateway = AdmissionGateway::new(
            Arc::clone(&store),
            queue.clone(),
            AdmissionLimits::from(queue_config),
            sync_wait_timeout,
        );
        let status = StatusApi::new(Arc::clone(&store), queue);
        let worker = Executor::new(store, engine, materializer).spawn(receiver, shutdown.clone());

        Self {
            gateway,
            status,
            shutdown,
            worker,
        }
    }

    pub fn gateway(&self) -> &AdmissionGateway {
        &self.gateway
    }

    pub fn status(&self) -> &StatusApi {
        &self.status
    }

    /// Stops the executor after its current job and waits for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Executor task ended abnormally");
        }
    }
}
