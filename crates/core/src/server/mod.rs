use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod uploads;

use crate::jobs::{
    AdmissionGateway, GenerationRequest, Job, JobError, JobOutcome, JobResult, JobStatus,
    JobSystem, QueueStats, ResultMetadata, StatusApi, StatusView,
};
use uploads::{decode_base64_audio, discard_staged, extension_for_upload, stage_reference_audio};

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const QUEUED_MESSAGE: &str = "Request queued. Poll /api/status/{id} and download from /api/result/{id}";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    gateway: AdmissionGateway,
    status: StatusApi,
    engine_name: String,
    scratch_dir: PathBuf,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        jobs: &JobSystem,
        engine_name: impl Into<String>,
        scratch_dir: PathBuf,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                gateway: jobs.gateway().clone(),
                status: jobs.status().clone(),
                engine_name: engine_name.into(),
                scratch_dir,
                max_upload_bytes,
            }),
        }
    }
}

// ─── Request / response bodies ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(flatten)]
    pub request: GenerationRequest,
    /// Block until the job is terminal instead of returning the id.
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ReferenceBody {
    #[serde(flatten)]
    pub request: GenerationRequest,
    pub audio_base64: String,
    #[serde(default)]
    pub audio_extension: Option<String>,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    engine: String,
}

#[derive(Serialize)]
struct QueuedResponse {
    request_id: String,
    status: JobStatus,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.inner.max_upload_bytes;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/generate", post(generate))
        .route("/api/generate/direct", post(generate_direct))
        .route("/api/generate/reference", post(generate_reference))
        .route("/api/generate/upload", post(generate_upload))
        .route("/api/status/{id}", get(get_status))
        .route("/api/result/{id}", get(get_result))
        .route("/api/requests/{id}", delete(cancel_request))
        .route("/api/queue/status", get(queue_status))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        engine: state.inner.engine_name.clone(),
    })
}

async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<Response, AppError> {
    let timeout = body.wait_timeout_secs.map(Duration::from_secs);
    admit(&state, &body.request, body.wait, timeout, None).await
}

/// Synchronous generation that always answers with the audio bytes.
async fn generate_direct(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<Response, AppError> {
    let mut request = body.request;
    request.return_file_data = true;
    let timeout = body.wait_timeout_secs.map(Duration::from_secs);
    admit(&state, &request, true, timeout, None).await
}

async fn generate_reference(
    State(state): State<AppState>,
    Json(body): Json<ReferenceBody>,
) -> Result<Response, AppError> {
    let bytes =
        decode_base64_audio(&body.audio_base64).map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    let extension = body.audio_extension.as_deref().unwrap_or("mp3");
    let staged = stage_reference_audio(&state.inner.scratch_dir, &bytes, extension).await?;

    let mut request = body.request;
    request.audio2audio_enable = true;
    request.ref_audio_input = Some(staged.to_string_lossy().into_owned());

    let timeout = body.wait_timeout_secs.map(Duration::from_secs);
    admit(&state, &request, body.wait, timeout, Some(staged)).await
}

async fn generate_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut staged = None;
    let form = match read_upload_form(&state, &mut multipart, &mut staged).await {
        Ok(form) => form,
        Err(e) => {
            if let Some(path) = &staged {
                discard_staged(&state.inner.scratch_dir, path);
            }
            return Err(e);
        }
    };

    let Some(staged) = staged else {
        return Err(AppError::BadRequest(
            "multipart field 'audio_file' is required".to_string(),
        ));
    };

    let mut request = form.request;
    request.audio2audio_enable = true;
    request.ref_audio_input = Some(staged.to_string_lossy().into_owned());
    admit(&state, &request, form.wait, None, Some(staged)).await
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusView>, AppError> {
    Ok(Json(state.inner.status.status(&id)?))
}

async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    match state.inner.status.result(&id)? {
        JobResult::Inline { bytes, metadata } => Ok(audio_response(&id, &bytes, &metadata)),
        JobResult::Artifact { path, metadata } => {
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                warn!(job_id = %id, path = %path.display(), error = %e, "Artifact unreadable");
                AppError::NotFound(format!("artifact for request {id} is no longer available"))
            })?;
            Ok(audio_response(&id, &bytes, &metadata))
        }
    }
}

async fn cancel_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusView>, AppError> {
    Ok(Json(state.inner.status.cancel(&id)?))
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.inner.status.queue_stats())
}

async fn api_route_not_found() -> AppError {
    AppError::NotFound("API route not found".to_string())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct UploadForm {
    request: GenerationRequest,
    wait: bool,
}

async fn read_upload_form(
    state: &AppState,
    multipart: &mut Multipart,
    staged: &mut Option<PathBuf>,
) -> Result<UploadForm, AppError> {
    let mut form = UploadForm {
        request: GenerationRequest::default(),
        wait: false,
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio_file" => {
                if staged.is_some() {
                    return Err(AppError::BadRequest(
                        "only one 'audio_file' may be uploaded".to_string(),
                    ));
                }
                let content_type = field.content_type().unwrap_or_default().to_string();
                if !content_type.starts_with("audio/") {
                    return Err(AppError::BadRequest(format!(
                        "audio_file must be an audio file, got content type '{content_type}'"
                    )));
                }
                let extension = extension_for_upload(&content_type, field.file_name());
                let bytes = field.bytes().await.map_err(multipart_error)?;
                if bytes.is_empty() {
                    return Err(AppError::BadRequest("audio_file is empty".to_string()));
                }
                *staged = Some(
                    stage_reference_audio(&state.inner.scratch_dir, &bytes, &extension).await?,
                );
            }
            "request" => {
                let text = field.text().await.map_err(multipart_error)?;
                form.request = serde_json::from_str(&text)
                    .map_err(|e| AppError::BadRequest(format!("invalid 'request' JSON: {e}")))?;
            }
            "wait" => {
                let text = field.text().await.map_err(multipart_error)?;
                form.wait = matches!(text.trim(), "true" | "1" | "yes");
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Admits `request` and answers with either the queued id or, when `wait`
/// is set, the terminal outcome. A staged upload is discarded if admission
/// fails; otherwise the executor removes it after the job runs.
async fn admit(
    state: &AppState,
    request: &GenerationRequest,
    wait: bool,
    timeout: Option<Duration>,
    staged: Option<PathBuf>,
) -> Result<Response, AppError> {
    let gateway = &state.inner.gateway;
    let id = match gateway.submit(request) {
        Ok(id) => id,
        Err(e) => {
            if let Some(path) = &staged {
                discard_staged(&state.inner.scratch_dir, path);
            }
            return Err(e.into());
        }
    };

    if !wait {
        let body = QueuedResponse {
            message: QUEUED_MESSAGE.replace("{id}", &id),
            request_id: id,
            status: JobStatus::Pending,
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let job = gateway.wait(&id, timeout).await?;
    terminal_response(&job)
}

fn terminal_response(job: &Job) -> Result<Response, AppError> {
    match job.outcome() {
        Some(JobOutcome::Success(JobResult::Inline { bytes, metadata })) => {
            Ok(audio_response(&job.id, bytes, metadata))
        }
        Some(JobOutcome::Success(JobResult::Artifact { .. })) => {
            Ok(Json(StatusView::from_job(job)).into_response())
        }
        Some(JobOutcome::Failure(failure)) => {
            info!(job_id = %job.id, error = %failure.message, "Synchronous request failed");
            Err(AppError::Internal(format!(
                "request {} failed: {}",
                job.id, failure.message
            )))
        }
        None => Err(AppError::Internal(format!(
            "request {} is still {}",
            job.id,
            job.status()
        ))),
    }
}

fn audio_response(id: &str, bytes: &[u8], metadata: &ResultMetadata) -> Response {
    let disposition = format!(
        "attachment; filename=\"{id}.{}\"",
        metadata.format.extension()
    );
    (
        [
            (header::CONTENT_TYPE, metadata.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (REQUEST_ID_HEADER, id.to_string()),
        ],
        Body::from(bytes.to_vec()),
    )
        .into_response()
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(err.body_text())
    } else {
        AppError::BadRequest(err.body_text())
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::Validation(_) => AppError::BadRequest(message),
            JobError::NotFound(_) => AppError::NotFound(message),
            JobError::NotReady { .. } | JobError::InvalidState { .. } => {
                AppError::Conflict(message)
            }
            JobError::DuplicateId(_) => AppError::Internal(message),
            JobError::WaitTimeout(_) => AppError::Timeout(message),
            JobError::Unavailable => AppError::Unavailable(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path as StdPath;

    use anyhow::Result as AnyResult;
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use tokio_util::sync::CancellationToken;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::audio::{self, ContainerEncoder};
    use crate::config::{PathsConfig, QueueConfig};
    use crate::engine::{EngineOutput, EngineRequest, GenerationEngine, ToneEngine};

    const TEST_SAMPLE_RATE: u32 = 8_000;

    /// Tone engine that takes a while, so queued jobs stay pending.
    struct SlowEngine {
        delay: Duration,
        inner: ToneEngine,
    }

    impl GenerationEngine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }

        fn generate(&self, request: &EngineRequest<'_>) -> AnyResult<EngineOutput> {
            std::thread::sleep(self.delay);
            self.inner.generate(request)
        }
    }

    struct TestServer {
        router: Router,
        jobs: JobSystem,
        scratch_dir: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn test_server_with_engine(engine: Arc<dyn GenerationEngine>) -> TestServer {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = PathsConfig {
            output_dir: dir.path().join("outputs"),
            scratch_dir: dir.path().join("scratch"),
        };
        let engine_name = engine.name().to_string();
        let jobs = JobSystem::start(
            engine,
            Arc::new(ContainerEncoder::default()),
            &paths,
            &QueueConfig::default(),
            CancellationToken::new(),
        );
        let state = AppState::new(&jobs, engine_name, paths.scratch_dir.clone(), 1024 * 1024);
        TestServer {
            router: app_router(state),
            jobs,
            scratch_dir: paths.scratch_dir,
            _dir: dir,
        }
    }

    fn test_server() -> TestServer {
        test_server_with_engine(Arc::new(ToneEngine::new(TEST_SAMPLE_RATE)))
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn wait_for_terminal_status(server: &TestServer, id: &str) -> JobStatus {
        const MAX_POLLS: usize = 100;
        const POLL_INTERVAL_MS: u64 = 20;

        for _ in 0..MAX_POLLS {
            let view = server.jobs.status().status(id).unwrap();
            if view.status.is_terminal() {
                return view.status;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
        panic!("job {id} did not reach a terminal status");
    }

    fn scratch_is_empty(dir: &StdPath) -> bool {
        std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    fn multipart_body(boundary: &str, parts: &[(&str, Option<(&str, &str)>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file, content) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match file {
                Some((file_name, content_type)) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    fn multipart_request(body: Vec<u8>, boundary: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/generate/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_engine() {
        let mut server = test_server();
        let resp = send_request(&mut server.router, get_request("/api/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["engine"], "tone");
    }

    #[tokio::test]
    async fn queued_generation_can_be_polled_and_downloaded() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            json_request(
                "POST",
                "/api/generate",
                serde_json::json!({"prompt": "lofi", "audio_duration": 0.5, "return_file_data": true}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "pending");
        let id = json["request_id"].as_str().unwrap().to_string();

        assert_eq!(
            wait_for_terminal_status(&server, &id).await,
            JobStatus::Completed
        );

        let resp = send_request(&mut server.router, get_request(&format!("/api/status/{id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let status = body_json(resp).await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["result"]["delivery"], "inline");
        assert_eq!(status["result"]["content_type"], "audio/wav");
        assert!(status["started_at"].is_string());

        let resp = send_request(&mut server.router, get_request(&format!("/api/result/{id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/wav");
        let first = body_bytes(resp).await;
        assert_eq!(audio::decode_wav(&first).unwrap().frames(), 4_000);

        let resp = send_request(&mut server.router, get_request(&format!("/api/result/{id}"))).await;
        assert_eq!(body_bytes(resp).await, first);
    }

    #[tokio::test]
    async fn artifact_results_are_served_from_disk() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            json_request(
                "POST",
                "/api/generate",
                serde_json::json!({"prompt": "ambient", "audio_duration": 0.25, "wait": true}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let status = body_json(resp).await;
        assert_eq!(status["result"]["delivery"], "artifact");
        let id = status["request_id"].as_str().unwrap().to_string();

        let resp = send_request(&mut server.router, get_request(&format!("/api/result/{id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = body_bytes(resp).await;
        assert_eq!(audio::decode_wav(&bytes).unwrap().frames(), 2_000);
    }

    #[tokio::test]
    async fn direct_generation_returns_audio_attachment() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            json_request(
                "POST",
                "/api/generate/direct",
                serde_json::json!({"prompt": "piano", "audio_duration": 0.1}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let id = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            format!("attachment; filename=\"{id}.wav\"").as_str()
        );
        let bytes = body_bytes(resp).await;
        assert_eq!(audio::decode_wav(&bytes).unwrap().frames(), 800);
    }

    #[tokio::test]
    async fn invalid_format_is_rejected_without_side_effects() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            json_request(
                "POST",
                "/api/generate",
                serde_json::json!({"prompt": "rock", "format": "aiff"}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("unsupported audio format"));

        let resp = send_request(&mut server.router, get_request("/api/queue/status")).await;
        let stats = body_json(resp).await;
        assert_eq!(stats["total_requests"], 0);
        assert_eq!(stats["queue_size"], 0);
    }

    #[tokio::test]
    async fn unknown_ids_and_routes_are_404() {
        let mut server = test_server();
        for uri in ["/api/status/nope", "/api/result/nope", "/api/nothing-here"] {
            let resp = send_request(&mut server.router, get_request(uri)).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        let resp = send_request(
            &mut server.router,
            Request::builder()
                .method("DELETE")
                .uri("/api/requests/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pending_job_is_not_ready_and_can_be_cancelled_once() {
        let mut server = test_server_with_engine(Arc::new(SlowEngine {
            delay: Duration::from_millis(400),
            inner: ToneEngine::new(TEST_SAMPLE_RATE),
        }));

        let mut ids = Vec::new();
        for _ in 0..2 {
            let resp = send_request(
                &mut server.router,
                json_request(
                    "POST",
                    "/api/generate",
                    serde_json::json!({"prompt": "blues", "audio_duration": 0.1}),
                ),
            )
            .await;
            ids.push(body_json(resp).await["request_id"].as_str().unwrap().to_string());
        }
        let queued = &ids[1];

        let resp = send_request(&mut server.router, get_request(&format!("/api/result/{queued}"))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let cancel = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/requests/{queued}"))
                .body(Body::empty())
                .unwrap()
        };
        let resp = send_request(&mut server.router, cancel()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "Cancelled by user");

        let resp = send_request(&mut server.router, cancel()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        assert_eq!(
            wait_for_terminal_status(&server, &ids[0]).await,
            JobStatus::Completed
        );
        let resp = send_request(&mut server.router, get_request("/api/queue/status")).await;
        let stats = body_json(resp).await;
        assert_eq!(stats["status_counts"]["completed"], 1);
        assert_eq!(stats["status_counts"]["failed"], 1);
        assert_eq!(stats["pending_count"], 0);
    }

    #[tokio::test]
    async fn wait_timeout_returns_504_and_job_keeps_running() {
        let mut server = test_server_with_engine(Arc::new(SlowEngine {
            delay: Duration::from_millis(300),
            inner: ToneEngine::new(TEST_SAMPLE_RATE),
        }));
        let resp = send_request(
            &mut server.router,
            json_request(
                "POST",
                "/api/generate",
                serde_json::json!({"prompt": "jazz", "audio_duration": 0.1, "wait": true, "wait_timeout_secs": 0}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);

        let resp = send_request(&mut server.router, get_request("/api/queue/status")).await;
        assert_eq!(body_json(resp).await["total_requests"], 1);
    }

    #[tokio::test]
    async fn base64_reference_is_staged_then_cleaned_up() {
        let mut server = test_server();
        let reference = STANDARD.encode(b"ID3 fake mp3 payload");
        let resp = send_request(
            &mut server.router,
            json_request(
                "POST",
                "/api/generate/reference",
                serde_json::json!({
                    "prompt": "remix",
                    "audio_duration": 0.1,
                    "audio_base64": reference,
                    "wait": true,
                }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(scratch_is_empty(&server.scratch_dir));
    }

    #[tokio::test]
    async fn rejected_reference_is_discarded_immediately() {
        let mut server = test_server();
        let resp = send_request(
            &mut server.router,
            json_request(
                "POST",
                "/api/generate/reference",
                serde_json::json!({
                    "audio_duration": 0.1,
                    "audio_base64": STANDARD.encode(b"RIFF"),
                }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(scratch_is_empty(&server.scratch_dir));
    }

    #[tokio::test]
    async fn multipart_upload_forces_audio2audio() {
        let mut server = test_server();
        let boundary = "cadenza-boundary";
        let body = multipart_body(
            boundary,
            &[
                ("audio_file", Some(("ref.mp3", "audio/mpeg")), b"ID3 payload".as_slice()),
                (
                    "request",
                    None,
                    br#"{"prompt": "cover", "audio_duration": 0.1}"#.as_slice(),
                ),
            ],
        );
        let resp = send_request(&mut server.router, multipart_request(body, boundary)).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id = body_json(resp).await["request_id"].as_str().unwrap().to_string();

        let job_params = server
            .jobs
            .gateway()
            .wait(&id, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .params;
        assert!(job_params.audio2audio_enable);
        assert!(job_params
            .ref_audio_input
            .as_deref()
            .is_some_and(|p| p.starts_with(&server.scratch_dir)));
        assert!(scratch_is_empty(&server.scratch_dir));
    }

    #[tokio::test]
    async fn multipart_upload_rejects_non_audio() {
        let mut server = test_server();
        let boundary = "cadenza-boundary";
        let body = multipart_body(
            boundary,
            &[
                ("audio_file", Some(("notes.txt", "text/plain")), b"hello".as_slice()),
                ("request", None, br#"{"prompt": "cover"}"#.as_slice()),
            ],
        );
        let resp = send_request(&mut server.router, multipart_request(body, boundary)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(scratch_is_empty(&server.scratch_dir));

        let resp = send_request(&mut server.router, get_request("/api/queue/status")).await;
        assert_eq!(body_json(resp).await["total_requests"], 0);
    }

    #[test]
    fn job_errors_map_to_http_statuses() {
        let cases = [
            (JobError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (JobError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                JobError::NotReady {
                    id: "x".into(),
                    status: JobStatus::Pending,
                },
                StatusCode::CONFLICT,
            ),
            (JobError::WaitTimeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (JobError::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).into_response().status(), expected);
        }
    }
}
