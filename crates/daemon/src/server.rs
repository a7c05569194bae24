//! HTTP server for the fitenc daemon
//!
//! Exposes job submission, progress polling and artifact download.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::Codec;
use crate::job_executor::{EncodeRequest, JobExecutor};
use crate::plan::EncodeSettings;
use crate::registry::{LookupError, ProgressReport};

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<JobExecutor>,
    /// Settings used for parameters a request leaves out
    pub defaults: EncodeSettings,
    /// Inputs must resolve to a file under this directory
    pub upload_dir: PathBuf,
}

/// `auto_quality` may be sent as a boolean or as "on"/"off"
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AutoQualityParam {
    Flag(bool),
    Word(String),
}

impl AutoQualityParam {
    fn resolve(&self) -> Option<bool> {
        match self {
            AutoQualityParam::Flag(flag) => Some(*flag),
            AutoQualityParam::Word(word) => match word.to_ascii_lowercase().as_str() {
                "on" => Some(true),
                "off" => Some(false),
                _ => None,
            },
        }
    }
}

/// Body of `POST /jobs`
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub input_path: PathBuf,
    pub target_mb: Option<f64>,
    pub codec: Option<Codec>,
    pub audio_kbps: Option<i64>,
    pub auto_quality: Option<AutoQualityParam>,
}

impl SubmitJobRequest {
    /// Merge with `defaults`, rejecting unusable values.
    fn settings(&self, defaults: &EncodeSettings) -> Result<EncodeSettings, String> {
        let target_mb = self.target_mb.unwrap_or(defaults.target_mb);
        if !(target_mb.is_finite() && target_mb > 0.0) {
            return Err(format!("target_mb must be positive, got {}", target_mb));
        }

        let audio_kbps = match self.audio_kbps {
            Some(kbps) if kbps <= 0 || kbps > i64::from(u32::MAX) => {
                return Err(format!("audio_kbps must be positive, got {}", kbps));
            }
            Some(kbps) => kbps as u32,
            None => defaults.audio_kbps,
        };

        let auto_quality = match &self.auto_quality {
            Some(param) => param
                .resolve()
                .ok_or_else(|| "auto_quality must be \"on\" or \"off\"".to_string())?,
            None => defaults.auto_quality,
        };

        Ok(EncodeSettings {
            target_mb,
            codec: self.codec.unwrap_or(defaults.codec),
            audio_kbps,
            auto_quality,
        })
    }
}

/// Body of a successful `POST /jobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Resolve `input` to a regular file inside `upload_dir`.
///
/// Symlinks and `..` are resolved first, so nothing outside the upload
/// directory can be handed to a job (which deletes its input).
async fn resolve_upload(upload_dir: &std::path::Path, input: &std::path::Path) -> Result<PathBuf, String> {
    let not_found = || format!("input not found: {}", input.display());

    let upload_root = tokio::fs::canonicalize(upload_dir)
        .await
        .map_err(|e| format!("upload directory unavailable: {}", e))?;
    let resolved = tokio::fs::canonicalize(input).await.map_err(|_| not_found())?;

    if !resolved.starts_with(&upload_root) {
        return Err(format!(
            "input must be inside the upload directory: {}",
            input.display()
        ));
    }
    let metadata = tokio::fs::metadata(&resolved).await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(format!("input is not a file: {}", input.display()));
    }

    Ok(resolved)
}

/// Handler for POST /jobs
async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let settings = match body.settings(&state.defaults) {
        Ok(settings) => settings,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let input_path = match resolve_upload(&state.upload_dir, &body.input_path).await {
        Ok(path) => path,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let job_id = state.executor.submit(EncodeRequest {
        input_path: input_path.clone(),
        settings,
    });
    info!(
        job_id = %job_id,
        input = %input_path.display(),
        target_mb = settings.target_mb,
        codec = %settings.codec,
        "job submitted"
    );

    (StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })).into_response()
}

/// Handler for GET /jobs/:id
async fn job_progress(State(state): State<AppState>, Path(id): Path<String>) -> Json<ProgressReport> {
    Json(state.executor.registry().progress(&id))
}

/// Handler for GET /jobs/:id/download
async fn download_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let path = match state.executor.registry().artifact(&id) {
        Ok(path) => path,
        Err(e @ LookupError::MissingJob(_)) => {
            return error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e @ LookupError::JobNotReady { .. }) => {
            return error_response(StatusCode::CONFLICT, e.to_string())
        }
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            // reaped between lookup and open
            debug!(job_id = %id, error = %e, "artifact vanished before download");
            return error_response(StatusCode::NOT_FOUND, format!("job {} not found", id));
        }
    };
    let length = file.metadata().await.ok().map(|m| m.len());

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.mp4\"", id),
        );
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }

    match response.body(Body::from_stream(ReaderStream::new(file))) {
        Ok(response) => response,
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Creates the axum Router with the job endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(job_progress))
        .route("/jobs/:id/download", get(download_job))
        .with_state(state)
}

/// Runs the HTTP server on `bind` until it fails
pub async fn run_server(state: AppState, bind: &str) -> Result<(), ServerError> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyPlan;
    use crate::job_executor::JobExecutorConfig;
    use crate::registry::{JobPatch, JobRegistry, JobStatus};
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(work_dir: &std::path::Path) -> AppState {
        let executor = JobExecutor::new(
            ConcurrencyPlan {
                total_cores: 8,
                max_concurrent_jobs: 1,
            },
            JobRegistry::shared(Duration::from_secs(1800)),
            JobExecutorConfig {
                ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
                ffprobe_path: PathBuf::from("/nonexistent/ffprobe"),
                work_dir: work_dir.to_path_buf(),
            },
        );
        AppState {
            executor: Arc::new(executor),
            defaults: EncodeSettings::default(),
            upload_dir: work_dir.to_path_buf(),
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, json: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_job_reports_missing() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(dir.path()));

        let (status, body) = send(app, get_request("/jobs/nope")).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "missing");
    }

    #[tokio::test]
    async fn test_progress_of_running_job() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        state.executor.registry().patch(
            "abc",
            JobPatch::new()
                .status(JobStatus::Running)
                .percent(37.5)
                .message("Encoding… 37%"),
        );

        let (status, body) = send(create_router(state), get_request("/jobs/abc")).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["percent"], 37.5);
        assert_eq!(json["message"], "Encoding… 37%");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_submit_returns_job_id_and_records_job() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mov");
        std::fs::write(&input, b"source").unwrap();
        let mut state = test_state(&dir.path().join("work"));
        state.upload_dir = dir.path().to_path_buf();

        let (status, body) = send(
            create_router(state.clone()),
            post_json(
                "/jobs",
                serde_json::json!({
                    "input_path": input,
                    "target_mb": 25.0,
                    "codec": "h265",
                    "auto_quality": "off"
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        let response: SubmitJobResponse = serde_json::from_slice(&body).unwrap();
        assert!(uuid::Uuid::parse_str(&response.job_id).is_ok());
        assert!(state.executor.registry().get(&response.job_id).is_some());
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_parameters() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mov");
        std::fs::write(&input, b"source").unwrap();
        let state = test_state(dir.path());

        let bad_bodies = [
            serde_json::json!({ "input_path": input, "target_mb": 0 }),
            serde_json::json!({ "input_path": input, "target_mb": -5.0 }),
            serde_json::json!({ "input_path": input, "audio_kbps": 0 }),
            serde_json::json!({ "input_path": input, "auto_quality": "maybe" }),
            serde_json::json!({ "input_path": dir.path().join("absent.mov") }),
        ];
        for body in bad_bodies {
            let (status, _) = send(create_router(state.clone()), post_json("/jobs", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        assert!(state.executor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_inputs_outside_upload_dir() {
        let dir = TempDir::new().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let precious = dir.path().join("not-an-upload.txt");
        std::fs::write(&precious, b"keep me").unwrap();

        let mut state = test_state(dir.path());
        state.upload_dir = uploads.clone();

        let outside = [
            precious.clone(),
            uploads.join("..").join("not-an-upload.txt"),
            uploads.clone(),
        ];
        for input_path in outside {
            let (status, body) = send(
                create_router(state.clone()),
                post_json("/jobs", serde_json::json!({ "input_path": input_path })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(json["error"].is_string());
        }

        #[cfg(unix)]
        {
            let link = uploads.join("link.mov");
            std::os::unix::fs::symlink(&precious, &link).unwrap();
            let (status, _) = send(
                create_router(state.clone()),
                post_json("/jobs", serde_json::json!({ "input_path": link })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        assert!(state.executor.registry().is_empty());
        assert_eq!(std::fs::read(&precious).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request_with_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("clip.mov");
        std::fs::write(&input, b"source").unwrap();
        let state = test_state(dir.path());

        let malformed = [
            serde_json::json!({ "input_path": input, "codec": "av1" }),
            serde_json::json!({ "input_path": input, "audio_kbps": 96.5 }),
            serde_json::json!({ "target_mb": 10 }),
        ];
        for body in malformed {
            let (status, body) = send(create_router(state.clone()), post_json("/jobs", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(json["error"].is_string());
        }
        assert!(input.exists());
        assert!(state.executor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_download_status_codes() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        state
            .executor
            .registry()
            .patch("busy", JobPatch::new().status(JobStatus::Running));

        let (status, _) = send(create_router(state.clone()), get_request("/jobs/ghost/download")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(create_router(state), get_request("/jobs/busy/download")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_download_streams_finished_output() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        let output = state.executor.output_path("done-job");
        std::fs::write(&output, b"mp4-bytes").unwrap();
        state.executor.registry().patch(
            "done-job",
            JobPatch::new()
                .paths(dir.path().join("in.mov"), output)
                .status(JobStatus::Done)
                .percent(100.0)
                .output_bytes(9),
        );

        let response = create_router(state)
            .oneshot(get_request("/jobs/done-job/download"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"done-job.mp4\""
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"mp4-bytes");
    }

    #[test]
    fn test_settings_fall_back_to_defaults() {
        let request: SubmitJobRequest =
            serde_json::from_str(r#"{"input_path":"/tmp/x.mov","auto_quality":false}"#).unwrap();
        let settings = request.settings(&EncodeSettings::default()).unwrap();

        assert_eq!(settings.target_mb, 499.0);
        assert_eq!(settings.codec, Codec::H264);
        assert_eq!(settings.audio_kbps, 128);
        assert!(!settings.auto_quality);
    }
}
