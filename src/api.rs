use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Multipart, Path, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{
    artifact_store::{Artifact, ArtifactId, StoreError},
    job_service::{JobError, JobOutput},
    models::{
        retrieval_url, ArtifactMetadataResponse, ErrorResponse, OutputFormat, ParseRequest,
        ParseResponse, ResponseStatus, UploadResponse,
    },
    AppState,
};

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "storedArtifacts": state.store.len().await,
        "pendingExpirations": state.scheduler.pending_count().await,
    }))
}

pub async fn parse(
    State(state): State<AppState>,
    payload: Result<Json<ParseRequest>, JsonRejection>,
) -> Response<Body> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                rejection.body_text(),
            )
        }
    };

    let job = match state.jobs.job_from_request(request) {
        Ok(job) => job,
        Err(err) => return job_error_response(&err),
    };

    match state.jobs.execute(job).await {
        Ok(JobOutput::Inline { format, content }) => (
            StatusCode::OK,
            Json(ParseResponse {
                status: ResponseStatus::Success,
                format,
                data: Some(content),
                artifact_id: None,
                retrieval_url: None,
                expires_at: None,
            }),
        )
            .into_response(),
        Ok(JobOutput::Stored { format, artifact }) => {
            let artifact_id = artifact.id.to_string();
            (
                StatusCode::OK,
                Json(ParseResponse {
                    status: ResponseStatus::Success,
                    format,
                    data: None,
                    retrieval_url: Some(retrieval_url(&artifact_id)),
                    artifact_id: Some(artifact_id),
                    expires_at: Some(artifact.expires_at),
                }),
            )
                .into_response()
        }
        Err(err) => job_error_response(&err),
    }
}

pub async fn upload_artifact(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response<Body> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_REQUEST",
                    "Multipart upload must include a file field.",
                )
            }
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", err.body_text())
            }
        };

        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        let artifact = match state
            .store
            .put_stream(&file_name, state.config.retention, field)
            .await
        {
            Ok(artifact) => artifact,
            Err(err) => return store_error_response(&err),
        };
        state
            .scheduler
            .schedule(artifact.id, artifact.expires_at)
            .await;

        let artifact_id = artifact.id.to_string();
        let response = UploadResponse {
            retrieval_url: retrieval_url(&artifact_id),
            artifact_id,
            expires_at: artifact.expires_at,
            file_name: artifact.file_name,
            size_bytes: artifact.size_bytes,
        };
        return (StatusCode::CREATED, Json(response)).into_response();
    }
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Response<Body> {
    let Ok(id) = artifact_id.parse::<ArtifactId>() else {
        return artifact_not_found();
    };

    let (artifact, file) = match state.store.get(&id).await {
        Ok(found) => found,
        Err(err) => return store_error_response(&err),
    };

    let content_disposition = format!(
        "attachment; filename=\"{}\"",
        ascii_file_name(&artifact.file_name)
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(&artifact))
        .header(header::CONTENT_LENGTH, artifact.size_bytes)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .body(Body::from_stream(ReaderStream::new(file)))
        .unwrap_or_else(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "RESPONSE_BUILD_FAILED",
                "Failed to build download response.",
            )
        })
}

pub async fn artifact_metadata(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Response<Body> {
    let Ok(id) = artifact_id.parse::<ArtifactId>() else {
        return artifact_not_found();
    };

    match state.store.metadata(&id).await {
        Ok(artifact) => (
            StatusCode::OK,
            Json(ArtifactMetadataResponse {
                artifact_id: artifact.id.to_string(),
                file_name: artifact.file_name,
                size_bytes: artifact.size_bytes,
                created_at: artifact.created_at,
                expires_at: artifact.expires_at,
                scheduled_deletion_at: state.scheduler.fire_time(&id).await,
            }),
        )
            .into_response(),
        Err(err) => store_error_response(&err),
    }
}

pub async fn delete_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Response<Body> {
    let Ok(id) = artifact_id.parse::<ArtifactId>() else {
        return artifact_not_found();
    };

    // Store before timer; see `ExpiryScheduler::schedule`. A failed unlink
    // keeps the timer so expiry retries it.
    let deleted = state.store.delete(&id).await;
    if !matches!(deleted, Err(StoreError::Io(_))) {
        state.scheduler.cancel(&id).await;
    }
    match deleted {
        Ok(artifact) if artifact.is_expired_at(Utc::now()) => artifact_not_found(),
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "deleted": true, "artifactId": id.to_string() })),
        )
            .into_response(),
        Err(err) => store_error_response(&err),
    }
}

fn content_type_for(artifact: &Artifact) -> &'static str {
    let extension = artifact
        .file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("json") => OutputFormat::Json.content_type(),
        Some("csv") => OutputFormat::Csv.content_type(),
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn ascii_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

fn job_error_response(err: &JobError) -> Response<Body> {
    let (status, code) = match err {
        JobError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        JobError::WorkerNotFound { .. } => (StatusCode::SERVICE_UNAVAILABLE, "WORKER_NOT_FOUND"),
        JobError::WorkerFailed { .. } => (StatusCode::BAD_GATEWAY, "WORKER_FAILED"),
        JobError::WorkerTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "WORKER_TIMEOUT"),
        JobError::OutputMissing => (StatusCode::BAD_GATEWAY, "OUTPUT_MISSING"),
        JobError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_IO_FAILURE"),
    };
    error_response(status, code, err.to_string())
}

fn store_error_response(err: &StoreError) -> Response<Body> {
    match err {
        StoreError::NotFound => artifact_not_found(),
        StoreError::TooLarge { .. } => {
            error_response(StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", err.to_string())
        }
        StoreError::Upload(_) => {
            error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", err.to_string())
        }
        StoreError::Io(_) => {
            warn!("Artifact storage failure: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_IO_FAILURE",
                err.to_string(),
            )
        }
    }
}

fn artifact_not_found() -> Response<Body> {
    error_response(
        StatusCode::NOT_FOUND,
        "ARTIFACT_NOT_FOUND",
        "Artifact not found or expired.",
    )
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response<Body> {
    (status, Json(ErrorResponse::new(code, message))).into_response()
}
