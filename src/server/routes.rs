use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, Sse},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

use crate::error::CrawlError;
use crate::models::CreateJobRequest;
use crate::AppState;

/// How long one blocking-tail read waits before the stream emits a ping.
const TAIL_TIMEOUT: Duration = Duration::from_secs(5);

/// POST /jobs
///
/// Create a crawl job. The seed must survive normalization and the
/// documentation filter; everything else about the crawl is asynchronous.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> impl IntoResponse {
    match state.service.create_job(request).await {
        Ok(response) => (StatusCode::OK, Json(json!(response))),
        Err(CrawlError::InvalidUrl(msg)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
        }
        Err(e) => {
            tracing::error!(error = %e, "Job creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

/// GET /jobs
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.list_jobs().await {
        Ok(jobs) => (StatusCode::OK, Json(json!({ "jobs": jobs }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// GET /jobs/{id}/state
pub async fn job_state(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.service.snapshot(&job_id).await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(json!(snapshot))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "lastEventId")]
    last_event_id: Option<u64>,
}

/// GET /jobs/{id}/stream
///
/// Server-sent event stream. Replays everything after the client's last
/// seen id (header or query param), tails the log until a terminal event is
/// delivered, and pings on idle reads so intermediaries keep the connection.
pub async fn stream_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    match state.service.load_job(&job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown job" })),
            )
                .into_response()
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }

    let header_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let mut after = query.last_event_id.or(header_id).unwrap_or(0);

    let service = state.service.clone();
    let stream = async_stream::stream! {
        'stream: loop {
            let terminal_status = match service.load_status(&job_id).await {
                Ok(status) => status.map(|s| s.is_terminal()).unwrap_or(true),
                Err(_) => true,
            };

            let events = if terminal_status {
                service
                    .events()
                    .read_after(&job_id, after, 1024)
                    .await
                    .unwrap_or_default()
            } else {
                service
                    .events()
                    .tail(&job_id, after, TAIL_TIMEOUT)
                    .await
                    .unwrap_or_default()
            };

            if events.is_empty() {
                if terminal_status {
                    // Fully replayed; nothing more will ever arrive
                    break 'stream;
                }
                yield Ok::<_, Infallible>(SseEvent::default().comment("ping"));
                continue;
            }

            for event in events {
                after = event.event_id;
                let is_terminal = event.event_type.is_terminal();
                yield Ok(SseEvent::default()
                    .id(event.event_id.to_string())
                    .event(event.event_type.as_str())
                    .data(event.payload.to_string()));
                if is_terminal {
                    break 'stream;
                }
            }
        }
    };

    Sse::new(stream).into_response()
}

/// GET /jobs/{id}/download
///
/// The assembled Markdown; 409 until the job completes.
pub async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job = match state.service.load_job(&job_id).await {
        Ok(job) => job,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    let Some(job) = job else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job" })),
        )
            .into_response();
    };
    if !matches!(job.status, crate::models::JobStatusKind::Completed) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "job not completed" })),
        )
            .into_response();
    }

    match state.service.download(&job_id).await {
        Ok(Some(markdown)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            markdown,
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "result expired" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.service.cancel(&job_id).await {
        Ok(true) => (StatusCode::OK, Json(json!({}))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// POST /internal/jobs/{id}/worker
///
/// Worker entry point; reinvocations in http dispatch mode land here.
pub async fn run_worker(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let service = state.service.clone();
    tokio::spawn(async move {
        crate::jobs::worker::run_worker(service, job_id).await;
    });
    (StatusCode::ACCEPTED, Json(json!({})))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
