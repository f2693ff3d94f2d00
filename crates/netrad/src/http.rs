//! HTTP API: session control, attendance queries and the MJPEG preview.

use crate::engine::{StartError, StopError, VerificationController};
use crate::stream::{FrameBuffer, Next};
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{Local, NaiveDate};
use futures::stream;
use netra_core::LectureContext;
use netra_store::SqliteStore;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<VerificationController>,
    pub store: Arc<SqliteStore>,
    pub stream_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    let attendance = Router::new()
        .route("/start_verification", post(start_verification))
        .route("/stop_verification", post(stop_verification))
        .route("/get_attendance", get(get_attendance))
        .route("/status", get(status))
        .route("/stream", get(video_stream))
        .route("/records", get(records))
        .route("/absentees", get(absentees));

    Router::new()
        .route("/", get(health))
        .nest("/api/attendance", attendance)
        .with_state(state)
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "Backend is running." }))
}

#[derive(Deserialize, Default)]
struct StartRequest {
    current_lecture: Option<LectureRequest>,
}

#[derive(Deserialize, Default)]
struct LectureRequest {
    subject: Option<String>,
    teacher: Option<String>,
    hall: Option<String>,
    time_slot: Option<String>,
    class: Option<String>,
}

impl LectureRequest {
    /// Absent fields become `"N/A"`; present but blank fields are rejected.
    fn into_context(self) -> Result<LectureContext, String> {
        fn field(name: &str, value: Option<String>) -> Result<String, String> {
            match value {
                None => Ok("N/A".to_string()),
                Some(v) if v.trim().is_empty() => Err(format!("lecture field '{name}' is blank")),
                Some(v) => Ok(v.trim().to_string()),
            }
        }
        Ok(LectureContext {
            subject: field("subject", self.subject)?,
            teacher: field("teacher", self.teacher)?,
            hall: field("hall", self.hall)?,
            time_slot: field("time_slot", self.time_slot)?,
            class: self
                .class
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        })
    }
}

async fn start_verification(State(state): State<AppState>, body: Bytes) -> Response {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return detail(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid request: {e}")),
        }
    };
    let lecture = match request.current_lecture.unwrap_or_default().into_context() {
        Ok(lecture) => lecture,
        Err(message) => return detail(StatusCode::UNPROCESSABLE_ENTITY, message),
    };

    let controller = Arc::clone(&state.controller);
    match tokio::task::spawn_blocking(move || controller.start(lecture)).await {
        Ok(Ok(())) => Json(json!({ "status": "Verification started successfully." })).into_response(),
        Ok(Err(e @ (StartError::AlreadyRunning | StartError::Cancelled))) => {
            detail(StatusCode::CONFLICT, e.to_string())
        }
        Ok(Err(e @ StartError::Init(_))) => detail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => {
            tracing::error!(error = %e, "start task failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "start task failed")
        }
    }
}

async fn stop_verification(State(state): State<AppState>) -> Response {
    let controller = Arc::clone(&state.controller);
    match tokio::task::spawn_blocking(move || controller.stop()).await {
        Ok(Ok(())) => Json(json!({ "status": "Verification stopped." })).into_response(),
        Ok(Err(e @ StopError::NotRunning)) => detail(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            tracing::error!(error = %e, "stop task failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "stop task failed")
        }
    }
}

async fn get_attendance(State(state): State<AppState>) -> Response {
    Json(state.controller.attendance_snapshot()).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    Json(state.controller.status()).into_response()
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\n");
    part.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

async fn video_stream(State(state): State<AppState>) -> Response {
    let Some(frames) = state.controller.frames() else {
        tracing::warn!("stream requested but no session is running");
        return detail(StatusCode::SERVICE_UNAVAILABLE, "Verification is not running.");
    };
    tracing::info!("stream reader attached");

    let timeout = state.stream_timeout;
    let parts = stream::unfold(frames, move |frames: Arc<FrameBuffer>| async move {
        loop {
            match frames.next(timeout).await {
                Next::Frame(jpeg) => {
                    return Some((Ok::<_, Infallible>(multipart_part(&jpeg)), frames));
                }
                Next::Timeout if !frames.is_closed() => continue,
                Next::Timeout | Next::Closed => {
                    tracing::info!("stream reader detached");
                    return None;
                }
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

fn parse_date(raw: Option<&str>) -> Result<NaiveDate, Response> {
    match raw {
        None => Ok(Local::now().date_naive()),
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            detail(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("invalid date {raw:?}, expected YYYY-MM-DD"),
            )
        }),
    }
}

#[derive(Deserialize)]
struct RecordsQuery {
    date: Option<String>,
}

async fn records(State(state): State<AppState>, Query(query): Query<RecordsQuery>) -> Response {
    let date = match parse_date(query.date.as_deref()) {
        Ok(date) => date,
        Err(response) => return response,
    };
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.attendance_records(date)).await {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "attendance query failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "attendance query failed")
        }
        Err(e) => {
            tracing::error!(error = %e, "attendance query task failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "attendance query failed")
        }
    }
}

#[derive(Deserialize)]
struct AbsenteesQuery {
    date: Option<String>,
    subject: String,
    time_slot: String,
}

async fn absentees(State(state): State<AppState>, Query(query): Query<AbsenteesQuery>) -> Response {
    let date = match parse_date(query.date.as_deref()) {
        Ok(date) => date,
        Err(response) => return response,
    };
    let store = Arc::clone(&state.store);
    let AbsenteesQuery {
        subject, time_slot, ..
    } = query;
    match tokio::task::spawn_blocking(move || store.absentees(date, &subject, &time_slot)).await {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "absentee query failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "absentee query failed")
        }
        Err(e) => {
            tracing::error!(error = %e, "absentee query task failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "absentee query failed")
        }
    }
}
