//! HTTP adapter. Shares the engine (and therefore the store and the approval
//! batcher) with the Telegram bot.
use std::future::Future;
use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{parse_student_id, validate_course_id, ApprovalEngine, EngineError};
use crate::model::{Decision, PaymentMethod};

/// Header carrying the caller's Telegram id on admin routes.
pub const CALLER_HEADER: &str = "x-telegram-id";

#[derive(Clone)]
pub struct WebState {
    pub engine: ApprovalEngine,
    pub uploads_dir: PathBuf,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/payment/upload", post(upload_payment))
        .route("/admin/pending", get(pending))
        .route(
            "/admin/enrollments/:student_id/:course_id/:decision",
            post(decide),
        )
        .route("/admin/students", get(students))
        .route("/admin/students/:student_id/message", post(message_student))
        .route("/admin/broadcast", post(broadcast))
        .route("/contact", post(contact))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then finish in-flight requests and return.
pub async fn serve<F>(listener: TcpListener, state: WebState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::NotFound { .. } | EngineError::StudentNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Unauthorized(_) => StatusCode::FORBIDDEN,
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Store(err) => {
                error!(?err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            EngineError::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn caller_id(headers: &HeaderMap) -> i64 {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

async fn health(State(state): State<WebState>) -> Response {
    match sqlx::query("SELECT 1").execute(state.engine.pool()).await {
        Ok(_) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => {
            error!(?err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub telegram_id: String,
    pub course_id: String,
    pub payment_method: String,
}

#[instrument(skip_all)]
async fn upload_payment(
    State(state): State<WebState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Response, EngineError> {
    let student_id = parse_student_id(&params.telegram_id)?;
    let method = PaymentMethod::parse_method(&params.payment_method).ok_or_else(|| {
        EngineError::Validation(format!("unknown payment method '{}'", params.payment_method))
    })?;
    validate_course_id(&params.course_id)?;
    if body.is_empty() {
        return Err(EngineError::Validation("empty receipt upload".into()));
    }

    let file_name = format!("{}.bin", Uuid::new_v4());
    let path = state.uploads_dir.join(&file_name);
    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| EngineError::Store(anyhow::Error::new(e).context("writing receipt upload")))?;
    info!(student_id, bytes = body.len(), file = %file_name, "stored receipt upload");

    let receipt = format!("upload:{}", file_name);
    match state
        .engine
        .submit(student_id, &params.course_id, method, Some(&receipt))
        .await
    {
        Ok(enrollment) => Ok((StatusCode::CREATED, Json(enrollment)).into_response()),
        Err(err) => {
            if let Err(rm_err) = tokio::fs::remove_file(&path).await {
                warn!(?rm_err, file = %file_name, "failed to remove orphaned receipt upload");
            }
            Err(err)
        }
    }
}

async fn pending(
    State(state): State<WebState>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let requests = state.engine.pending_requests(caller_id(&headers)).await?;
    Ok(Json(requests).into_response())
}

async fn decide(
    State(state): State<WebState>,
    headers: HeaderMap,
    Path((student_id, course_id, decision)): Path<(String, String, String)>,
) -> Result<Response, EngineError> {
    let decision = match decision.as_str() {
        "approve" => Decision::Approve,
        "reject" => Decision::Reject,
        _ => return Ok(StatusCode::NOT_FOUND.into_response()),
    };
    let student_id = parse_student_id(&student_id)?;
    let status = state
        .engine
        .decide(caller_id(&headers), student_id, &course_id, decision)
        .await?;
    Ok(Json(json!({
        "student_id": student_id,
        "course_id": course_id,
        "approval_status": status,
    }))
    .into_response())
}

async fn students(
    State(state): State<WebState>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let students = state.engine.list_students(caller_id(&headers)).await?;
    Ok(Json(json!({ "total": students.len(), "students": students })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub body: String,
}

async fn message_student(
    State(state): State<WebState>,
    headers: HeaderMap,
    Path(student_id): Path<String>,
    Json(payload): Json<MessageBody>,
) -> Result<Response, EngineError> {
    let student_id = parse_student_id(&student_id)?;
    let delivered = state
        .engine
        .message_student(caller_id(&headers), student_id, &payload.body)
        .await?;
    Ok(Json(json!({ "student_id": student_id, "delivered": delivered })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BroadcastBody {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

async fn broadcast(
    State(state): State<WebState>,
    headers: HeaderMap,
    Json(payload): Json<BroadcastBody>,
) -> Result<Response, EngineError> {
    let text = if payload.body.trim().is_empty() {
        payload.title.trim().to_string()
    } else {
        format!("{}\n\n{}", payload.title.trim(), payload.body.trim())
    };
    let report = state.engine.broadcast(caller_id(&headers), &text).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ContactBody {
    pub telegram_id: i64,
    pub message: String,
}

async fn contact(
    State(state): State<WebState>,
    Json(payload): Json<ContactBody>,
) -> Result<Response, EngineError> {
    let delivered = state
        .engine
        .contact_admin(payload.telegram_id, &payload.message)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))).into_response())
}
