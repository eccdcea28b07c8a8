mod archives;
mod auth;
mod bots;
mod canvas;
mod sse;

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub use auth::AuthToken;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/readyz", get(readiness))
        .route("/metrics", get(sse::prometheus_metrics))
        .route("/api/bots/register", post(bots::register_bot))
        .route("/api/pixel", post(canvas::place_pixel))
        .route("/api/pixel/:x/:y", get(canvas::pixel_info))
        .route("/api/canvas", get(canvas::canvas_state))
        .route("/api/canvas/region", get(canvas::canvas_region))
        .route("/api/placements/recent", get(canvas::recent_placements))
        .route("/api/stats", get(canvas::stats))
        .route("/api/archives", get(archives::list_archives))
        .route("/api/archives/:id", get(archives::get_archive))
        .route("/api/snapshot/next", get(archives::next_snapshot))
        .route("/api/stream", get(sse::stream_placements))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct Readiness {
    ready: bool,
    cache: bool,
    archive_backends: Vec<&'static str>,
}

async fn readiness(State(state): State<AppState>) -> Json<Readiness> {
    Json(Readiness {
        ready: true,
        cache: state.canvas.mirror().is_some(),
        archive_backends: state.archives.backend_names(),
    })
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(&'static str),
    Conflict(String),
    BadRequest(String),
    TooManyRequests { retry_after_ms: u64 },
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message, retry_after_ms) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None, None),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "not_found",
                Some(msg.to_string()),
                None,
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg), None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg), None),
            ApiError::TooManyRequests { retry_after_ms } => (
                StatusCode::TOO_MANY_REQUESTS,
                "too_many_requests",
                Some("placement cooldown still active".to_string()),
                Some(retry_after_ms),
            ),
        };
        let mut response = (
            status,
            Json(ApiErrorBody {
                error,
                message,
                retry_after_ms,
            }),
        )
            .into_response();
        if let Some(ms) = retry_after_ms {
            let secs = ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
