use axum::{
    extract::{Path, State},
    Json,
};
use canvas_core::Color;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::ArchiveMeta;
use crate::canvas::now_millis;
use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Serialize)]
pub struct ArchiveListResponse {
    pub archives: Vec<ArchiveMeta>,
}

pub async fn list_archives(State(state): State<AppState>) -> Json<ArchiveListResponse> {
    Json(ArchiveListResponse {
        archives: state.archives.list(),
    })
}

#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub id: String,
    pub timestamp: u64,
    pub width: u32,
    pub height: u32,
    pub colors: Vec<Vec<Color>>,
}

pub async fn get_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ArchiveResponse> {
    let meta = ArchiveMeta::from_id(&id).ok_or(ApiError::NotFound("archive not found"))?;
    let archive = state
        .archives
        .fetch(&meta.id)
        .await
        .ok_or(ApiError::NotFound("archive not found"))?;
    Ok(Json(ArchiveResponse {
        id: meta.id,
        timestamp: meta.timestamp,
        width: archive.width,
        height: archive.height,
        colors: archive.colors,
    }))
}

#[derive(Debug, Serialize)]
pub struct NextSnapshotResponse {
    pub next_snapshot: u64,
    pub next_snapshot_at: Option<DateTime<Utc>>,
    pub seconds_remaining: u64,
}

pub async fn next_snapshot(State(state): State<AppState>) -> Json<NextSnapshotResponse> {
    let next = state.scheduler.next_snapshot_time();
    Json(NextSnapshotResponse {
        next_snapshot: next,
        next_snapshot_at: DateTime::from_timestamp_millis(next as i64),
        seconds_remaining: next.saturating_sub(now_millis()) / 1000,
    })
}
