use std::collections::BTreeMap;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use canvas_core::{CanvasError, Color, PlacementRecord};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canvas::PixelInfo;
use crate::metrics::{PLACEMENT_REJECTED, SPECTATORS};
use crate::state::AppState;

use super::{ApiError, ApiResult, AuthToken};

pub const MAX_REGION_SIDE: u32 = 256;
pub const DEFAULT_RECENT_LIMIT: usize = 50;
pub const MAX_RECENT_LIMIT: usize = 1000;
const LEADERBOARD_SIZE: usize = 10;

#[derive(Debug, Deserialize)]
pub struct PlacePixelRequest {
    pub x: i64,
    pub y: i64,
    pub color: String,
}

#[derive(Debug, Serialize)]
pub struct PlacePixelResponse {
    pub ok: bool,
    pub placement: PlacementRecord,
    pub cooldown_ms: u64,
}

pub async fn place_pixel(
    State(state): State<AppState>,
    token: AuthToken,
    Json(body): Json<PlacePixelRequest>,
) -> ApiResult<PlacePixelResponse> {
    let Some(bot) = state.bots.authenticate(token.as_str()) else {
        PLACEMENT_REJECTED.with_label_values(&["unauthorized"]).inc();
        return Err(ApiError::Unauthorized);
    };

    let (width, height) = state.canvas.dimensions();
    if body.x < 0 || body.y < 0 || body.x >= width as i64 || body.y >= height as i64 {
        PLACEMENT_REJECTED.with_label_values(&["coordinate"]).inc();
        return Err(ApiError::BadRequest(format!(
            "coordinates must be within 0..{width} x 0..{height}"
        )));
    }
    let color: Color = body.color.parse().map_err(|err: CanvasError| {
        PLACEMENT_REJECTED.with_label_values(&["color"]).inc();
        ApiError::BadRequest(err.to_string())
    })?;

    if let Err(remaining) = state.bots.try_reserve(&bot.id, Instant::now()) {
        PLACEMENT_REJECTED.with_label_values(&["cooldown"]).inc();
        return Err(ApiError::TooManyRequests {
            retry_after_ms: remaining.as_millis() as u64,
        });
    }

    let placement = state
        .canvas
        .place_pixel(body.x, body.y, color, &bot.id, &bot.name)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    Ok(Json(PlacePixelResponse {
        ok: true,
        placement,
        cooldown_ms: state.bots.cooldown().as_millis() as u64,
    }))
}

pub async fn canvas_state(State(state): State<AppState>) -> Response {
    let snapshot = state.canvas.state();
    Json(snapshot.as_ref()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RegionQuery {
    pub x: i64,
    pub y: i64,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Serialize)]
pub struct RegionResponse {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub colors: Vec<Vec<Color>>,
}

pub async fn canvas_region(
    State(state): State<AppState>,
    Query(query): Query<RegionQuery>,
) -> ApiResult<RegionResponse> {
    if query.w == 0 || query.h == 0 || query.w > MAX_REGION_SIDE || query.h > MAX_REGION_SIDE {
        return Err(ApiError::BadRequest(format!(
            "w and h must be between 1 and {MAX_REGION_SIDE}"
        )));
    }
    let colors = state.canvas.region(query.x, query.y, query.w, query.h);
    Ok(Json(RegionResponse {
        x: query.x,
        y: query.y,
        width: query.w,
        height: query.h,
        colors,
    }))
}

pub async fn pixel_info(
    State(state): State<AppState>,
    Path((x, y)): Path<(i64, i64)>,
) -> ApiResult<PixelInfo> {
    let mut info = state
        .canvas
        .pixel_info(x, y)
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if info.owner_name.is_none() {
        info.owner_name = info
            .owner_id
            .as_deref()
            .and_then(|id| state.bots.get(id))
            .map(|bot| bot.name);
    }
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub placements: Vec<PlacementRecord>,
}

pub async fn recent_placements(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Json<RecentResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);
    Json(RecentResponse {
        placements: state.canvas.recent_placements(limit),
    })
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub bot_id: String,
    pub name: Option<String>,
    pub pixels: u64,
    /// Lifetime placements from the shared cache counter, when available.
    pub total_placed: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub width: u32,
    pub height: u32,
    pub total_pixels: u64,
    pub color_counts: BTreeMap<Color, u64>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub active_bots: usize,
    pub active_bots_shared: Option<u64>,
    pub registered_bots: usize,
    pub spectators: i64,
    pub next_snapshot: u64,
    pub uptime_secs: u64,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let (width, height) = state.canvas.dimensions();
    let ownership = state.canvas.pixel_ownership();
    let mut owners: Vec<(&String, &u64)> = ownership.iter().collect();
    owners.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    let mirror = state.canvas.mirror();
    let mut leaderboard = Vec::with_capacity(LEADERBOARD_SIZE);
    for (bot_id, pixels) in owners.into_iter().take(LEADERBOARD_SIZE) {
        let total_placed = match mirror {
            Some(mirror) => mirror.bot_pixel_count(bot_id).await,
            None => None,
        };
        leaderboard.push(LeaderboardEntry {
            bot_id: bot_id.clone(),
            name: state.bots.get(bot_id).map(|bot| bot.name),
            pixels: *pixels,
            total_placed,
        });
    }
    let active_bots_shared = match mirror {
        Some(mirror) => mirror.active_bot_count().await,
        None => None,
    };
    debug!(owners = ownership.len(), "stats computed");

    Json(StatsResponse {
        width,
        height,
        total_pixels: width as u64 * height as u64,
        color_counts: state.canvas.color_counts(),
        leaderboard,
        active_bots: state.canvas.active_bots(),
        active_bots_shared,
        registered_bots: state.bots.len(),
        spectators: SPECTATORS.get(),
        next_snapshot: state.scheduler.next_snapshot_time(),
        uptime_secs: state.uptime_secs(),
    })
}
