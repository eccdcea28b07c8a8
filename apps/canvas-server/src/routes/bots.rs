use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::bots::{BotError, BotRecord};
use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct RegisterBotRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterBotResponse {
    #[serde(flatten)]
    pub bot: BotRecord,
    pub api_key: String,
    pub cooldown_ms: u64,
}

pub async fn register_bot(
    State(state): State<AppState>,
    Json(body): Json<RegisterBotRequest>,
) -> ApiResult<RegisterBotResponse> {
    let (bot, api_key) = state.bots.register(&body.name).map_err(|err| match err {
        BotError::NameConflict(_) => ApiError::Conflict(err.to_string()),
        BotError::InvalidName => ApiError::BadRequest(err.to_string()),
    })?;
    Ok(Json(RegisterBotResponse {
        bot,
        api_key,
        cooldown_ms: state.bots.cooldown().as_millis() as u64,
    }))
}
