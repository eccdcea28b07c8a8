//! Bot registration, API-key authentication and placement cooldowns.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::canvas::now_millis;

pub const NAME_MIN: usize = 3;
pub const NAME_MAX: usize = 32;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);
const API_KEY_PREFIX: &str = "cvs_";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BotError {
    #[error("bot name {0:?} is already taken")]
    NameConflict(String),
    #[error("bot names are {NAME_MIN}-{NAME_MAX} characters of letters, digits, '_' or '-'")]
    InvalidName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotRecord {
    pub id: String,
    pub name: String,
    pub created_at: u64,
}

/// In-process bot directory. Only key hashes are kept, so a leaked dump cannot be
/// replayed as credentials.
pub struct BotRegistry {
    bots: DashMap<String, BotRecord>,
    names: DashMap<String, String>,
    keys: DashMap<String, String>,
    last_placed: DashMap<String, Instant>,
    cooldown: Duration,
}

impl BotRegistry {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            bots: DashMap::new(),
            names: DashMap::new(),
            keys: DashMap::new(),
            last_placed: DashMap::new(),
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Register a bot. Returns the record and the plaintext API key, which is never
    /// stored and cannot be recovered later.
    pub fn register(&self, name: &str) -> Result<(BotRecord, String), BotError> {
        let name = name.trim();
        validate_name(name)?;

        let id = Uuid::new_v4().to_string();
        match self.names.entry(name.to_ascii_lowercase()) {
            Entry::Occupied(_) => return Err(BotError::NameConflict(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        let api_key = format!("{API_KEY_PREFIX}{}", Uuid::new_v4().simple());
        let record = BotRecord {
            id: id.clone(),
            name: name.to_string(),
            created_at: now_millis(),
        };
        self.keys.insert(hash_api_key(&api_key), id.clone());
        self.bots.insert(id, record.clone());
        tracing::info!(bot_id = %record.id, bot_name = %record.name, "bot registered");
        Ok((record, api_key))
    }

    pub fn authenticate(&self, api_key: &str) -> Option<BotRecord> {
        let id = self.keys.get(&hash_api_key(api_key))?.value().clone();
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Option<BotRecord> {
        self.bots.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    /// Check and mark in one step so two concurrent requests from the same bot cannot
    /// both get through. `Err(remaining)` while the bot is still cooling down.
    pub fn try_reserve(&self, bot_id: &str, now: Instant) -> Result<(), Duration> {
        match self.last_placed.entry(bot_id.to_string()) {
            Entry::Occupied(mut last) => {
                self.remaining(*last.get(), now)?;
                last.insert(now);
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(())
            }
        }
    }

    fn remaining(&self, last: Instant, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.cooldown {
            Ok(())
        } else {
            Err(self.cooldown - elapsed)
        }
    }
}

impl Default for BotRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

fn validate_name(name: &str) -> Result<(), BotError> {
    let valid_len = (NAME_MIN..=NAME_MAX).contains(&name.len());
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(BotError::InvalidName)
    }
}

pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}
