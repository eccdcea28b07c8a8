//! Fast key-value cache shared between canvas server processes.
//!
//! The canvas treats the cache strictly as an optimization: every caller logs and
//! skips a failed call instead of propagating it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::cache_redis::RedisCache;

pub type CacheHandle = Arc<dyn CanvasCache>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache unavailable")]
    Unavailable,
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Score bound for the sorted-set range operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(f64),
}

impl ScoreBound {
    pub fn to_arg(self) -> String {
        match self {
            ScoreBound::NegInf => "-inf".into(),
            ScoreBound::PosInf => "+inf".into(),
            ScoreBound::Inclusive(v) => v.to_string(),
        }
    }

    fn admits_from_below(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(min) => score >= min,
        }
    }

    fn admits_from_above(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(max) => score <= max,
        }
    }
}

#[async_trait]
pub trait CanvasCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
    async fn hset_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError>;
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError>;
    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<String>, CacheError>;
    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, CacheError>;
    async fn zcard(&self, key: &str) -> Result<u64, CacheError>;
}

/// Connect the configured cache, or `None` when the canvas runs without one.
pub async fn build_cache(redis_url: Option<&str>) -> Option<CacheHandle> {
    let url = redis_url?;
    match RedisCache::connect(url).await {
        Ok(cache) => Some(Arc::new(cache)),
        Err(err) => {
            warn!(error = %err, "failed to reach redis; running without external cache");
            None
        }
    }
}

#[derive(Default)]
struct InMemoryState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    // member -> score, per key
    sorted: HashMap<String, BTreeMap<String, f64>>,
}

/// Process-local cache used by tests and single-node setups.
#[derive(Default)]
pub struct InMemoryCache {
    inner: Mutex<InMemoryState>,
}

impl InMemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CanvasCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.inner.lock().await.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.inner
            .lock()
            .await
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError> {
        let mut guard = self.inner.lock().await;
        let hash = guard.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .inner
            .lock()
            .await
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        Ok(self
            .inner
            .lock()
            .await
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        let mut guard = self.inner.lock().await;
        let hash = guard.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| CacheError::Backend(format!("{key}.{field} is not an integer")))?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError> {
        self.inner
            .lock()
            .await
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<String>, CacheError> {
        let guard = self.inner.lock().await;
        let Some(set) = guard.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(&String, f64)> = set
            .iter()
            .filter(|(_, score)| min.admits_from_below(**score) && max.admits_from_above(**score))
            .map(|(member, score)| (member, *score))
            .collect();
        // Ties break lexicographically, as in redis.
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(hits.into_iter().map(|(member, _)| member.clone()).collect())
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, CacheError> {
        let mut guard = self.inner.lock().await;
        let Some(set) = guard.sorted.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| !(min.admits_from_below(*score) && max.admits_from_above(*score)));
        Ok((before - set.len()) as u64)
    }

    async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        Ok(self
            .inner
            .lock()
            .await
            .sorted
            .get(key)
            .map(|set| set.len() as u64)
            .unwrap_or(0))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sorted_set_range_and_trim() {
        let cache = InMemoryCache::new();
        cache.zadd("z", 30.0, "c").await.unwrap();
        cache.zadd("z", 10.0, "a").await.unwrap();
        cache.zadd("z", 20.0, "b").await.unwrap();
        // re-adding updates the score rather than duplicating
        cache.zadd("z", 5.0, "c").await.unwrap();

        let all = cache
            .zrange_by_score("z", ScoreBound::NegInf, ScoreBound::PosInf)
            .await
            .unwrap();
        assert_eq!(all, vec!["c", "a", "b"]);

        let removed = cache
            .zrem_range_by_score("z", ScoreBound::NegInf, ScoreBound::Inclusive(10.0))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hash_increment_accumulates() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.hincr("h", "bot", 1).await.unwrap(), 1);
        assert_eq!(cache.hincr("h", "bot", 2).await.unwrap(), 3);
        let all = cache.hget_all("h").await.unwrap();
        assert_eq!(all.get("bot").map(String::as_str), Some("3"));
        assert!(cache.hget_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_field_lookup_reads_one_field() {
        let cache = InMemoryCache::new();
        cache
            .hset_fields("h", &[("a", "1".to_string()), ("b", "2".to_string())])
            .await
            .unwrap();
        assert_eq!(cache.hget("h", "b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(cache.hget("h", "c").await.unwrap(), None);
        assert_eq!(cache.hget("missing", "a").await.unwrap(), None);
    }
}
