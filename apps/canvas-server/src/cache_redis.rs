use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::cache::{CacheError, CanvasCache, ScoreBound};

/// Redis-backed [`CanvasCache`]. The connection manager reconnects on its own after
/// transient failures; individual calls still surface their errors.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CanvasCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hset_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), CacheError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async::<_, Option<String>>(&mut conn)
            .await?)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HGETALL")
            .arg(key)
            .query_async::<_, HashMap<String, String>>(&mut conn)
            .await?)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async::<_, i64>(&mut conn)
            .await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min.to_arg())
            .arg(max.to_arg())
            .query_async::<_, Vec<String>>(&mut conn)
            .await?)
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min.to_arg())
            .arg(max.to_arg())
            .query_async::<_, u64>(&mut conn)
            .await?)
    }

    async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZCARD")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }
}
