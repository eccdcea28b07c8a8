//! Best-effort mirroring of the canvas into the external cache.
//!
//! Two flows per placement: a debounced full-canvas snapshot write, and immediate
//! per-pixel attribution writes. Neither can fail or delay a placement; errors are
//! counted, logged and dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canvas_core::{CanvasState, PlacementRecord, HISTORY_CAPACITY};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheHandle, ScoreBound};
use crate::canvas::SharedGrid;
use crate::log_throttle;
use crate::metrics::{CACHE_ERRORS, SNAPSHOT_FLUSHES};

pub const STATE_KEY: &str = "canvas:state";
pub const RECENT_KEY: &str = "canvas:recent";
pub const ACTIVE_BOTS_KEY: &str = "canvas:active_bots";
pub const BOT_PIXELS_KEY: &str = "canvas:bot_pixels";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
/// How long placements stay in the shared recent feed.
pub const RECENT_WINDOW_MS: u64 = 60 * 60 * 1000;
/// A bot counts as active while its last placement is younger than this.
pub const ACTIVE_WINDOW_MS: u64 = 5 * 60 * 1000;

pub fn pixel_key(x: u32, y: u32) -> String {
    format!("canvas:pixel:{x}:{y}")
}

/// A single delayed job that coalesces triggers: arming while already armed is a no-op.
pub struct SnapshotDebounce {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotDebounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Schedule `job` after the delay unless a job is already pending. Returns whether
    /// a new timer was armed. The job must call [`SnapshotDebounce::fired`] first so
    /// triggers arriving during the write arm a fresh timer.
    pub fn arm<F, Fut>(&self, job: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return false;
        }
        let delay = self.delay;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job().await;
        }));
        true
    }

    /// Mark the pending timer as consumed without cancelling it.
    pub fn fired(&self) {
        self.pending.lock().take();
    }

    /// Cancel the pending timer, if any. Returns whether one was pending.
    pub fn disarm(&self) -> bool {
        match self.pending.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl Drop for SnapshotDebounce {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.get_mut().take() {
            handle.abort();
        }
    }
}

/// Attribution stored next to each pixel in the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PixelMeta {
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub placed_at: Option<u64>,
}

impl PixelMeta {
    fn from_fields(mut fields: HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            owner_id: fields.remove("owner_id"),
            owner_name: fields.remove("owner_name"),
            placed_at: fields.get("placed_at").and_then(|v| v.parse().ok()),
        })
    }
}

/// Outcome of seeding the grid from the cache at startup. `None` means that step failed
/// or found nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub cells: Option<usize>,
    pub history: Option<usize>,
}

#[derive(Clone)]
pub struct CacheMirror {
    inner: Arc<MirrorInner>,
}

struct MirrorInner {
    cache: CacheHandle,
    grid: SharedGrid,
    debounce: SnapshotDebounce,
    snapshot_writes: AtomicU64,
}

impl CacheMirror {
    pub fn new(cache: CacheHandle, grid: SharedGrid, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(MirrorInner {
                cache,
                grid,
                debounce: SnapshotDebounce::new(debounce),
                snapshot_writes: AtomicU64::new(0),
            }),
        }
    }

    /// Called right after a placement was applied in memory. Never blocks.
    pub fn on_placement(&self, record: &PlacementRecord, bot_name: &str) {
        self.schedule_snapshot();
        let mirror = self.clone();
        let record = record.clone();
        let bot_name = bot_name.to_string();
        tokio::spawn(async move {
            mirror.write_placement(&record, &bot_name).await;
        });
    }

    /// Arm the debounced full-canvas write if it is not armed yet.
    pub fn schedule_snapshot(&self) -> bool {
        let mirror = self.clone();
        self.inner.debounce.arm(move || async move {
            mirror.inner.debounce.fired();
            mirror.write_snapshot("debounce").await;
        })
    }

    /// Immediate per-placement writes. Each one is isolated from the others.
    pub async fn write_placement(&self, record: &PlacementRecord, bot_name: &str) {
        let cache = &self.inner.cache;
        let feed_cutoff = record.timestamp.saturating_sub(RECENT_WINDOW_MS) as f64;
        let active_cutoff = record.timestamp.saturating_sub(ACTIVE_WINDOW_MS) as f64;
        let score = record.timestamp as f64;

        let key = pixel_key(record.x, record.y);
        let fields = [
            ("owner_id", record.bot_id.clone()),
            ("owner_name", bot_name.to_string()),
            ("placed_at", record.timestamp.to_string()),
        ];
        let pixel = cache.hset_fields(&key, &fields);
        let counter = cache.hincr(BOT_PIXELS_KEY, &record.bot_id, 1);
        let feed = async {
            let member = serde_json::to_string(record)
                .map_err(|err| CacheError::Backend(err.to_string()))?;
            cache.zadd(RECENT_KEY, score, &member).await?;
            cache
                .zrem_range_by_score(
                    RECENT_KEY,
                    ScoreBound::NegInf,
                    ScoreBound::Inclusive(feed_cutoff),
                )
                .await
        };
        let active = async {
            cache.zadd(ACTIVE_BOTS_KEY, score, &record.bot_id).await?;
            cache
                .zrem_range_by_score(
                    ACTIVE_BOTS_KEY,
                    ScoreBound::NegInf,
                    ScoreBound::Inclusive(active_cutoff),
                )
                .await
        };

        let (pixel, counter, feed, active) = futures::join!(pixel, counter, feed, active);
        note_failure("pixel_meta", pixel);
        note_failure("bot_counter", counter);
        note_failure("recent_feed", feed);
        note_failure("active_bots", active);
    }

    /// Serialize the whole canvas into the cache. Returns whether the write landed.
    pub async fn write_snapshot(&self, trigger: &'static str) -> bool {
        let state = self.inner.grid.lock().state();
        let payload = match serde_json::to_string(state.as_ref()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialize canvas snapshot");
                return false;
            }
        };
        self.inner.snapshot_writes.fetch_add(1, Ordering::Relaxed);
        match self.inner.cache.set(STATE_KEY, &payload).await {
            Ok(()) => {
                SNAPSHOT_FLUSHES.with_label_values(&[trigger]).inc();
                debug!(trigger, bytes = payload.len(), "canvas snapshot mirrored");
                true
            }
            Err(err) => {
                note_failure::<()>("snapshot", Err(err));
                false
            }
        }
    }

    /// Write the pending snapshot now instead of waiting for the timer. Used on shutdown.
    pub async fn flush(&self) -> bool {
        if !self.inner.debounce.disarm() {
            return false;
        }
        self.write_snapshot("flush").await
    }

    /// Drop a pending snapshot without writing it.
    pub fn disarm(&self) -> bool {
        self.inner.debounce.disarm()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.debounce.is_armed()
    }

    /// Number of full-canvas write attempts so far.
    pub fn snapshot_writes(&self) -> u64 {
        self.inner.snapshot_writes.load(Ordering::Relaxed)
    }

    /// Restore cells and recent history from the cache. The two steps are independent.
    pub async fn seed(&self) -> SeedReport {
        let cells = match self.load_snapshot().await {
            Ok(Some(snapshot)) => {
                let copied = self.inner.grid.lock().load_colors(&snapshot);
                info!(
                    copied,
                    cached_width = snapshot.width,
                    cached_height = snapshot.height,
                    "canvas seeded from cache"
                );
                Some(copied)
            }
            Ok(None) => {
                info!("no cached canvas found; starting blank");
                None
            }
            Err(err) => {
                warn!(error = %err, "failed to seed canvas from cache");
                None
            }
        };

        let history = match self.load_recent().await {
            Ok(records) if !records.is_empty() => {
                let count = records.len();
                self.inner.grid.lock().seed_history(records);
                info!(count, "recent placements seeded from cache");
                Some(count)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "failed to seed recent placements from cache");
                None
            }
        };

        SeedReport { cells, history }
    }

    async fn load_snapshot(&self) -> Result<Option<CanvasState>, CacheError> {
        let Some(raw) = self.inner.cache.get(STATE_KEY).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| CacheError::Backend(format!("malformed cached canvas: {err}")))
    }

    async fn load_recent(&self) -> Result<Vec<PlacementRecord>, CacheError> {
        let members = self
            .inner
            .cache
            .zrange_by_score(RECENT_KEY, ScoreBound::NegInf, ScoreBound::PosInf)
            .await?;
        let skip = members.len().saturating_sub(HISTORY_CAPACITY);
        Ok(members
            .iter()
            .skip(skip)
            .filter_map(|m| serde_json::from_str::<PlacementRecord>(m).ok())
            .collect())
    }

    pub async fn pixel_meta(&self, x: u32, y: u32) -> Option<PixelMeta> {
        match self.inner.cache.hget_all(&pixel_key(x, y)).await {
            Ok(fields) => PixelMeta::from_fields(fields),
            Err(err) => {
                note_failure::<()>("pixel_meta_read", Err(err));
                None
            }
        }
    }

    /// Lifetime placements per bot. Only ever incremented.
    pub async fn bot_pixel_count(&self, bot_id: &str) -> Option<i64> {
        match self.inner.cache.hget(BOT_PIXELS_KEY, bot_id).await {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(err) => {
                note_failure::<()>("bot_counter_read", Err(err));
                None
            }
        }
    }

    /// Bots active across every process sharing the cache.
    pub async fn active_bot_count(&self) -> Option<u64> {
        match self.inner.cache.zcard(ACTIVE_BOTS_KEY).await {
            Ok(count) => Some(count),
            Err(err) => {
                note_failure::<()>("active_bots_read", Err(err));
                None
            }
        }
    }
}

fn note_failure<T>(op: &'static str, result: Result<T, CacheError>) {
    if let Err(err) = result {
        CACHE_ERRORS.with_label_values(&[op]).inc();
        if log_throttle::should_log(op) {
            warn!(op, error = %err, "external cache call failed; continuing without it");
        }
    }
}

#[cfg(test)]
mod tests {
    use canvas_core::{Color, GridStore};

    use super::*;
    use crate::cache::test_support::{CountingCache, FailingCache};
    use crate::cache::{CanvasCache, InMemoryCache};

    fn grid(width: u32, height: u32) -> SharedGrid {
        Arc::new(Mutex::new(GridStore::new(width, height)))
    }

    fn place(
        grid: &SharedGrid,
        x: i64,
        y: i64,
        color: Color,
        bot: &str,
        ts: u64,
    ) -> PlacementRecord {
        grid.lock().set(x, y, color, bot, ts).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn placements_within_window_share_one_snapshot_write() {
        let cache = CountingCache::new();
        let grid = grid(4, 4);
        let mirror = CacheMirror::new(cache.clone(), grid.clone(), DEFAULT_DEBOUNCE);

        for n in 0..10 {
            let record = place(&grid, n % 4, n / 4, Color::Red, "bot", n as u64);
            mirror.on_placement(&record, "Bot");
        }
        assert!(mirror.is_armed());
        assert_eq!(cache.sets(STATE_KEY), 0);

        tokio::time::sleep(DEFAULT_DEBOUNCE + Duration::from_millis(10)).await;
        assert_eq!(cache.sets(STATE_KEY), 1);
        assert!(!mirror.is_armed());

        let raw = cache.get(STATE_KEY).await.unwrap().unwrap();
        let state: CanvasState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.colors[0][0], Color::Red);
        assert_eq!(state.colors[2][1], Color::Red);

        // a later placement arms a fresh timer
        let record = place(&grid, 3, 3, Color::Blue, "bot", 99);
        mirror.on_placement(&record, "Bot");
        assert!(mirror.is_armed());
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert_eq!(cache.sets(STATE_KEY), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_pending_snapshot_immediately() {
        let cache = CountingCache::new();
        let grid = grid(2, 2);
        let mirror = CacheMirror::new(cache.clone(), grid.clone(), DEFAULT_DEBOUNCE);

        assert!(!mirror.flush().await);

        let record = place(&grid, 1, 1, Color::Green, "bot", 1);
        mirror.on_placement(&record, "Bot");
        assert!(mirror.flush().await);
        assert!(!mirror.is_armed());
        assert_eq!(cache.sets(STATE_KEY), 1);

        // the cancelled timer must not write again
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert_eq!(cache.sets(STATE_KEY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_drops_pending_snapshot() {
        let cache = CountingCache::new();
        let grid = grid(2, 2);
        let mirror = CacheMirror::new(cache.clone(), grid.clone(), DEFAULT_DEBOUNCE);
        assert!(mirror.schedule_snapshot());
        assert!(!mirror.schedule_snapshot());
        assert!(mirror.disarm());
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert_eq!(cache.sets(STATE_KEY), 0);
    }

    #[tokio::test]
    async fn placement_metadata_is_written_immediately() {
        let cache = InMemoryCache::new();
        let grid = grid(4, 4);
        let mirror = CacheMirror::new(cache.clone(), grid.clone(), DEFAULT_DEBOUNCE);

        let first = place(&grid, 2, 3, Color::Red, "bot-a", 1_000);
        mirror.write_placement(&first, "Alpha").await;
        let second = place(&grid, 2, 3, Color::Blue, "bot-a", 2_000);
        mirror.write_placement(&second, "Alpha").await;
        let third = place(&grid, 0, 0, Color::Blue, "bot-b", 3_000);
        mirror.write_placement(&third, "Beta").await;

        let meta = mirror.pixel_meta(2, 3).await.unwrap();
        assert_eq!(meta.owner_id.as_deref(), Some("bot-a"));
        assert_eq!(meta.owner_name.as_deref(), Some("Alpha"));
        assert_eq!(meta.placed_at, Some(2_000));
        assert_eq!(mirror.pixel_meta(1, 1).await, None);

        assert_eq!(mirror.bot_pixel_count("bot-a").await, Some(2));
        assert_eq!(mirror.bot_pixel_count("bot-b").await, Some(1));
        assert_eq!(mirror.bot_pixel_count("bot-z").await, None);
        assert_eq!(mirror.active_bot_count().await, Some(2));
        assert_eq!(cache.zcard(RECENT_KEY).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn feed_and_active_sets_are_trimmed_by_age() {
        let cache = InMemoryCache::new();
        let grid = grid(4, 4);
        let mirror = CacheMirror::new(cache.clone(), grid.clone(), DEFAULT_DEBOUNCE);

        let old = place(&grid, 0, 0, Color::Red, "old-bot", 1_000);
        mirror.write_placement(&old, "Old").await;
        let later = 1_000 + RECENT_WINDOW_MS + 1;
        let new = place(&grid, 1, 0, Color::Red, "new-bot", later);
        mirror.write_placement(&new, "New").await;

        assert_eq!(cache.zcard(RECENT_KEY).await.unwrap(), 1);
        assert_eq!(mirror.active_bot_count().await, Some(1));
    }

    #[tokio::test]
    async fn seed_restores_cells_and_history() {
        let cache = InMemoryCache::new();
        let mut cached = CanvasState::blank(5, 2);
        cached.colors[0][0] = Color::Red;
        cached.colors[1][2] = Color::Blue;
        cache
            .set(STATE_KEY, &serde_json::to_string(&cached).unwrap())
            .await
            .unwrap();
        for ts in [30u64, 10, 20] {
            let record = PlacementRecord {
                x: 0,
                y: 0,
                color: Color::Red,
                bot_id: format!("bot-{ts}"),
                timestamp: ts,
            };
            cache
                .zadd(RECENT_KEY, ts as f64, &serde_json::to_string(&record).unwrap())
                .await
                .unwrap();
        }

        let grid = grid(3, 3);
        let mirror = CacheMirror::new(cache, grid.clone(), DEFAULT_DEBOUNCE);
        let report = mirror.seed().await;
        assert_eq!(
            report,
            SeedReport {
                cells: Some(6),
                history: Some(3)
            }
        );

        let guard = grid.lock();
        assert_eq!(guard.get(0, 0).unwrap().color, Color::Red);
        assert_eq!(guard.get(2, 1).unwrap().color, Color::Blue);
        let order: Vec<u64> = guard
            .recent_placements(10)
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn malformed_snapshot_does_not_block_history_seed() {
        let cache = InMemoryCache::new();
        cache.set(STATE_KEY, "{not json").await.unwrap();
        let record = PlacementRecord {
            x: 1,
            y: 1,
            color: Color::Pink,
            bot_id: "bot".into(),
            timestamp: 5,
        };
        cache
            .zadd(RECENT_KEY, 5.0, &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();

        let grid = grid(3, 3);
        let mirror = CacheMirror::new(cache, grid.clone(), DEFAULT_DEBOUNCE);
        let report = mirror.seed().await;
        assert_eq!(report.cells, None);
        assert_eq!(report.history, Some(1));
        assert_eq!(grid.lock().color_counts().get(Color::White), 9);
    }

    #[tokio::test]
    async fn unreachable_cache_is_tolerated_everywhere() {
        let grid = grid(3, 3);
        let mirror = CacheMirror::new(FailingCache::new(), grid.clone(), DEFAULT_DEBOUNCE);

        assert_eq!(mirror.seed().await, SeedReport::default());
        let record = place(&grid, 1, 1, Color::Red, "bot", 1);
        mirror.write_placement(&record, "Bot").await;
        assert!(!mirror.write_snapshot("test").await);
        assert_eq!(mirror.snapshot_writes(), 1);
        assert_eq!(mirror.pixel_meta(1, 1).await, None);
        assert_eq!(mirror.active_bot_count().await, None);
    }
}
