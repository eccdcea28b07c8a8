//! The canvas context object handed to every handler.
//!
//! The grid lives behind a `parking_lot::Mutex` and the lock is never held across an
//! `.await`, so a placement is applied in memory before anything external is touched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use canvas_core::{CanvasError, CanvasState, Color, GridStore, PlacementRecord};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::CacheHandle;
use crate::metrics::PLACEMENTS;
use crate::mirror::{CacheMirror, SeedReport, ACTIVE_WINDOW_MS};

pub type SharedGrid = Arc<Mutex<GridStore>>;

const EVENT_BUFFER: usize = 1024;

/// What spectators receive on the live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasEvent {
    Placement {
        #[serde(flatten)]
        record: PlacementRecord,
        bot_name: String,
    },
    Reset {
        timestamp: u64,
    },
}

/// Current color of one pixel plus whatever attribution is known for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PixelInfo {
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub placed_at: Option<u64>,
}

#[derive(Clone)]
pub struct CanvasService {
    grid: SharedGrid,
    mirror: Option<CacheMirror>,
    events: broadcast::Sender<CanvasEvent>,
}

impl CanvasService {
    pub fn new(width: u32, height: u32, cache: Option<CacheHandle>, debounce: Duration) -> Self {
        let grid: SharedGrid = Arc::new(Mutex::new(GridStore::new(width, height)));
        let mirror = cache.map(|cache| CacheMirror::new(cache, grid.clone(), debounce));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            grid,
            mirror,
            events,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let grid = self.grid.lock();
        (grid.width(), grid.height())
    }

    pub fn mirror(&self) -> Option<&CacheMirror> {
        self.mirror.as_ref()
    }

    /// Apply a placement. Validation, auth and cooldown are the caller's job; the grid
    /// still range-checks the coordinates. Spectators hear about it only after the
    /// write, and the cache mirror runs in the background.
    pub fn place_pixel(
        &self,
        x: i64,
        y: i64,
        color: Color,
        bot_id: &str,
        bot_name: &str,
    ) -> Result<PlacementRecord, CanvasError> {
        let record = self.grid.lock().set(x, y, color, bot_id, now_millis())?;
        PLACEMENTS.inc();
        debug!(x = record.x, y = record.y, color = %color, bot_id, "pixel placed");

        // No receivers just means nobody is watching.
        let _ = self.events.send(CanvasEvent::Placement {
            record: record.clone(),
            bot_name: bot_name.to_string(),
        });
        if let Some(mirror) = &self.mirror {
            mirror.on_placement(&record, bot_name);
        }
        Ok(record)
    }

    pub fn state(&self) -> Arc<CanvasState> {
        self.grid.lock().state()
    }

    pub fn region(&self, x: i64, y: i64, w: u32, h: u32) -> Vec<Vec<Color>> {
        self.grid.lock().region(x, y, w, h)
    }

    pub fn recent_placements(&self, limit: usize) -> Vec<PlacementRecord> {
        self.grid.lock().recent_placements(limit)
    }

    pub fn color_counts(&self) -> BTreeMap<Color, u64> {
        self.grid.lock().color_counts().to_map()
    }

    pub fn pixel_ownership(&self) -> Arc<BTreeMap<String, u64>> {
        self.grid.lock().pixel_ownership()
    }

    /// Bots seen in local history within the active window.
    pub fn active_bots(&self) -> usize {
        let since = now_millis().saturating_sub(ACTIVE_WINDOW_MS);
        self.grid.lock().active_bots(since)
    }

    /// Pixel color with attribution. Cells seeded from a colors-only snapshot carry no
    /// owner locally, so the cache's attribution hash fills the gap when available.
    pub async fn pixel_info(&self, x: i64, y: i64) -> Result<PixelInfo, CanvasError> {
        let cell = self.grid.lock().get(x, y)?.clone();
        let (x, y) = (x as u32, y as u32);
        let mut info = PixelInfo {
            x,
            y,
            color: cell.color,
            owner_id: cell.owner_id,
            owner_name: None,
            placed_at: cell.placed_at,
        };
        if let Some(mirror) = &self.mirror {
            if let Some(meta) = mirror.pixel_meta(x, y).await {
                // Only trust the cache when it agrees with local attribution.
                if info.owner_id.is_none() || info.owner_id == meta.owner_id {
                    info.owner_id = meta.owner_id;
                    info.owner_name = meta.owner_name;
                    info.placed_at = info.placed_at.or(meta.placed_at);
                }
            }
        }
        Ok(info)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CanvasEvent> {
        self.events.subscribe()
    }

    /// Clear the canvas. A pending debounced write is dropped and the blank canvas is
    /// mirrored right away so other processes do not reseed the old one.
    pub fn reset(&self) {
        self.grid.lock().reset();
        info!("canvas reset");
        let _ = self.events.send(CanvasEvent::Reset {
            timestamp: now_millis(),
        });
        if let Some(mirror) = &self.mirror {
            mirror.disarm();
            let mirror = mirror.clone();
            tokio::spawn(async move {
                mirror.write_snapshot("reset").await;
            });
        }
    }

    pub async fn seed_from_cache(&self) -> SeedReport {
        match &self.mirror {
            Some(mirror) => mirror.seed().await,
            None => SeedReport::default(),
        }
    }

    /// Best-effort final snapshot write on graceful shutdown.
    pub async fn shutdown(&self) {
        if let Some(mirror) = &self.mirror {
            if mirror.flush().await {
                info!("pending canvas snapshot flushed on shutdown");
            }
        }
    }
}

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{CountingCache, FailingCache};
    use crate::cache::{CanvasCache, InMemoryCache};
    use crate::mirror::{pixel_key, DEFAULT_DEBOUNCE, STATE_KEY};

    fn service(width: u32, height: u32) -> CanvasService {
        CanvasService::new(width, height, None, DEFAULT_DEBOUNCE)
    }

    #[tokio::test]
    async fn placements_survive_an_unreachable_cache() {
        let cache = FailingCache::new();
        let canvas = CanvasService::new(5, 5, Some(cache.clone()), DEFAULT_DEBOUNCE);

        for n in 0..10i64 {
            let record = canvas
                .place_pixel(n % 5, n / 5, Color::Red, "bot-1", "Bot One")
                .unwrap();
            assert_eq!(record.color, Color::Red);
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let state = canvas.state();
        for n in 0..10u32 {
            assert_eq!(state.color_at(n % 5, n / 5), Some(Color::Red));
        }
        assert_eq!(canvas.color_counts().get(&Color::Red), Some(&10));
        assert_eq!(canvas.recent_placements(100).len(), 10);
        assert!(cache.was_called());
        canvas.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_out_of_range_and_keeps_state() {
        let canvas = service(3, 3);
        let err = canvas
            .place_pixel(3, 0, Color::Blue, "bot", "bot")
            .unwrap_err();
        assert!(matches!(err, CanvasError::InvalidCoordinate { x: 3, y: 0 }));
        assert_eq!(canvas.color_counts().get(&Color::White), Some(&9));
        assert!(canvas.pixel_info(-1, 0).await.is_err());
    }

    #[tokio::test]
    async fn broadcast_follows_the_write() {
        let canvas = service(3, 3);
        let mut rx = canvas.subscribe();
        canvas
            .place_pixel(1, 2, Color::Green, "bot-9", "Ninth")
            .unwrap();

        match rx.recv().await.unwrap() {
            CanvasEvent::Placement { record, bot_name } => {
                assert_eq!((record.x, record.y), (1, 2));
                assert_eq!(bot_name, "Ninth");
                assert_eq!(canvas.state().color_at(1, 2), Some(Color::Green));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn pixel_info_falls_back_to_cached_attribution() {
        let cache = InMemoryCache::new();
        let seeded = CanvasState {
            colors: vec![vec![Color::Black, Color::White]],
            width: 2,
            height: 1,
        };
        cache
            .set(STATE_KEY, &serde_json::to_string(&seeded).unwrap())
            .await
            .unwrap();
        cache
            .hset_fields(
                &pixel_key(0, 0),
                &[
                    ("owner_id", "bot-a".to_string()),
                    ("owner_name", "Alpha".to_string()),
                    ("placed_at", "42".to_string()),
                ],
            )
            .await
            .unwrap();

        let canvas = CanvasService::new(2, 1, Some(cache), DEFAULT_DEBOUNCE);
        let report = canvas.seed_from_cache().await;
        assert_eq!(report.cells, Some(2));

        let info = canvas.pixel_info(0, 0).await.unwrap();
        assert_eq!(info.color, Color::Black);
        assert_eq!(info.owner_id.as_deref(), Some("bot-a"));
        assert_eq!(info.owner_name.as_deref(), Some("Alpha"));
        assert_eq!(info.placed_at, Some(42));

        let blank = canvas.pixel_info(1, 0).await.unwrap();
        assert_eq!(blank.owner_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_drops_pending_snapshot_and_mirrors_blank_canvas() {
        let cache = CountingCache::new();
        let canvas = CanvasService::new(2, 2, Some(cache.clone()), DEFAULT_DEBOUNCE);
        let mut rx = canvas.subscribe();

        canvas.place_pixel(0, 0, Color::Red, "bot", "bot").unwrap();
        assert!(canvas.mirror().unwrap().is_armed());

        canvas.reset();
        assert!(!canvas.mirror().unwrap().is_armed());
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;

        assert_eq!(cache.sets(STATE_KEY), 1);
        assert_eq!(canvas.color_counts().get(&Color::White), Some(&4));
        assert!(canvas.recent_placements(10).is_empty());
        assert!(matches!(rx.recv().await, Ok(CanvasEvent::Placement { .. })));
        assert!(matches!(rx.recv().await, Ok(CanvasEvent::Reset { .. })));
    }

    #[tokio::test]
    async fn without_cache_seed_and_shutdown_are_noops() {
        let canvas = service(2, 2);
        assert_eq!(canvas.seed_from_cache().await, SeedReport::default());
        canvas.shutdown().await;
        assert_eq!(canvas.dimensions(), (2, 2));
    }
}
