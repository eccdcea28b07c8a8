use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::info;

use crate::archive::{build_archive_store, ArchiveStore};
use crate::bots::BotRegistry;
use crate::cache::build_cache;
use crate::canvas::CanvasService;
use crate::config::AppConfig;
use crate::scheduler::{next_daily_boundary, SnapshotScheduler};

/// Everything a handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub canvas: CanvasService,
    pub archives: Arc<ArchiveStore>,
    pub scheduler: Arc<SnapshotScheduler>,
    pub bots: Arc<BotRegistry>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        canvas: CanvasService,
        archives: Arc<ArchiveStore>,
        scheduler: Arc<SnapshotScheduler>,
        bots: Arc<BotRegistry>,
    ) -> Self {
        Self {
            canvas,
            archives,
            scheduler,
            bots,
            started_at: Instant::now(),
        }
    }

    /// Wire up every collaborator named by the config. External stores that are not
    /// configured or not reachable are left out; nothing here fails startup.
    pub async fn from_config(cfg: &AppConfig) -> Self {
        let cache = build_cache(cfg.redis_url.as_deref()).await;
        let canvas = CanvasService::new(
            cfg.canvas_width,
            cfg.canvas_height,
            cache,
            cfg.snapshot_debounce(),
        );
        let archives = Arc::new(build_archive_store(cfg).await);
        let first = next_daily_boundary(Utc::now(), cfg.snapshot_hour_utc);
        let scheduler = SnapshotScheduler::new(
            canvas.clone(),
            archives.clone(),
            first.timestamp_millis().max(0) as u64,
            cfg.snapshot_cycle(),
            cfg.reset_on_snapshot,
        );
        info!(
            width = cfg.canvas_width,
            height = cfg.canvas_height,
            cache = canvas.mirror().is_some(),
            archive_backends = ?archives.backend_names(),
            first_snapshot = %first,
            "canvas state assembled"
        );
        Self::new(
            canvas,
            archives,
            scheduler,
            Arc::new(BotRegistry::new(cfg.cooldown())),
        )
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
