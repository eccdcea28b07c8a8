//! Wall-clock driven archive cycle.
//!
//! The first boundary is the next configured UTC hour. After each firing the next
//! boundary is the previous one plus the cycle length, never re-aligned to the clock, so
//! a late firing shifts nothing and a missed boundary fires as soon as the loop runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::archive::{ArchiveError, ArchiveMeta, ArchiveStore};
use crate::canvas::{now_millis, CanvasService};

/// First instant at `hour:00:00` UTC strictly after `now`.
pub fn next_daily_boundary(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let candidate = Utc.from_utc_datetime(&now.date_naive().and_time(time));
    if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    }
}

pub struct SnapshotScheduler {
    canvas: CanvasService,
    archives: Arc<ArchiveStore>,
    cycle_ms: u64,
    reset_on_snapshot: bool,
    next_ms: Mutex<u64>,
}

impl SnapshotScheduler {
    pub fn new(
        canvas: CanvasService,
        archives: Arc<ArchiveStore>,
        first_ms: u64,
        cycle: Duration,
        reset_on_snapshot: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            canvas,
            archives,
            cycle_ms: (cycle.as_millis() as u64).max(1),
            reset_on_snapshot,
            next_ms: Mutex::new(first_ms),
        })
    }

    /// Boundary the loop is currently waiting for, in unix milliseconds.
    pub fn next_snapshot_time(&self) -> u64 {
        *self.next_ms.lock()
    }

    /// Move the next boundary forward by one cycle and return it.
    pub fn advance(&self) -> u64 {
        let mut next = self.next_ms.lock();
        *next = next.saturating_add(self.cycle_ms);
        *next
    }

    /// Archive the current canvas as of `now_ms`. The canvas is reset only when the
    /// archive landed somewhere, so a failed cycle keeps the art on screen. Firings that
    /// share a millisecond still produce separate archives.
    pub async fn snapshot_once(&self, now_ms: u64) -> Result<ArchiveMeta, ArchiveError> {
        let state = self.canvas.state();
        let meta = self.archives.next_meta(now_ms);
        let backend = self.archives.persist(&meta, &state).await?;
        info!(archive_id = %meta.id, backend, "canvas archived");
        if self.reset_on_snapshot {
            self.canvas.reset();
        }
        Ok(meta)
    }

    /// Run the cycle on a background task until the handle is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(
                next_snapshot = scheduler.next_snapshot_time(),
                cycle_ms = scheduler.cycle_ms,
                "snapshot scheduler started"
            );
            loop {
                let wait = scheduler.next_snapshot_time().saturating_sub(now_millis());
                tokio::time::sleep(Duration::from_millis(wait)).await;
                if let Err(err) = scheduler.snapshot_once(now_millis()).await {
                    error!(error = %err, "canvas archive lost for this cycle");
                }
                let next = scheduler.advance();
                info!(next_snapshot = next, "snapshot scheduler re-armed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use canvas_core::Color;

    use super::*;
    use crate::archive::InMemoryArchiveBackend;
    use crate::mirror::DEFAULT_DEBOUNCE;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn fixture() -> (CanvasService, Arc<InMemoryArchiveBackend>, Arc<ArchiveStore>) {
        let canvas = CanvasService::new(4, 4, None, DEFAULT_DEBOUNCE);
        let backend = InMemoryArchiveBackend::new("mem");
        let store = Arc::new(ArchiveStore::new(vec![backend.clone()]));
        (canvas, backend, store)
    }

    #[test]
    fn boundary_is_strictly_after_now() {
        assert_eq!(
            next_daily_boundary(utc("2024-03-01T10:15:00Z"), 0),
            utc("2024-03-02T00:00:00Z")
        );
        assert_eq!(
            next_daily_boundary(utc("2024-03-01T10:15:00Z"), 12),
            utc("2024-03-01T12:00:00Z")
        );
        assert_eq!(
            next_daily_boundary(utc("2024-03-01T00:00:00Z"), 0),
            utc("2024-03-02T00:00:00Z")
        );
        assert_eq!(
            next_daily_boundary(utc("2024-12-31T23:30:00Z"), 0),
            utc("2025-01-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn snapshot_archives_painted_cells_and_resets() {
        let (canvas, _backend, store) = fixture();
        let painted = [(0, 0), (1, 0), (2, 1), (3, 3), (0, 2)];
        for (x, y) in painted {
            canvas.place_pixel(x, y, Color::Red, "bot", "bot").unwrap();
        }
        let scheduler =
            SnapshotScheduler::new(canvas.clone(), store.clone(), 0, Duration::from_secs(60), true);

        let fired_at = 1_700_000_000_000;
        let meta = scheduler.snapshot_once(fired_at).await.unwrap();

        let listing = store.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0], meta);
        assert_eq!(listing[0].timestamp, fired_at);

        let archived = store.fetch(&meta.id).await.unwrap();
        for y in 0..4u32 {
            for x in 0..4u32 {
                let expected = if painted.contains(&(x as i64, y as i64)) {
                    Color::Red
                } else {
                    Color::White
                };
                assert_eq!(archived.color_at(x, y), Some(expected));
            }
        }
        assert_eq!(canvas.color_counts().get(&Color::White), Some(&16));
    }

    #[tokio::test]
    async fn failed_archive_keeps_canvas_and_index() {
        let (canvas, backend, store) = fixture();
        canvas.place_pixel(1, 1, Color::Blue, "bot", "bot").unwrap();
        backend.set_failing(true);
        let scheduler =
            SnapshotScheduler::new(canvas.clone(), store.clone(), 0, Duration::from_secs(60), true);

        assert!(scheduler.snapshot_once(5).await.is_err());
        assert!(store.list().is_empty());
        assert_eq!(canvas.state().color_at(1, 1), Some(Color::Blue));
    }

    #[tokio::test]
    async fn same_millisecond_firings_keep_both_archives() {
        let (canvas, backend, store) = fixture();
        canvas.place_pixel(0, 0, Color::Red, "bot", "bot").unwrap();
        let scheduler =
            SnapshotScheduler::new(canvas.clone(), store.clone(), 0, Duration::from_secs(60), true);

        let painted = scheduler.snapshot_once(1_000).await.unwrap();
        let blank = scheduler.snapshot_once(1_000).await.unwrap();

        assert_eq!(painted.id, "canvas-1000");
        assert_eq!(blank.id, "canvas-1001");
        assert_eq!(backend.len().await, 2);
        assert_eq!(store.list(), vec![blank.clone(), painted.clone()]);
        let first = store.fetch(&painted.id).await.unwrap();
        assert_eq!(first.color_at(0, 0), Some(Color::Red));
        let second = store.fetch(&blank.id).await.unwrap();
        assert_eq!(second.color_at(0, 0), Some(Color::White));
    }

    #[tokio::test]
    async fn reset_can_be_disabled() {
        let (canvas, _backend, store) = fixture();
        canvas.place_pixel(0, 0, Color::Lime, "bot", "bot").unwrap();
        let scheduler =
            SnapshotScheduler::new(canvas.clone(), store, 0, Duration::from_secs(60), false);
        scheduler.snapshot_once(9).await.unwrap();
        assert_eq!(canvas.state().color_at(0, 0), Some(Color::Lime));
    }

    #[test]
    fn advance_adds_cycle_without_realigning() {
        let canvas = CanvasService::new(1, 1, None, DEFAULT_DEBOUNCE);
        let store = Arc::new(ArchiveStore::new(Vec::new()));
        let scheduler =
            SnapshotScheduler::new(canvas, store, 1_003, Duration::from_millis(1_000), true);
        assert_eq!(scheduler.next_snapshot_time(), 1_003);
        assert_eq!(scheduler.advance(), 2_003);
        assert_eq!(scheduler.advance(), 3_003);
        assert_eq!(scheduler.next_snapshot_time(), 3_003);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_fires_and_rearms() {
        let (canvas, backend, store) = fixture();
        canvas.place_pixel(2, 2, Color::Pink, "bot", "bot").unwrap();
        let first = now_millis() + 1_000;
        let cycle = Duration::from_secs(3_600);
        let scheduler = SnapshotScheduler::new(canvas.clone(), store.clone(), first, cycle, true);

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(backend.len().await, 1);
        assert_eq!(store.list().len(), 1);
        assert_eq!(scheduler.next_snapshot_time(), first + 3_600_000);
        assert_eq!(canvas.state().color_at(2, 2), Some(Color::White));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_moves_on_after_failed_cycle() {
        let (canvas, backend, store) = fixture();
        canvas.place_pixel(3, 0, Color::Green, "bot", "bot").unwrap();
        backend.set_failing(true);
        let first = now_millis() + 1_000;
        let cycle = Duration::from_secs(3_600);
        let scheduler = SnapshotScheduler::new(canvas.clone(), store.clone(), first, cycle, true);

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(backend.put_attempts(), 1);
        assert!(store.list().is_empty());
        assert_eq!(scheduler.next_snapshot_time(), first + 3_600_000);
        assert_eq!(canvas.state().color_at(3, 0), Some(Color::Green));
        handle.abort();
    }
}
