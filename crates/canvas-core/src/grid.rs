use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::error::CanvasError;
use crate::history::{PlacementHistory, PlacementRecord, HISTORY_CAPACITY};
use crate::palette::Color;
use crate::state::{CanvasState, StateCache};
use crate::stats::{ColorCounts, OwnershipCache};

/// Current color and attribution of one grid position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub color: Color,
    pub owner_id: Option<String>,
    pub placed_at: Option<u64>,
}

/// Owns every cell of the canvas plus the derived views kept in step with it.
///
/// All mutation goes through [`GridStore::set`], [`GridStore::reset`] and
/// [`GridStore::load_colors`]; each one keeps the color counters exact and marks the
/// serialized state dirty before returning.
#[derive(Debug)]
pub struct GridStore {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
    history: PlacementHistory,
    color_counts: ColorCounts,
    ownership: OwnershipCache,
    state: StateCache,
}

impl GridStore {
    pub fn new(width: u32, height: u32) -> Self {
        let total = width as usize * height as usize;
        Self {
            width,
            height,
            cells: vec![Cell::default(); total],
            history: PlacementHistory::new(HISTORY_CAPACITY),
            color_counts: ColorCounts::filled(total as u64),
            ownership: OwnershipCache::default(),
            state: StateCache::new(),
        }
    }

    /// Same as [`GridStore::new`] but with a custom ownership cache, mostly for tests
    /// that need a specific TTL.
    pub fn with_ownership_cache(width: u32, height: u32, ownership: OwnershipCache) -> Self {
        Self {
            ownership,
            ..Self::new(width, height)
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn index(&self, x: i64, y: i64) -> Result<usize, CanvasError> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return Err(CanvasError::InvalidCoordinate { x, y });
        }
        Ok(y as usize * self.width as usize + x as usize)
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        self.index(x, y).is_ok()
    }

    pub fn get(&self, x: i64, y: i64) -> Result<&Cell, CanvasError> {
        let idx = self.index(x, y)?;
        Ok(&self.cells[idx])
    }

    /// Overwrite a cell and record the placement.
    pub fn set(
        &mut self,
        x: i64,
        y: i64,
        color: Color,
        owner_id: &str,
        timestamp: u64,
    ) -> Result<PlacementRecord, CanvasError> {
        let idx = self.index(x, y)?;
        let previous = std::mem::replace(
            &mut self.cells[idx],
            Cell {
                color,
                owner_id: Some(owner_id.to_string()),
                placed_at: Some(timestamp),
            },
        );
        self.color_counts.replace(previous.color, color);
        self.state.mark_dirty();

        let record = PlacementRecord {
            x: x as u32,
            y: y as u32,
            color,
            bot_id: owner_id.to_string(),
            timestamp,
        };
        self.history.push(record.clone());
        Ok(record)
    }

    /// `w × h` block of colors anchored at `(x, y)`. Positions outside the canvas are
    /// filled with the background color.
    pub fn region(&self, x: i64, y: i64, w: u32, h: u32) -> Vec<Vec<Color>> {
        (0..h as i64)
            .map(|dy| {
                (0..w as i64)
                    .map(|dx| {
                        self.index(x.saturating_add(dx), y.saturating_add(dy))
                            .map(|idx| self.cells[idx].color)
                            .unwrap_or(Color::BACKGROUND)
                    })
                    .collect()
            })
            .collect()
    }

    pub fn recent_placements(&self, limit: usize) -> Vec<PlacementRecord> {
        self.history.recent(limit)
    }

    /// Distinct bots with a placement at or after `since` (ms) in the recent history.
    pub fn active_bots(&self, since: u64) -> usize {
        self.history
            .iter()
            .filter(|r| r.timestamp >= since)
            .map(|r| r.bot_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn color_counts(&self) -> &ColorCounts {
        &self.color_counts
    }

    pub fn pixel_ownership(&mut self) -> Arc<BTreeMap<String, u64>> {
        self.pixel_ownership_at(Instant::now())
    }

    pub fn pixel_ownership_at(&mut self, now: Instant) -> Arc<BTreeMap<String, u64>> {
        let cells = &self.cells;
        self.ownership.get_or_rebuild(now, || {
            let mut counts = BTreeMap::new();
            for owner in cells.iter().filter_map(|c| c.owner_id.as_ref()) {
                *counts.entry(owner.clone()).or_insert(0) += 1;
            }
            counts
        })
    }

    pub fn ownership_rebuilds(&self) -> u64 {
        self.ownership.rebuilds()
    }

    pub fn state(&mut self) -> Arc<CanvasState> {
        let (width, height, cells) = (self.width, self.height, &self.cells);
        self.state.get_or_rebuild(|| CanvasState {
            colors: cells
                .chunks(width.max(1) as usize)
                .map(|row| row.iter().map(|c| c.color).collect())
                .collect(),
            width,
            height,
        })
    }

    pub fn state_rebuilds(&self) -> u64 {
        self.state.rebuilds()
    }

    pub fn is_state_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    /// Clear every cell to background and drop the history.
    pub fn reset(&mut self) {
        self.cells.fill(Cell::default());
        self.history.clear();
        self.color_counts = ColorCounts::filled(self.cells.len() as u64);
        self.ownership.invalidate();
        self.state.mark_dirty();
    }

    /// Copy colors from a previously serialized canvas. Only the overlapping
    /// `min(width) × min(height)` area is copied, so a snapshot taken at a different
    /// size still loads. Attribution of copied cells is unknown and left empty.
    pub fn load_colors(&mut self, snapshot: &CanvasState) -> usize {
        let width = self.width.min(snapshot.width);
        let height = self.height.min(snapshot.height);
        let mut copied = 0;
        for y in 0..height {
            for x in 0..width {
                let Some(color) = snapshot.color_at(x, y) else {
                    continue;
                };
                let idx = y as usize * self.width as usize + x as usize;
                let cell = &mut self.cells[idx];
                self.color_counts.replace(cell.color, color);
                *cell = Cell {
                    color,
                    owner_id: None,
                    placed_at: None,
                };
                copied += 1;
            }
        }
        self.ownership.invalidate();
        self.state.mark_dirty();
        copied
    }

    /// Replace the recent history with previously recorded placements (oldest first).
    pub fn seed_history<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = PlacementRecord>,
    {
        self.history.clear();
        for record in records {
            self.history.push(record);
        }
    }
}
