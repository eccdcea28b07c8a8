use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::palette::Color;

/// Flattened, externally visible view of the canvas: rows of color names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasState {
    pub colors: Vec<Vec<Color>>,
    pub width: u32,
    pub height: u32,
}

impl CanvasState {
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            colors: vec![vec![Color::BACKGROUND; width as usize]; height as usize],
            width,
            height,
        }
    }

    /// Color at `(x, y)`, or `None` when the payload is shorter than its declared size.
    pub fn color_at(&self, x: u32, y: u32) -> Option<Color> {
        self.colors
            .get(y as usize)
            .and_then(|row| row.get(x as usize))
            .copied()
    }
}

/// Memoized [`CanvasState`] guarded by a dirty flag. Starts dirty.
#[derive(Debug)]
pub struct StateCache {
    memo: Option<Arc<CanvasState>>,
    dirty: bool,
    rebuilds: u64,
}

impl StateCache {
    pub fn new() -> Self {
        Self {
            memo: None,
            dirty: true,
            rebuilds: 0,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.memo.is_none()
    }

    pub fn get_or_rebuild<F>(&mut self, build: F) -> Arc<CanvasState>
    where
        F: FnOnce() -> CanvasState,
    {
        match &self.memo {
            Some(memo) if !self.dirty => Arc::clone(memo),
            _ => {
                let state = Arc::new(build());
                self.memo = Some(Arc::clone(&state));
                self.dirty = false;
                self.rebuilds += 1;
                state
            }
        }
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}
