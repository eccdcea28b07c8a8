use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::palette::Color;

pub const HISTORY_CAPACITY: usize = 1000;

/// One successful placement. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub bot_id: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

/// Bounded ring of recent placements, oldest evicted first.
#[derive(Debug, Clone)]
pub struct PlacementHistory {
    entries: VecDeque<PlacementRecord>,
    capacity: usize,
}

impl PlacementHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: PlacementRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    /// Last `limit` records in insertion order.
    pub fn recent(&self, limit: usize) -> Vec<PlacementRecord> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlacementRecord> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for PlacementHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32) -> PlacementRecord {
        PlacementRecord {
            x: n,
            y: 0,
            color: Color::Red,
            bot_id: format!("bot-{n}"),
            timestamp: n as u64,
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut history = PlacementHistory::new(3);
        for n in 0..5 {
            history.push(record(n));
        }
        assert_eq!(history.len(), 3);
        let xs: Vec<u32> = history.iter().map(|r| r.x).collect();
        assert_eq!(xs, vec![2, 3, 4]);
    }

    #[test]
    fn recent_returns_tail_in_insertion_order() {
        let mut history = PlacementHistory::default();
        for n in 0..10 {
            history.push(record(n));
        }
        let xs: Vec<u32> = history.recent(3).iter().map(|r| r.x).collect();
        assert_eq!(xs, vec![7, 8, 9]);
        assert_eq!(history.recent(50).len(), 10);
        assert!(history.recent(0).is_empty());
    }
}
