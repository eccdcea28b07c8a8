use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::palette::Color;

pub const OWNERSHIP_TTL: Duration = Duration::from_secs(15);

/// Exact per-color cell counts, maintained on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorCounts {
    counts: [u64; Color::COUNT],
}

impl ColorCounts {
    /// Every cell starts as background.
    pub fn filled(total: u64) -> Self {
        let mut counts = [0; Color::COUNT];
        counts[Color::BACKGROUND.index()] = total;
        Self { counts }
    }

    pub fn replace(&mut self, old: Color, new: Color) {
        if old == new {
            return;
        }
        let slot = &mut self.counts[old.index()];
        debug_assert!(*slot > 0, "color count underflow for {old}");
        *slot = slot.saturating_sub(1);
        self.counts[new.index()] += 1;
    }

    pub fn get(&self, color: Color) -> u64 {
        self.counts[color.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Colors with at least one cell.
    pub fn to_map(&self) -> BTreeMap<Color, u64> {
        Color::ALL
            .iter()
            .filter(|c| self.counts[c.index()] > 0)
            .map(|c| (*c, self.counts[c.index()]))
            .collect()
    }
}

/// Pixels currently owned per bot, recomputed by a full scan at most once per TTL.
#[derive(Debug)]
pub struct OwnershipCache {
    ttl: Duration,
    cached: Option<(Instant, Arc<BTreeMap<String, u64>>)>,
    rebuilds: u64,
}

impl OwnershipCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: None,
            rebuilds: 0,
        }
    }

    pub fn get_or_rebuild<F>(&mut self, now: Instant, scan: F) -> Arc<BTreeMap<String, u64>>
    where
        F: FnOnce() -> BTreeMap<String, u64>,
    {
        if let Some((built_at, counts)) = &self.cached {
            if now.saturating_duration_since(*built_at) < self.ttl {
                return Arc::clone(counts);
            }
        }
        let counts = Arc::new(scan());
        self.rebuilds += 1;
        self.cached = Some((now, Arc::clone(&counts)));
        counts
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

impl Default for OwnershipCache {
    fn default() -> Self {
        Self::new(OWNERSHIP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_moves_one_cell_between_colors() {
        let mut counts = ColorCounts::filled(9);
        counts.replace(Color::White, Color::Red);
        counts.replace(Color::Red, Color::Blue);
        assert_eq!(counts.get(Color::White), 8);
        assert_eq!(counts.get(Color::Red), 0);
        assert_eq!(counts.get(Color::Blue), 1);
        assert_eq!(counts.total(), 9);
        let map = counts.to_map();
        assert_eq!(map.len(), 2);
        assert!(!map.contains_key(&Color::Red));
    }

    #[test]
    fn ownership_scan_is_reused_within_ttl() {
        let mut cache = OwnershipCache::new(Duration::from_secs(15));
        let start = Instant::now();
        let first = cache.get_or_rebuild(start, || BTreeMap::from([("a".to_string(), 1)]));
        let second = cache.get_or_rebuild(start + Duration::from_secs(14), || {
            BTreeMap::from([("a".to_string(), 2)])
        });
        assert_eq!(first, second);
        assert_eq!(cache.rebuilds(), 1);

        let third = cache.get_or_rebuild(start + Duration::from_secs(15), || {
            BTreeMap::from([("a".to_string(), 3)])
        });
        assert_eq!(third.get("a"), Some(&3));
        assert_eq!(cache.rebuilds(), 2);
    }
}
