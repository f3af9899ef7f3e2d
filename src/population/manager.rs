//! Zone population manager
//!
//! Keeps `ZonePopulation` records in a concurrent map. Bot counts only change
//! through `add_bot_to_zone` / `remove_bot_from_zone`, which also maintain a
//! bot-to-zone index so both calls are idempotent.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::PopulationConfig;
use crate::spawn::request::{BotId, MapId, ZoneId};
use crate::util::SharedClock;

/// Zone facts reported by the world host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub zone_id: ZoneId,
    pub map_id: MapId,
    pub human_count: u32,
    pub min_level: u8,
    pub max_level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZonePopulation {
    pub zone_id: ZoneId,
    pub map_id: MapId,
    pub human_count: u32,
    pub bot_count: u32,
    pub target_bot_count: u32,
    pub min_level: u8,
    pub max_level: u8,
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

impl ZonePopulation {
    fn empty(zone_id: ZoneId, map_id: MapId) -> Self {
        Self {
            zone_id,
            map_id,
            human_count: 0,
            bot_count: 0,
            target_bot_count: 0,
            min_level: 1,
            max_level: 1,
            last_update: None,
        }
    }

    /// Bots still needed to reach the target
    pub fn deficit(&self) -> u32 {
        self.target_bot_count.saturating_sub(self.bot_count)
    }

    /// Bots above the target
    pub fn surplus(&self) -> u32 {
        self.bot_count.saturating_sub(self.target_bot_count)
    }
}

pub struct PopulationManager {
    config: PopulationConfig,
    clock: SharedClock,
    zones: DashMap<ZoneId, ZonePopulation>,
    bot_zones: DashMap<BotId, ZoneId>,
    /// Snapshot of `zones` for hot-path readers
    cache: Mutex<Option<(Instant, Vec<ZonePopulation>)>>,
    last_prune: Mutex<Option<Instant>>,
}

impl PopulationManager {
    pub fn new(config: PopulationConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            zones: DashMap::new(),
            bot_zones: DashMap::new(),
            cache: Mutex::new(None),
            last_prune: Mutex::new(None),
        }
    }

    /// Record a bound bot. Returns false if it was already counted there.
    pub fn add_bot_to_zone(&self, zone_id: ZoneId, map_id: MapId, bot_id: BotId) -> bool {
        if let Some(previous) = self.bot_zones.insert(bot_id, zone_id) {
            if previous == zone_id {
                return false;
            }
            if let Some(mut zone) = self.zones.get_mut(&previous) {
                zone.bot_count = zone.bot_count.saturating_sub(1);
            }
        }

        let now = self.clock.now();
        let mut zone = self
            .zones
            .entry(zone_id)
            .or_insert_with(|| ZonePopulation::empty(zone_id, map_id));
        zone.bot_count += 1;
        zone.last_update = Some(now);
        drop(zone);

        self.invalidate();
        true
    }

    /// Forget a bot. Returns false if it was not counted in `zone_id`.
    pub fn remove_bot_from_zone(&self, zone_id: ZoneId, bot_id: BotId) -> bool {
        let removed = self
            .bot_zones
            .remove_if(&bot_id, |_, zone| *zone == zone_id)
            .is_some();
        if !removed {
            return false;
        }

        if let Some(mut zone) = self.zones.get_mut(&zone_id) {
            zone.bot_count = zone.bot_count.saturating_sub(1);
            zone.last_update = Some(self.clock.now());
        }
        self.invalidate();
        true
    }

    /// Refresh a zone's human count and level band
    pub fn update_zone(&self, info: ZoneInfo) {
        let now = self.clock.now();
        let mut zone = self
            .zones
            .entry(info.zone_id)
            .or_insert_with(|| ZonePopulation::empty(info.zone_id, info.map_id));
        zone.map_id = info.map_id;
        zone.human_count = info.human_count;
        zone.min_level = info.min_level.min(info.max_level);
        zone.max_level = info.max_level.max(info.min_level);
        zone.last_update = Some(now);
        drop(zone);
        self.invalidate();
    }

    /// Set the human count of a known zone
    pub fn set_human_count(&self, zone_id: ZoneId, human_count: u32) -> bool {
        let updated = match self.zones.get_mut(&zone_id) {
            Some(mut zone) => {
                zone.human_count = human_count;
                zone.last_update = Some(self.clock.now());
                true
            }
            None => false,
        };
        if updated {
            self.invalidate();
        }
        updated
    }

    /// Recompute every zone's target: `round(humans * ratio)` capped per
    /// zone, then capped globally in zone id order.
    pub fn calculate_zone_targets(&self, ratio: f64, max_per_zone: u32, max_total: u32) {
        let mut zone_ids: Vec<ZoneId> = self.zones.iter().map(|z| *z.key()).collect();
        zone_ids.sort_unstable();

        let ratio = ratio.max(0.0);
        let mut remaining = max_total;
        for zone_id in zone_ids {
            if let Some(mut zone) = self.zones.get_mut(&zone_id) {
                let wanted = if zone.human_count == 0 {
                    0
                } else {
                    let raw = (zone.human_count as f64 * ratio).round();
                    (raw.min(u32::MAX as f64) as u32).min(max_per_zone)
                };
                let target = wanted.min(remaining);
                remaining -= target;
                zone.target_bot_count = target;
            }
        }
        self.invalidate();
    }

    /// Zones below target, largest deficit first
    pub fn underpopulated(&self) -> Vec<ZonePopulation> {
        let mut zones: Vec<ZonePopulation> = self
            .get_all()
            .into_iter()
            .filter(|z| z.bot_count < z.target_bot_count)
            .collect();
        zones.sort_by(|a, b| b.deficit().cmp(&a.deficit()).then(a.zone_id.cmp(&b.zone_id)));
        zones
    }

    /// Zones above target, largest surplus first
    pub fn overpopulated(&self) -> Vec<ZonePopulation> {
        let mut zones: Vec<ZonePopulation> = self
            .get_all()
            .into_iter()
            .filter(|z| z.bot_count > z.target_bot_count)
            .collect();
        zones.sort_by(|a, b| b.surplus().cmp(&a.surplus()).then(a.zone_id.cmp(&b.zone_id)));
        zones
    }

    pub fn get_population(&self, zone_id: ZoneId) -> Option<ZonePopulation> {
        self.zones.get(&zone_id).map(|z| z.clone())
    }

    /// All zones ordered by id, served from the read cache when fresh
    pub fn get_all(&self) -> Vec<ZonePopulation> {
        let now = self.clock.now();
        let validity = Duration::from_millis(self.config.cache_ms);
        let mut cache = self.cache.lock();
        if let Some((built_at, zones)) = cache.as_ref() {
            if now.saturating_duration_since(*built_at) < validity {
                return zones.clone();
            }
        }

        let mut zones: Vec<ZonePopulation> = self.zones.iter().map(|z| z.clone()).collect();
        zones.sort_by_key(|z| z.zone_id);
        *cache = Some((now, zones.clone()));
        zones
    }

    /// Whether one more bot fits in the zone given `pending` in-flight spawns
    pub fn can_spawn_in_zone(&self, zone_id: ZoneId, cap: u32, pending: u32) -> bool {
        let bots = self.zones.get(&zone_id).map(|z| z.bot_count).unwrap_or(0);
        bots + pending < cap
    }

    pub fn can_spawn_on_map(&self, map_id: MapId, cap: u32, pending: u32) -> bool {
        self.bots_on_map(map_id) + pending < cap
    }

    pub fn bots_on_map(&self, map_id: MapId) -> u32 {
        self.zones
            .iter()
            .filter(|z| z.map_id == map_id)
            .map(|z| z.bot_count)
            .sum()
    }

    pub fn bots_in_zone(&self, zone_id: ZoneId) -> u32 {
        self.zones.get(&zone_id).map(|z| z.bot_count).unwrap_or(0)
    }

    pub fn zone_of(&self, bot_id: BotId) -> Option<ZoneId> {
        self.bot_zones.get(&bot_id).map(|z| *z)
    }

    pub fn total_bot_count(&self) -> usize {
        self.bot_zones.len()
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Periodic housekeeping
    pub fn update(&self) {
        let now = self.clock.now();
        let mut last = self.last_prune.lock();
        let due = match *last {
            Some(at) => now.saturating_duration_since(at) >= Duration::from_millis(self.config.cache_ms),
            None => true,
        };
        if due {
            *last = Some(now);
            drop(last);
            self.remove_stale();
        }
    }

    /// Drop zones untouched for longer than the stale threshold. Zones that
    /// still hold bots are kept.
    pub fn remove_stale(&self) -> usize {
        let now = self.clock.now();
        let threshold = Duration::from_millis(self.config.stale_ms);
        let before = self.zones.len();
        self.zones.retain(|_, zone| {
            let stale = match zone.last_update {
                Some(at) => now.saturating_duration_since(at) > threshold,
                None => true,
            };
            !(stale && zone.bot_count == 0)
        });
        let removed = before - self.zones.len();
        if removed > 0 {
            debug!("Removed {} stale zone records", removed);
            self.invalidate();
        }
        removed
    }

    /// Forget everything (used when the control plane reinitialises)
    pub fn clear(&self) {
        self.zones.clear();
        self.bot_zones.clear();
        self.invalidate();
    }

    pub fn set_config(&mut self, config: PopulationConfig) {
        self.config = config;
        self.invalidate();
    }

    fn invalidate(&self) {
        *self.cache.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;
    use std::sync::Arc;

    fn manager() -> (PopulationManager, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (
            PopulationManager::new(PopulationConfig::default(), clock.clone()),
            clock,
        )
    }

    fn zone(zone_id: ZoneId, humans: u32) -> ZoneInfo {
        ZoneInfo {
            zone_id,
            map_id: 0,
            human_count: humans,
            min_level: 20,
            max_level: 30,
        }
    }

    fn bot_sum(m: &PopulationManager) -> usize {
        m.get_all().iter().map(|z| z.bot_count as usize).sum()
    }

    #[test]
    fn test_add_remove_idempotent() {
        let (m, _) = manager();
        assert!(m.add_bot_to_zone(12, 0, 1001));
        assert!(!m.add_bot_to_zone(12, 0, 1001));
        assert!(m.add_bot_to_zone(12, 0, 1002));
        assert_eq!(m.bots_in_zone(12), 2);

        assert!(!m.remove_bot_from_zone(13, 1001));
        assert!(m.remove_bot_from_zone(12, 1001));
        assert!(!m.remove_bot_from_zone(12, 1001));
        assert_eq!(m.bots_in_zone(12), 1);
        assert_eq!(m.total_bot_count(), bot_sum(&m));
    }

    #[test]
    fn test_moving_bot_keeps_sums() {
        let (m, _) = manager();
        m.add_bot_to_zone(1, 0, 7);
        m.add_bot_to_zone(2, 0, 7);
        assert_eq!(m.bots_in_zone(1), 0);
        assert_eq!(m.bots_in_zone(2), 1);
        assert_eq!(m.total_bot_count(), 1);
        assert_eq!(bot_sum(&m), 1);
    }

    #[test]
    fn test_targets_from_ratio() {
        let (m, _) = manager();
        m.update_zone(zone(12, 5));
        m.calculate_zone_targets(2.0, 50, 500);
        assert_eq!(m.get_population(12).map(|z| z.target_bot_count), Some(10));
        assert_eq!(m.underpopulated().len(), 1);
    }

    #[test]
    fn test_empty_zone_targets_zero() {
        let (m, _) = manager();
        m.update_zone(zone(3, 0));
        for ratio in [0.0, 0.5, 2.0, 1000.0] {
            m.calculate_zone_targets(ratio, 50, 500);
            assert_eq!(m.get_population(3).map(|z| z.target_bot_count), Some(0));
        }
    }

    #[test]
    fn test_targets_clamped() {
        let (m, _) = manager();
        m.update_zone(zone(1, 40));
        m.update_zone(zone(2, 40));
        m.update_zone(zone(3, 40));
        m.calculate_zone_targets(2.0, 50, 120);
        let targets: Vec<u32> = m.get_all().iter().map(|z| z.target_bot_count).collect();
        assert_eq!(targets, vec![50, 50, 20]);
    }

    #[test]
    fn test_overpopulated() {
        let (m, _) = manager();
        m.update_zone(zone(4, 1));
        for bot in 0..5 {
            m.add_bot_to_zone(4, 0, bot);
        }
        m.calculate_zone_targets(2.0, 50, 500);
        let over = m.overpopulated();
        assert_eq!(over.len(), 1);
        assert_eq!(over[0].surplus(), 3);
    }

    #[test]
    fn test_caps() {
        let (m, _) = manager();
        m.add_bot_to_zone(1, 9, 1);
        m.add_bot_to_zone(2, 9, 2);
        assert!(m.can_spawn_in_zone(1, 2, 0));
        assert!(!m.can_spawn_in_zone(1, 2, 1));
        assert!(m.can_spawn_in_zone(99, 1, 0));
        assert_eq!(m.bots_on_map(9), 2);
        assert!(!m.can_spawn_on_map(9, 2, 0));
        assert!(m.can_spawn_on_map(9, 3, 0));
    }

    #[test]
    fn test_cache_invalidated_on_write() {
        let (m, _) = manager();
        m.update_zone(zone(1, 1));
        assert_eq!(m.get_all()[0].bot_count, 0);
        m.add_bot_to_zone(1, 0, 5);
        assert_eq!(m.get_all()[0].bot_count, 1);
    }

    #[test]
    fn test_stale_zone_removal_spares_bots() {
        let (m, clock) = manager();
        m.update_zone(zone(1, 3));
        m.update_zone(zone(2, 3));
        m.add_bot_to_zone(2, 0, 77);

        clock.advance_ms(300_001);
        assert_eq!(m.remove_stale(), 1);
        assert!(m.get_population(1).is_none());
        assert_eq!(m.bots_in_zone(2), 1);
        assert_eq!(m.zone_of(77), Some(2));
    }
}
