use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::population::ZoneInfo;
use crate::spawn::pool::SessionHandle;
use crate::spawn::request::{BotId, Position, ZoneId};
use crate::world::{BindError, WorldHost};

/// A bot as the simulated world sees it
#[derive(Debug, Clone)]
pub struct SimBot {
    pub zone_id: ZoneId,
    pub position: Option<Position>,
    /// `None` for bots preloaded without a session
    pub session: Option<SessionHandle>,
}

/// World host backed by in-memory maps
pub struct SimWorldHost {
    zones: RwLock<BTreeMap<ZoneId, ZoneInfo>>,
    bots: DashMap<BotId, SimBot>,
    reject_binds: AtomicBool,
    despawned: Mutex<Vec<(BotId, String)>>,
    db_in_use: AtomicU32,
    db_max: AtomicU32,
    binds: AtomicU32,
}

impl SimWorldHost {
    pub fn new() -> Self {
        Self {
            zones: RwLock::new(BTreeMap::new()),
            bots: DashMap::new(),
            reject_binds: AtomicBool::new(false),
            despawned: Mutex::new(Vec::new()),
            db_in_use: AtomicU32::new(0),
            db_max: AtomicU32::new(32),
            binds: AtomicU32::new(0),
        }
    }

    pub fn set_zone(&self, info: ZoneInfo) {
        self.zones.write().insert(info.zone_id, info);
    }

    pub fn set_humans(&self, zone_id: ZoneId, human_count: u32) {
        if let Some(zone) = self.zones.write().get_mut(&zone_id) {
            zone.human_count = human_count;
        }
    }

    /// Bots already in the world before the control plane starts
    pub fn preload_bots(&self, zone_id: ZoneId, bot_ids: &[BotId]) {
        for id in bot_ids {
            self.bots.insert(
                *id,
                SimBot {
                    zone_id,
                    position: None,
                    session: None,
                },
            );
        }
    }

    pub fn reject_binds(&self, reject: bool) {
        self.reject_binds.store(reject, Ordering::Relaxed);
    }

    pub fn set_db_pool(&self, in_use: u32, max: u32) {
        self.db_in_use.store(in_use, Ordering::Relaxed);
        self.db_max.store(max, Ordering::Relaxed);
    }

    pub fn bot(&self, bot_id: BotId) -> Option<SimBot> {
        self.bots.get(&bot_id).map(|b| b.clone())
    }

    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }

    pub fn bots_in_zone(&self, zone_id: ZoneId) -> usize {
        self.bots.iter().filter(|b| b.zone_id == zone_id).count()
    }

    pub fn despawned(&self) -> Vec<(BotId, String)> {
        self.despawned.lock().clone()
    }

    pub fn bind_count(&self) -> u32 {
        self.binds.load(Ordering::Relaxed)
    }
}

impl Default for SimWorldHost {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldHost for SimWorldHost {
    fn spawn_into(
        &self,
        session: &SessionHandle,
        zone_id: ZoneId,
        position: Option<Position>,
    ) -> Result<(), BindError> {
        if self.reject_binds.load(Ordering::Relaxed) {
            return Err(BindError::Rejected("world refusing binds".into()));
        }
        let bot_id = session
            .character_id()
            .ok_or_else(|| BindError::Rejected("session has no character".into()))?;
        if self.bots.contains_key(&bot_id) {
            return Err(BindError::AlreadyBound(bot_id));
        }
        self.bots.insert(
            bot_id,
            SimBot {
                zone_id,
                position,
                session: Some(session.clone()),
            },
        );
        self.binds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn despawn(&self, bot_id: BotId, reason: &str) {
        self.bots.remove(&bot_id);
        self.despawned.lock().push((bot_id, reason.to_string()));
    }

    fn human_players_in_zone(&self, zone_id: ZoneId) -> u32 {
        self.zones
            .read()
            .get(&zone_id)
            .map(|z| z.human_count)
            .unwrap_or(0)
    }

    fn active_bots(&self) -> Vec<BotId> {
        let mut ids: Vec<BotId> = self.bots.iter().map(|b| *b.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn zones_with_players(&self) -> Vec<ZoneInfo> {
        self.zones
            .read()
            .values()
            .filter(|z| z.human_count > 0)
            .copied()
            .collect()
    }

    fn db_pool_usage(&self) -> (u32, u32) {
        (
            self.db_in_use.load(Ordering::Relaxed),
            self.db_max.load(Ordering::Relaxed),
        )
    }

    fn active_map_instances(&self) -> u32 {
        let zones = self.zones.read();
        let mut maps: Vec<u32> = zones.values().map(|z| z.map_id).collect();
        maps.sort_unstable();
        maps.dedup();
        maps.len() as u32
    }
}
