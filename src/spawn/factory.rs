//! Session factory
//!
//! Turns a selected character and its spawn request into a configured session
//! handle: base settings from the request, then class, level band and zone
//! layers, in that order.

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::pool::{SessionHandle, SessionPool};
use super::request::{AccountId, Position, SpawnRequest, ZoneId};
use crate::util::{RollingWindow, SharedClock};
use crate::world::CharacterSummary;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FactoryError {
    #[error("Character {0} failed integrity checks")]
    InvalidCharacter(u64),
    #[error("Account {actual} may not use this request (expected {expected})")]
    AccountMismatch { expected: AccountId, actual: AccountId },
    #[error("No session capacity")]
    PoolExhausted,
    #[error("Composed session invalid: {0}")]
    InvalidSession(String),
    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),
}

/// Per-class settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProfile {
    pub role: &'static str,
}

/// Per-zone settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneProfile {
    pub pvp_enabled: bool,
    pub default_position: Option<Position>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FactoryStats {
    pub created: u64,
    pub failed: u64,
    pub avg_creation_us: f64,
    pub max_creation_us: f64,
}

pub struct SessionFactory {
    pool: Arc<SessionPool>,
    clock: SharedClock,
    classes: FxHashMap<u8, ClassProfile>,
    zones: FxHashMap<ZoneId, ZoneProfile>,
    templates: FxHashMap<String, SpawnRequest>,
    latency_us: RollingWindow,
    created: u64,
    failed: u64,
}

impl SessionFactory {
    pub fn new(pool: Arc<SessionPool>, clock: SharedClock) -> Self {
        let mut classes = FxHashMap::default();
        for (class, role) in [
            (1, "tank"),
            (2, "tank"),
            (3, "ranged_dps"),
            (4, "melee_dps"),
            (5, "healer"),
            (6, "melee_dps"),
            (7, "healer"),
            (8, "ranged_dps"),
            (9, "ranged_dps"),
            (11, "healer"),
        ] {
            classes.insert(class, ClassProfile { role });
        }

        Self {
            pool,
            clock,
            classes,
            zones: FxHashMap::default(),
            templates: FxHashMap::default(),
            latency_us: RollingWindow::new(1000),
            created: 0,
            failed: 0,
        }
    }

    pub fn register_zone_profile(&mut self, zone_id: ZoneId, profile: ZoneProfile) {
        self.zones.insert(zone_id, profile);
    }

    pub fn register_template(&mut self, name: impl Into<String>, request: SpawnRequest) {
        self.templates.insert(name.into(), request);
    }

    pub fn template(&self, name: &str) -> Option<&SpawnRequest> {
        self.templates.get(name)
    }

    /// Build a session for `character` owned by `account_id`
    pub fn create(
        &mut self,
        character: &CharacterSummary,
        account_id: AccountId,
        request: &SpawnRequest,
    ) -> Result<SessionHandle, FactoryError> {
        let started = self.clock.now();
        let result = self.build(character, account_id, request);
        match &result {
            Ok(_) => {
                self.created += 1;
                self.record_latency(started);
            }
            Err(e) => {
                self.failed += 1;
                warn!("Session construction for character {} failed: {}", character.id, e);
            }
        }
        result
    }

    /// Compose a request from a named template and build from it
    pub fn create_from_template(
        &mut self,
        name: &str,
        character: &CharacterSummary,
        account_id: AccountId,
    ) -> Result<SessionHandle, FactoryError> {
        let mut request = self
            .templates
            .get(name)
            .cloned()
            .ok_or_else(|| FactoryError::UnknownTemplate(name.to_string()))?;
        request.character_id = Some(character.id);
        self.create(character, account_id, &request)
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            created: self.created,
            failed: self.failed,
            avg_creation_us: self.latency_us.average(),
            max_creation_us: self.latency_us.max(),
        }
    }

    /// Latency of the most recent successful build
    pub fn last_creation_ms(&self) -> Option<f64> {
        self.latency_us.last().map(|us| us / 1000.0)
    }

    fn build(
        &self,
        character: &CharacterSummary,
        account_id: AccountId,
        request: &SpawnRequest,
    ) -> Result<SessionHandle, FactoryError> {
        if character.id == 0 || character.level == 0 || account_id == 0 {
            return Err(FactoryError::InvalidCharacter(character.id));
        }
        if let Some(expected) = request.account_id {
            if expected != account_id {
                return Err(FactoryError::AccountMismatch {
                    expected,
                    actual: account_id,
                });
            }
        }

        let handle = self.pool.acquire(account_id).ok_or(FactoryError::PoolExhausted)?;

        // base
        handle.configure(|p| {
            p.character_id = Some(character.id);
            p.class = character.class;
            p.race = character.race;
            p.level = character.level;
            p.zone_id = request.zone_id;
            p.map_id = request.map_id;
            p.position = request.position;
            p.requested_by_human = request.requested_by_human;
        });

        let role = self
            .classes
            .get(&character.class)
            .map(|c| c.role)
            .unwrap_or("generalist");
        handle.configure(|p| p.role = role.to_string());

        let band = level_band(character.level);
        handle.configure(|p| p.level_band = band.to_string());

        if let Some(zone) = self.zones.get(&request.zone_id) {
            handle.configure(|p| {
                p.pvp_enabled = zone.pvp_enabled;
                if p.position.is_none() {
                    p.position = zone.default_position;
                }
            });
        }

        if let Err(e) = validate(&handle, account_id, request) {
            self.pool.release(handle);
            return Err(e);
        }
        debug!(
            "Built session {} for character {} ({}, {})",
            handle.id(),
            character.id,
            role,
            band
        );
        Ok(handle)
    }

    fn record_latency(&mut self, started: Instant) {
        let elapsed = self.clock.now().saturating_duration_since(started);
        self.latency_us.push(elapsed.as_micros() as f64);
    }
}

fn level_band(level: u8) -> &'static str {
    match level {
        0..=19 => "starter",
        20..=39 => "leveling",
        40..=59 => "veteran",
        _ => "endgame",
    }
}

fn validate(handle: &SessionHandle, account_id: AccountId, request: &SpawnRequest) -> Result<(), FactoryError> {
    let profile = handle.profile();
    if profile.account_id != Some(account_id) {
        return Err(FactoryError::InvalidSession("account not applied".into()));
    }
    if profile.character_id.is_none() {
        return Err(FactoryError::InvalidSession("character not applied".into()));
    }
    if profile.zone_id != request.zone_id {
        return Err(FactoryError::InvalidSession("zone not applied".into()));
    }
    if profile.role.is_empty() || profile.level_band.is_empty() {
        return Err(FactoryError::InvalidSession("profile incomplete".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::spawn::pool::SessionState;
    use crate::util::ManualClock;

    fn factory(max_active: usize) -> SessionFactory {
        let clock = ManualClock::new();
        let pool = Arc::new(SessionPool::new(PoolConfig::default(), max_active, clock.clone()));
        SessionFactory::new(pool, clock)
    }

    fn character(id: u64, class: u8, level: u8) -> CharacterSummary {
        CharacterSummary {
            id,
            class,
            race: 1,
            level,
            last_known_zone: None,
        }
    }

    #[test]
    fn test_layers_applied() {
        let mut f = factory(10);
        f.register_zone_profile(
            12,
            ZoneProfile {
                pvp_enabled: true,
                default_position: Some(Position { x: 1.0, y: 2.0, z: 3.0 }),
            },
        );
        let req = SpawnRequest::random(12, 0).with_levels(20, 30);
        let handle = f.create(&character(9, 5, 25), 3, &req).expect("session");

        let p = handle.profile();
        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(p.character_id, Some(9));
        assert_eq!(p.account_id, Some(3));
        assert_eq!(p.role, "healer");
        assert_eq!(p.level_band, "leveling");
        assert!(p.pvp_enabled);
        assert_eq!(p.position, Some(Position { x: 1.0, y: 2.0, z: 3.0 }));
        assert_eq!(f.stats().created, 1);
    }

    #[test]
    fn test_request_position_wins() {
        let mut f = factory(10);
        f.register_zone_profile(
            1,
            ZoneProfile {
                pvp_enabled: false,
                default_position: Some(Position::default()),
            },
        );
        let pos = Position { x: 5.0, y: 5.0, z: 0.0 };
        let req = SpawnRequest::random(1, 0).with_position(pos);
        let handle = f.create(&character(2, 1, 60), 1, &req).expect("session");
        assert_eq!(handle.profile().position, Some(pos));
        assert_eq!(handle.profile().level_band, "endgame");
    }

    #[test]
    fn test_invalid_character_rejected() {
        let mut f = factory(10);
        let req = SpawnRequest::random(1, 0);
        assert_eq!(
            f.create(&character(0, 1, 10), 1, &req).err(),
            Some(FactoryError::InvalidCharacter(0))
        );
        assert_eq!(f.stats().failed, 1);
    }

    #[test]
    fn test_account_mismatch() {
        let mut f = factory(10);
        let req = SpawnRequest::random(1, 0).with_account(4);
        assert!(matches!(
            f.create(&character(7, 1, 10), 5, &req),
            Err(FactoryError::AccountMismatch { expected: 4, actual: 5 })
        ));
    }

    #[test]
    fn test_pool_exhausted() {
        let mut f = factory(0);
        let req = SpawnRequest::random(1, 0);
        assert_eq!(
            f.create(&character(7, 1, 10), 5, &req).err(),
            Some(FactoryError::PoolExhausted)
        );
    }

    #[test]
    fn test_template() {
        let mut f = factory(10);
        f.register_template("city_guard", SpawnRequest::random(40, 1).with_levels(50, 60));
        let handle = f
            .create_from_template("city_guard", &character(11, 1, 55), 2)
            .expect("session");
        assert_eq!(handle.profile().zone_id, 40);
        assert!(matches!(
            f.create_from_template("nope", &character(11, 1, 55), 2),
            Err(FactoryError::UnknownTemplate(_))
        ));
    }
}
