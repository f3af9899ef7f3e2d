//! Spawner facade
//!
//! The world host talks to a [`BotSpawner`]. Which behavior it gets is decided
//! once at startup by [`SpawnerKind`]; the orchestrator underneath is the same.
//!
//! Completion callbacks and event handlers run after the orchestrator lock is
//! released, so they may call back into the spawner.

use parking_lot::{Mutex, MutexGuard};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::info;

use crate::config::{ConfigError, SpawnConfig};
use crate::control::{ResourceSampler, StartupPhase};
use crate::population::ZonePopulation;
use crate::spawn::{
    BotId, EventBus, SpawnOrchestrator, SpawnRequest, SpawnStats, ZoneId, ZoneProfile,
};
use crate::util::SharedClock;
use crate::world::{CharacterStore, WorldHost};

/// Lock waits shorter than this are not worth a sample
const LOCK_WAIT_FLOOR: Duration = Duration::from_micros(50);

/// Spawner behavior chosen at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnerKind {
    /// Population-driven spawning without phased startup
    Legacy,
    #[default]
    Orchestrated,
}

impl SpawnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpawnerKind::Legacy => "legacy",
            SpawnerKind::Orchestrated => "orchestrated",
        }
    }
}

impl FromStr for SpawnerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(SpawnerKind::Legacy),
            "orchestrated" | "enhanced" => Ok(SpawnerKind::Orchestrated),
            _ => Err(ConfigError::InvalidValue {
                key: "SpawnerKind".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// The spawn API the world host and operators use
pub trait BotSpawner: Send + Sync {
    fn kind(&self) -> SpawnerKind;

    /// One world tick
    fn update(&self);

    fn spawn_bot(&self, request: SpawnRequest) -> bool;
    fn spawn_bots(&self, requests: Vec<SpawnRequest>) -> usize;
    fn spawn_to_population_target(&self) -> usize;
    fn spawn_from_template(&self, name: &str) -> bool;
    fn register_template(&self, name: &str, request: SpawnRequest);
    fn register_zone_profile(&self, zone_id: ZoneId, profile: ZoneProfile);
    fn despawn_bot(&self, bot_id: BotId, reason: &str) -> bool;
    fn despawn_all(&self) -> usize;

    fn active_bot_count(&self) -> usize;
    fn active_bot_count_in_zone(&self, zone_id: ZoneId) -> usize;
    fn can_spawn_more(&self) -> bool;
    fn can_spawn_in_zone(&self, zone_id: ZoneId) -> bool;
    fn zone_population(&self, zone_id: ZoneId) -> Option<ZonePopulation>;
    fn all_zone_populations(&self) -> Vec<ZonePopulation>;
    fn is_bot_active(&self, bot_id: BotId) -> bool;

    fn on_player_login(&self);
    fn check_and_spawn_for_players(&self) -> usize;

    fn set_max_bots(&self, max_bots: u32);
    fn set_bot_to_player_ratio(&self, ratio: f64);
    fn set_enabled(&self, enabled: bool);
    fn reload_config(&self, config: SpawnConfig) -> Result<(), ConfigError>;

    fn reset_circuit_breaker(&self);
    fn force_next_phase(&self) -> StartupPhase;
    fn abort_startup(&self);

    fn stats(&self) -> SpawnStats;
    fn reset_stats(&self);
    fn events(&self) -> Arc<EventBus>;

    fn shutdown(&self);
}

/// Thread-safe spawner over one orchestrator
pub struct SharedSpawner {
    kind: SpawnerKind,
    events: Arc<EventBus>,
    inner: Mutex<SpawnOrchestrator>,
}

impl SharedSpawner {
    pub fn new(kind: SpawnerKind, mut orchestrator: SpawnOrchestrator) -> Self {
        orchestrator.defer_delivery();
        Self {
            kind,
            events: orchestrator.events().clone(),
            inner: Mutex::new(orchestrator),
        }
    }

    /// Run `f` under the lock, then hand concluded requests their outcome
    fn with<R>(&self, f: impl FnOnce(&mut SpawnOrchestrator) -> R) -> R {
        let (result, completions) = {
            let mut guard = self.lock();
            let result = f(&mut *guard);
            (result, guard.take_completions())
        };
        for completion in completions {
            completion.run();
        }
        result
    }

    /// Deliver queued events with the lock released
    fn dispatch_events(&self, until_empty: bool) {
        let mut processed = 0;
        let mut handler_time = Duration::ZERO;
        loop {
            let report = self.events.process_batch();
            processed += report.processed;
            handler_time += report.handler_time;
            if !until_empty || report.processed == 0 {
                break;
            }
        }
        if processed > 0 {
            self.lock().record_handler_time(handler_time);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpawnOrchestrator> {
        let started = Instant::now();
        let mut guard = self.inner.lock();
        let waited = started.elapsed();
        if waited >= LOCK_WAIT_FLOOR {
            guard.record_lock_wait(waited);
        }
        guard
    }
}

/// Build the spawner for `kind`
pub fn create_spawner(
    kind: SpawnerKind,
    mut config: SpawnConfig,
    world: Arc<dyn WorldHost>,
    store: Arc<dyn CharacterStore>,
    sampler: Box<dyn ResourceSampler>,
    clock: SharedClock,
    runtime: Handle,
) -> Result<Arc<dyn BotSpawner>, ConfigError> {
    if kind == SpawnerKind::Legacy {
        config.startup.enabled = false;
    }
    let orchestrator = SpawnOrchestrator::new(config, world, store, sampler, clock, runtime)?;
    info!("Using {} spawner", kind.as_str());
    Ok(Arc::new(SharedSpawner::new(kind, orchestrator)))
}

impl BotSpawner for SharedSpawner {
    fn kind(&self) -> SpawnerKind {
        self.kind
    }

    fn update(&self) {
        self.with(SpawnOrchestrator::update);
        self.dispatch_events(false);
    }

    fn spawn_bot(&self, request: SpawnRequest) -> bool {
        self.with(|orch| orch.spawn_bot(request))
    }

    fn spawn_bots(&self, requests: Vec<SpawnRequest>) -> usize {
        self.with(|orch| orch.spawn_bots(requests))
    }

    fn spawn_to_population_target(&self) -> usize {
        self.with(SpawnOrchestrator::spawn_to_population_target)
    }

    fn spawn_from_template(&self, name: &str) -> bool {
        self.with(|orch| orch.spawn_from_template(name))
    }

    fn register_template(&self, name: &str, request: SpawnRequest) {
        self.lock().register_template(name, request);
    }

    fn register_zone_profile(&self, zone_id: ZoneId, profile: ZoneProfile) {
        self.lock().register_zone_profile(zone_id, profile);
    }

    fn despawn_bot(&self, bot_id: BotId, reason: &str) -> bool {
        self.lock().despawn_bot(bot_id, reason)
    }

    fn despawn_all(&self) -> usize {
        self.lock().despawn_all()
    }

    fn active_bot_count(&self) -> usize {
        self.lock().active_bot_count()
    }

    fn active_bot_count_in_zone(&self, zone_id: ZoneId) -> usize {
        self.lock().active_bot_count_in_zone(zone_id)
    }

    fn can_spawn_more(&self) -> bool {
        self.lock().can_spawn_more()
    }

    fn can_spawn_in_zone(&self, zone_id: ZoneId) -> bool {
        self.lock().can_spawn_in_zone(zone_id)
    }

    fn zone_population(&self, zone_id: ZoneId) -> Option<ZonePopulation> {
        self.lock().zone_population(zone_id)
    }

    fn all_zone_populations(&self) -> Vec<ZonePopulation> {
        self.lock().all_zone_populations()
    }

    fn is_bot_active(&self, bot_id: BotId) -> bool {
        self.lock().is_bot_active(bot_id)
    }

    fn on_player_login(&self) {
        self.lock().on_player_login();
    }

    fn check_and_spawn_for_players(&self) -> usize {
        self.with(SpawnOrchestrator::check_and_spawn_for_players)
    }

    fn set_max_bots(&self, max_bots: u32) {
        self.lock().set_max_bots(max_bots);
    }

    fn set_bot_to_player_ratio(&self, ratio: f64) {
        self.lock().set_bot_to_player_ratio(ratio);
    }

    fn set_enabled(&self, enabled: bool) {
        self.lock().set_enabled(enabled);
    }

    fn reload_config(&self, mut config: SpawnConfig) -> Result<(), ConfigError> {
        if self.kind == SpawnerKind::Legacy {
            config.startup.enabled = false;
        }
        self.with(|orch| orch.reload_config(config))
    }

    fn reset_circuit_breaker(&self) {
        self.lock().reset_circuit_breaker();
    }

    fn force_next_phase(&self) -> StartupPhase {
        self.lock().force_next_phase()
    }

    fn abort_startup(&self) {
        self.lock().abort_startup();
    }

    fn stats(&self) -> SpawnStats {
        self.lock().stats()
    }

    fn reset_stats(&self) {
        self.lock().reset_stats();
    }

    fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    fn shutdown(&self) {
        self.with(SpawnOrchestrator::shutdown);
        self.dispatch_events(true);
    }
}
