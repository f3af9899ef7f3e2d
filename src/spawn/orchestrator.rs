//! Spawn orchestrator
//!
//! Owns every control-plane component and wires them into the spawn pipeline:
//! population decision, priority queue, admission control, character
//! selection, session construction, world bind and completion events.
//!
//! All synchronous work happens in [`SpawnOrchestrator::update`], called once
//! per world tick. Character selection runs on the tokio runtime and reports
//! back through a lock-free ingress channel drained at the start of the next
//! tick.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use super::error::SpawnErrorKind;
use super::events::{EventBus, EventBusMetrics, EventPayload};
use super::factory::{FactoryError, FactoryStats, SessionFactory, ZoneProfile};
use super::pool::{PoolStats, SessionHandle, SessionPool};
use super::queue::{QueueError, QueueMetrics, SpawnQueue};
use super::request::{
    AccountId, BotId, Completion, MapId, PrioritySpawnRequest, RequestId, SpawnPriority,
    SpawnRequest, SpawnType, ZoneId,
};
use super::selector::{CharacterSelector, Selection, SelectionResult, SelectorStats};
use crate::config::{ConfigError, SpawnConfig};
use crate::control::{
    AdaptiveThrottler, CircuitMetrics, CircuitState, PressureLevel, ResourceMetrics,
    ResourceMonitor, ResourceSampler, SpawnCircuitBreaker, StartupOrchestrator, StartupPhase,
    StartupStatus, ThrottlerStats,
};
use crate::performance::{HealthStatus, PerformanceMonitor, PerformanceSnapshot};
use crate::population::{PopulationManager, ZonePopulation};
use crate::util::SharedClock;
use crate::world::{CharacterStore, CharacterSummary, WorldHost};

/// Reason given to the host for bots found in the world at startup
pub const RESTART_DESPAWN_REASON: &str = "control plane restart";
pub const SURPLUS_DESPAWN_REASON: &str = "population surplus";

/// A bot this control plane spawned and the world holds
#[derive(Debug, Clone)]
pub struct ActiveBot {
    pub bot_id: BotId,
    pub account_id: AccountId,
    pub zone_id: ZoneId,
    pub map_id: MapId,
    pub session: SessionHandle,
    pub spawned_at: Instant,
    pub spawned_wall: DateTime<Utc>,
}

/// Results flowing back from async stages
enum PipelineMessage {
    Selected {
        request_id: RequestId,
        selection: Selection,
    },
}

/// A request released from the queue and not yet concluded
struct InFlight {
    request: PrioritySpawnRequest,
}

/// Aggregated control-plane statistics
#[derive(Debug, Clone, Serialize)]
pub struct SpawnStats {
    pub enabled: bool,
    pub total_requested: u64,
    pub total_spawned: u64,
    pub failed_spawns: u64,
    pub total_despawned: u64,
    pub retries: u64,
    pub rejected_requests: u64,
    pub active_bots: usize,
    pub peak_concurrent: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub failures_by_kind: BTreeMap<&'static str, u64>,
    pub circuit_state: CircuitState,
    pub circuit_history: Vec<CircuitState>,
    pub pressure: PressureLevel,
    pub startup_phase: StartupPhase,
    pub health: HealthStatus,
    pub throttler: ThrottlerStats,
    pub queue: QueueMetrics,
    pub pool: PoolStats,
    pub events: EventBusMetrics,
    pub selector: SelectorStats,
    pub factory: FactoryStats,
    pub circuit: CircuitMetrics,
    pub startup: StartupStatus,
    pub resources: ResourceMetrics,
    pub performance: PerformanceSnapshot,
    pub stats_since: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    total_requested: u64,
    total_spawned: u64,
    failed_spawns: u64,
    total_despawned: u64,
    retries: u64,
    rejected_requests: u64,
    peak_concurrent: usize,
    failures_by_kind: BTreeMap<&'static str, u64>,
}

pub struct SpawnOrchestrator {
    config: SpawnConfig,
    clock: SharedClock,
    world: Arc<dyn WorldHost>,

    resources: ResourceMonitor,
    circuit: SpawnCircuitBreaker,
    queue: SpawnQueue,
    throttler: AdaptiveThrottler,
    startup: StartupOrchestrator,
    population: PopulationManager,
    selector: CharacterSelector,
    factory: SessionFactory,
    pool: Arc<SessionPool>,
    events: Arc<EventBus>,
    performance: PerformanceMonitor,

    active: DashMap<BotId, ActiveBot>,
    in_flight: FxHashMap<RequestId, InFlight>,
    /// Queued plus in-flight requests per zone and map
    pending_by_zone: FxHashMap<ZoneId, u32>,
    pending_by_map: FxHashMap<MapId, u32>,

    ingress_tx: Sender<PipelineMessage>,
    ingress_rx: Receiver<PipelineMessage>,

    next_request_id: RequestId,
    last_target_calc: Option<Instant>,
    last_population_update: Option<Instant>,
    counters: Counters,
    stats_since: DateTime<Utc>,
    shut_down: bool,
    /// Held completions when the caller delivers them outside its lock
    deferred: Option<Vec<Completion>>,
}

impl SpawnOrchestrator {
    /// Build the control plane. Bots already in the world are despawned since
    /// their sessions cannot be recovered.
    pub fn new(
        config: SpawnConfig,
        world: Arc<dyn WorldHost>,
        store: Arc<dyn CharacterStore>,
        sampler: Box<dyn ResourceSampler>,
        clock: SharedClock,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let pool = Arc::new(SessionPool::new(
            config.pool.clone(),
            config.max_bots_total as usize,
            clock.clone(),
        ));
        pool.prewarm();
        let (ingress_tx, ingress_rx) = crossbeam_channel::unbounded();

        let mut orchestrator = Self {
            resources: ResourceMonitor::new(config.resource.clone(), sampler, clock.clone()),
            circuit: SpawnCircuitBreaker::new(config.circuit.clone(), clock.clone()),
            queue: SpawnQueue::new(config.spawn_queue_max_size, clock.clone()),
            throttler: AdaptiveThrottler::new(config.throttle.clone(), clock.clone()),
            startup: StartupOrchestrator::new(config.startup.clone(), clock.clone()),
            population: PopulationManager::new(config.population.clone(), clock.clone()),
            selector: CharacterSelector::new(
                store,
                config.selector.clone(),
                clock.clone(),
                runtime,
            ),
            factory: SessionFactory::new(pool.clone(), clock.clone()),
            pool,
            events: Arc::new(EventBus::new(config.event_bus.clone(), clock.clone())),
            performance: PerformanceMonitor::new(clock.clone()),
            active: DashMap::new(),
            in_flight: FxHashMap::default(),
            pending_by_zone: FxHashMap::default(),
            pending_by_map: FxHashMap::default(),
            ingress_tx,
            ingress_rx,
            next_request_id: 1,
            last_target_calc: None,
            last_population_update: None,
            counters: Counters::default(),
            stats_since: Utc::now(),
            shut_down: false,
            deferred: None,
            config,
            clock,
            world,
        };
        orchestrator.reinitialize();
        info!(
            "Spawn orchestrator ready (max {} bots, ratio {:.2}, phased startup {})",
            orchestrator.config.max_bots_total,
            orchestrator.config.bot_to_player_ratio,
            if orchestrator.startup.is_complete() { "off" } else { "on" }
        );
        Ok(orchestrator)
    }

    /// Despawn bots the world holds that this control plane does not own
    pub fn reinitialize(&mut self) -> usize {
        let mut removed = 0;
        for bot_id in self.world.active_bots() {
            if !self.active.contains_key(&bot_id) {
                self.world.despawn(bot_id, RESTART_DESPAWN_REASON);
                removed += 1;
            }
        }
        if removed > 0 {
            warn!("Despawned {} orphaned bots left from a previous run", removed);
        }
        removed
    }

    // ---- tick driver ----

    /// One world tick
    pub fn update(&mut self) {
        let (db_in_use, db_max) = self.world.db_pool_usage();
        self.resources.set_db_pool(db_in_use, db_max);
        self.resources
            .set_active_map_instances(self.world.active_map_instances());
        self.resources.set_total_active_bots(self.active.len() as u32);
        self.resources.update();

        self.circuit.update();

        self.throttler.set_phase_multiplier(self.startup.rate_multiplier());
        self.throttler.update(self.resources.pressure(), &self.circuit);

        let has_releasable = self
            .startup
            .allowed_priority()
            .map(|p| self.queue.has_releasable(p))
            .unwrap_or(false);
        if self.startup.update(has_releasable).is_some() {
            self.throttler.set_phase_multiplier(self.startup.rate_multiplier());
        }

        self.population.update();
        self.pool.update();
        self.update_performance();

        self.drain_ingress();
        if self.config.enabled && !self.shut_down {
            self.run_cadence();
            self.release_ready();
        }

        if self.deferred.is_none() {
            let report = self.events.process_batch();
            if report.processed > 0 {
                self.record_handler_time(report.handler_time);
            }
        }
        self.throttler.on_tick_boundary();
    }

    /// Hold completion callbacks and leave event dispatch to the caller.
    /// Both then run outside whatever lock guards this orchestrator.
    pub fn defer_delivery(&mut self) {
        if self.deferred.is_none() {
            self.deferred = Some(Vec::new());
        }
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        self.deferred.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub fn record_handler_time(&mut self, elapsed: Duration) {
        self.performance.record_handler_time(elapsed);
    }

    fn update_performance(&mut self) {
        let metrics = self.resources.current_metrics();
        self.performance.set_resources(
            (metrics.working_set_mb * 1024.0 * 1024.0) as u64,
            self.active.len() as u32,
            metrics.cpu_5s,
        );
        if let Some(status) = self.performance.update() {
            if status != HealthStatus::Healthy {
                warn!("Spawn pipeline health: {}", self.performance.status_message());
                self.events.publish(EventPayload::PerformanceAlert {
                    status: status.as_str().to_string(),
                    message: self.performance.status_message(),
                });
            } else {
                info!("Spawn pipeline healthy again");
            }
        }
    }

    fn run_cadence(&mut self) {
        let now = self.clock.now();
        if due(self.last_population_update, now, self.config.population_update_interval_ms) {
            self.last_population_update = Some(now);
            self.refresh_population();
        }
        if due(self.last_target_calc, now, self.config.target_calc_interval_ms) {
            self.last_target_calc = Some(now);
            self.spawn_to_population_target();
            if self.config.despawn_surplus {
                self.despawn_surplus();
            }
        }
    }

    /// Release queued requests while phase and throttle allow
    fn release_ready(&mut self) {
        while let Some(top) = self.queue.peek_priority() {
            if !self.startup.allows(top) {
                break;
            }
            let decision = self.throttler.check();
            if !self.startup.should_release_next(Some(top), decision.is_allowed()) {
                self.throttler.note_block(decision);
                break;
            }
            let Some(request) = self.queue.dequeue_highest() else {
                break;
            };

            self.throttler.record_admission();
            self.circuit.record_attempt();
            self.throttler.observe_circuit(&self.circuit);

            let request_id = request.request_id;
            let spawn_request = request.request.clone();
            trace_release(&request);
            self.in_flight.insert(request_id, InFlight { request });

            let tx = self.ingress_tx.clone();
            self.selector.select_async(spawn_request, move |selection| {
                let _ = tx.send(PipelineMessage::Selected {
                    request_id,
                    selection,
                });
            });
        }
    }

    fn drain_ingress(&mut self) {
        while let Ok(message) = self.ingress_rx.try_recv() {
            match message {
                PipelineMessage::Selected {
                    request_id,
                    selection,
                } => self.on_selection(request_id, selection),
            }
        }
    }

    fn on_selection(&mut self, request_id: RequestId, selection: Selection) {
        let Some(flight) = self.in_flight.remove(&request_id) else {
            return;
        };
        if selection.store_calls > 0 {
            self.performance
                .record_store_query(selection.store_time / selection.store_calls);
        }

        match selection.result {
            SelectionResult::Selected {
                character,
                account_id,
                ..
            } => {
                self.events.publish(EventPayload::CharacterSelected {
                    request_id,
                    character_id: character.id,
                    account_id,
                });
                self.construct(flight, character, account_id);
            }
            SelectionResult::NoSuitableCharacter => self.fail(
                flight,
                SpawnErrorKind::NoSuitableCharacter,
                "no suitable character".to_string(),
            ),
            SelectionResult::StoreError(e) => {
                self.fail(flight, SpawnErrorKind::StoreError, e.to_string())
            }
            SelectionResult::Overloaded => self.fail(
                flight,
                SpawnErrorKind::CapacityExhausted,
                "character selector overloaded".to_string(),
            ),
        }
    }

    fn construct(&mut self, flight: InFlight, character: CharacterSummary, account_id: AccountId) {
        let request_id = flight.request.request_id;
        let built = match flight.request.request.template.as_deref() {
            Some(name) => self.factory.create_from_template(name, &character, account_id),
            None => self.factory.create(&character, account_id, &flight.request.request),
        };
        match built {
            Ok(session) => {
                self.events.publish(EventPayload::SessionCreated {
                    request_id,
                    character_id: character.id,
                    session_id: session.id(),
                });
                self.bind(flight, session, character.id, account_id);
            }
            Err(e) => {
                self.selector.release_reservation(character.id);
                let kind = match e {
                    FactoryError::PoolExhausted => SpawnErrorKind::CapacityExhausted,
                    _ => SpawnErrorKind::SessionConstructionError,
                };
                self.fail(flight, kind, e.to_string());
            }
        }
    }

    fn bind(&mut self, flight: InFlight, session: SessionHandle, bot_id: BotId, account_id: AccountId) {
        let request = &flight.request.request;
        if self.active.contains_key(&bot_id) {
            self.pool.release(session);
            self.fail(
                flight,
                SpawnErrorKind::WorldBindRejected,
                format!("bot {} already active", bot_id),
            );
            return;
        }
        if let Err(e) = self.world.spawn_into(&session, request.zone_id, request.position) {
            self.pool.release(session);
            self.selector.release_reservation(bot_id);
            self.fail(flight, SpawnErrorKind::WorldBindRejected, e.to_string());
            return;
        }

        let now = self.clock.now();
        let (zone_id, map_id) = (request.zone_id, request.map_id);
        self.pool.bind(bot_id, &session);
        self.active.insert(
            bot_id,
            ActiveBot {
                bot_id,
                account_id,
                zone_id,
                map_id,
                session,
                spawned_at: now,
                spawned_wall: Utc::now(),
            },
        );
        self.population.add_bot_to_zone(zone_id, map_id, bot_id);
        self.release_pending(zone_id, map_id);

        self.throttler.record_spawn_success();
        self.circuit.record_success();
        self.startup.record_spawn();
        self.performance.record_spawn_success(
            now.saturating_duration_since(flight.request.created_at),
        );
        self.counters.total_spawned += 1;
        self.counters.peak_concurrent = self.counters.peak_concurrent.max(self.active.len());

        debug!("Bot {} spawned in zone {}", bot_id, zone_id);
        self.events.publish(EventPayload::SpawnCompleted {
            request_id: flight.request.request_id,
            bot_id,
            zone_id,
            success: true,
        });
        self.publish_population(zone_id);
        self.finish(&flight.request.request, true, Some(bot_id));
    }

    /// Record a failed attempt; retry once where the kind allows it
    fn fail(&mut self, flight: InFlight, kind: SpawnErrorKind, reason: String) {
        if kind.counts_as_failure(self.config.count_provisioning_failures) {
            self.throttler.record_spawn_failure(&mut self.circuit, &reason);
        }

        let request = flight.request;
        if kind.is_retryable() && request.retry_count == 0 && !self.shut_down {
            let mut retry = request.clone();
            retry.retry_count += 1;
            match self.queue.enqueue(retry) {
                Ok(evicted) => {
                    self.counters.retries += 1;
                    debug!(
                        "Retrying request {} after {}: {}",
                        request.request_id,
                        kind.as_str(),
                        reason
                    );
                    if let Some(evicted) = evicted {
                        self.conclude_failure(
                            evicted,
                            SpawnErrorKind::CapacityExhausted,
                            "evicted from full spawn queue".to_string(),
                        );
                    }
                    return;
                }
                Err(e) => debug!("Retry of request {} not queued: {}", request.request_id, e),
            }
        }
        self.conclude_failure(request, kind, reason);
    }

    fn conclude_failure(&mut self, request: PrioritySpawnRequest, kind: SpawnErrorKind, reason: String) {
        self.release_pending(request.request.zone_id, request.request.map_id);
        self.counters.failed_spawns += 1;
        *self.counters.failures_by_kind.entry(kind.as_str()).or_insert(0) += 1;
        self.performance.record_spawn_failure();

        if kind == SpawnErrorKind::Cancelled {
            debug!("Spawn request {} cancelled: {}", request.request_id, reason);
        } else {
            warn!(
                "Spawn request {} failed ({}): {}",
                request.request_id,
                kind.as_str(),
                reason
            );
        }
        self.events.publish(EventPayload::SpawnFailed {
            request_id: request.request_id,
            kind,
            reason,
        });
        self.finish(&request.request, false, None);
    }

    fn finish(&mut self, request: &SpawnRequest, success: bool, bot_id: Option<BotId>) {
        let Some(completion) = request.completion(success, bot_id) else {
            return;
        };
        match self.deferred.as_mut() {
            Some(held) => held.push(completion),
            None => completion.run(),
        }
    }

    // ---- external API ----

    /// Queue a spawn. Returns false when a hard gate refuses it.
    pub fn spawn_bot(&mut self, request: SpawnRequest) -> bool {
        match self.admit(request, "external request") {
            Ok(()) => true,
            Err((kind, request)) => {
                self.counters.rejected_requests += 1;
                debug!("Spawn request rejected: {}", kind);
                self.finish(&request, false, None);
                false
            }
        }
    }

    /// Queue a spawn composed from a registered template
    pub fn spawn_from_template(&mut self, name: &str) -> bool {
        let Some(template) = self.factory.template(name) else {
            self.counters.rejected_requests += 1;
            debug!("Unknown spawn template '{}'", name);
            return false;
        };
        let request = template.clone().with_template(name);
        self.spawn_bot(request)
    }

    pub fn register_template(&mut self, name: &str, request: SpawnRequest) {
        self.factory.register_template(name, request);
    }

    pub fn register_zone_profile(&mut self, zone_id: ZoneId, profile: ZoneProfile) {
        self.factory.register_zone_profile(zone_id, profile);
    }

    pub fn spawn_bots(&mut self, requests: Vec<SpawnRequest>) -> usize {
        requests
            .into_iter()
            .map(|r| self.spawn_bot(r))
            .filter(|queued| *queued)
            .count()
    }

    /// Compose requests for underpopulated zones, at most one batch per call
    pub fn spawn_to_population_target(&mut self) -> usize {
        self.population.calculate_zone_targets(
            self.config.bot_to_player_ratio,
            self.config.max_bots_per_zone,
            self.config.max_bots_total,
        );

        let mut budget = self.config.spawn_batch_size;
        let mut queued = 0;
        for zone in self.population.underpopulated() {
            if budget == 0 {
                break;
            }
            let pending = self.pending_in_zone(zone.zone_id);
            let needed = zone.deficit().saturating_sub(pending).min(budget);
            for _ in 0..needed {
                let request = SpawnRequest::random(zone.zone_id, zone.map_id)
                    .with_levels(zone.min_level, zone.max_level);
                if self.admit(request, "population target").is_err() {
                    break;
                }
                queued += 1;
                budget -= 1;
            }
        }
        if queued > 0 {
            debug!("Queued {} spawns toward population targets", queued);
        }
        queued
    }

    /// Remove a bot from the world
    pub fn despawn_bot(&mut self, bot_id: BotId, reason: &str) -> bool {
        let Some((_, bot)) = self.active.remove(&bot_id) else {
            return false;
        };
        self.world.despawn(bot_id, reason);
        self.population.remove_bot_from_zone(bot.zone_id, bot_id);
        self.pool.return_bot(bot_id);
        self.selector.release_reservation(bot_id);
        self.counters.total_despawned += 1;
        debug!("Bot {} despawned: {}", bot_id, reason);
        self.publish_population(bot.zone_id);
        true
    }

    pub fn despawn_all(&mut self) -> usize {
        let ids: Vec<BotId> = self.active.iter().map(|b| *b.key()).collect();
        let count = ids
            .into_iter()
            .filter(|id| self.despawn_bot(*id, "despawn all"))
            .count();
        info!("Despawned all {} bots", count);
        count
    }

    pub fn active_bot_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_bot_count_in_zone(&self, zone_id: ZoneId) -> usize {
        self.population.bots_in_zone(zone_id) as usize
    }

    pub fn can_spawn_more(&self) -> bool {
        self.config.enabled
            && !self.shut_down
            && self.circuit.state() != CircuitState::Open
            && self.resources.is_safe_to_spawn()
            && self.pool.can_allocate()
            && self.active.len() + self.pending_total() < self.config.max_bots_total as usize
    }

    pub fn can_spawn_in_zone(&self, zone_id: ZoneId) -> bool {
        self.population.can_spawn_in_zone(
            zone_id,
            self.config.max_bots_per_zone,
            self.pending_in_zone(zone_id),
        )
    }

    pub fn zone_population(&self, zone_id: ZoneId) -> Option<ZonePopulation> {
        self.population.get_population(zone_id)
    }

    pub fn all_zone_populations(&self) -> Vec<ZonePopulation> {
        self.population.get_all()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn startup_phase(&self) -> StartupPhase {
        self.startup.phase()
    }

    pub fn is_bot_active(&self, bot_id: BotId) -> bool {
        self.active.contains_key(&bot_id)
    }

    pub fn active_bot(&self, bot_id: BotId) -> Option<ActiveBot> {
        self.active.get(&bot_id).map(|b| b.clone())
    }

    /// A human logged in: refresh population and targets on the next tick
    pub fn on_player_login(&mut self) {
        self.last_population_update = None;
        self.last_target_calc = None;
    }

    /// Refresh from the world now and queue toward the targets
    pub fn check_and_spawn_for_players(&mut self) -> usize {
        self.refresh_population();
        self.last_population_update = Some(self.clock.now());
        if !self.config.enabled {
            return 0;
        }
        self.spawn_to_population_target()
    }

    pub fn set_max_bots(&mut self, max_bots: u32) {
        info!("Max bots {} -> {}", self.config.max_bots_total, max_bots);
        self.config.max_bots_total = max_bots;
        self.pool.set_max_active(max_bots as usize);
        self.last_target_calc = None;
    }

    pub fn set_bot_to_player_ratio(&mut self, ratio: f64) {
        let ratio = ratio.max(0.0);
        info!("Bot to player ratio {:.2} -> {:.2}", self.config.bot_to_player_ratio, ratio);
        self.config.bot_to_player_ratio = ratio;
        self.last_target_calc = None;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.config.enabled != enabled {
            info!("Bot spawning {}", if enabled { "enabled" } else { "disabled" });
        }
        self.config.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Re-apply a validated configuration. Queued and in-flight work is kept.
    pub fn reload_config(&mut self, config: SpawnConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.throttler.set_config(config.throttle.clone());
        self.circuit.set_config(config.circuit.clone());
        self.resources.set_config(config.resource.clone());
        self.queue.set_max_size(config.spawn_queue_max_size);
        self.selector.set_config(config.selector.clone());
        self.population.set_config(config.population.clone());
        self.pool.set_max_active(config.max_bots_total as usize);
        if config.startup != self.config.startup {
            self.startup.set_config(config.startup.clone());
        }
        self.config = config;
        self.last_target_calc = None;
        info!("Spawn configuration reloaded");
        Ok(())
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Manual override for the breaker
    pub fn reset_circuit_breaker(&mut self) {
        self.circuit.reset();
        self.throttler.observe_circuit(&self.circuit);
    }

    pub fn force_next_phase(&mut self) -> StartupPhase {
        let phase = self.startup.force_next();
        self.throttler.set_phase_multiplier(self.startup.rate_multiplier());
        phase
    }

    pub fn abort_startup(&mut self) {
        self.startup.abort();
        self.throttler.set_phase_multiplier(1.0);
    }

    /// Time a caller spent waiting for exclusive access
    pub fn record_lock_wait(&mut self, waited: Duration) {
        self.performance.record_lock_wait(waited);
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn stats(&self) -> SpawnStats {
        SpawnStats {
            enabled: self.config.enabled,
            total_requested: self.counters.total_requested,
            total_spawned: self.counters.total_spawned,
            failed_spawns: self.counters.failed_spawns,
            total_despawned: self.counters.total_despawned,
            retries: self.counters.retries,
            rejected_requests: self.counters.rejected_requests,
            active_bots: self.active.len(),
            peak_concurrent: self.counters.peak_concurrent,
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            failures_by_kind: self.counters.failures_by_kind.clone(),
            circuit_state: self.circuit.state(),
            circuit_history: self.circuit.state_history(),
            pressure: self.resources.pressure(),
            startup_phase: self.startup.phase(),
            health: self.performance.status(),
            throttler: self.throttler.stats(),
            queue: self.queue.metrics(),
            pool: self.pool.stats(),
            events: self.events.metrics(),
            selector: self.selector.stats(),
            factory: self.factory.stats(),
            circuit: self.circuit.metrics(),
            startup: self.startup.status(),
            resources: self.resources.current_metrics(),
            performance: self.performance.snapshot(),
            stats_since: self.stats_since,
        }
    }

    pub fn reset_stats(&mut self) {
        self.counters = Counters {
            peak_concurrent: self.active.len(),
            ..Counters::default()
        };
        self.throttler.reset_stats();
        self.performance.reset();
        self.stats_since = Utc::now();
        info!("Spawn statistics reset");
    }

    /// Stop the pipeline. Pending selections are orphaned; every queued or
    /// in-flight request concludes as cancelled.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.selector.shutdown();

        let mut cancelled: Vec<PrioritySpawnRequest> = self.queue.clear();
        cancelled.extend(self.in_flight.drain().map(|(_, flight)| flight.request));
        cancelled.sort_by_key(|r| r.request_id);
        let count = cancelled.len();
        for request in cancelled {
            self.conclude_failure(
                request,
                SpawnErrorKind::Cancelled,
                "control plane shutdown".to_string(),
            );
        }
        self.pending_by_zone.clear();
        self.pending_by_map.clear();

        if self.deferred.is_none() {
            loop {
                let report = self.events.process_batch();
                if report.processed == 0 {
                    break;
                }
                self.record_handler_time(report.handler_time);
            }
        }
        info!(
            "Spawn orchestrator shut down with {} bots active, {} requests cancelled",
            self.active.len(),
            count
        );
    }

    // ---- internals ----

    /// Hard gates, priority assignment and enqueue
    fn admit(
        &mut self,
        request: SpawnRequest,
        reason: &str,
    ) -> Result<(), (SpawnErrorKind, SpawnRequest)> {
        if let Err(kind) = self.precheck(&request) {
            return Err((kind, request));
        }

        let priority = self.assign_priority(&request);
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let (zone_id, map_id) = (request.zone_id, request.map_id);
        let queued = PrioritySpawnRequest::new(request_id, request, priority, self.clock.now(), reason);

        let fallback = queued.request.clone();
        match self.queue.enqueue(queued) {
            Ok(evicted) => {
                *self.pending_by_zone.entry(zone_id).or_insert(0) += 1;
                *self.pending_by_map.entry(map_id).or_insert(0) += 1;
                self.counters.total_requested += 1;
                self.performance.record_spawn_request();
                self.events.publish(EventPayload::SpawnRequested {
                    request_id,
                    zone_id,
                    priority,
                    reason: reason.to_string(),
                });
                if let Some(evicted) = evicted {
                    self.conclude_failure(
                        evicted,
                        SpawnErrorKind::CapacityExhausted,
                        "evicted from full spawn queue".to_string(),
                    );
                }
                Ok(())
            }
            Err(QueueError::Duplicate(_)) | Err(QueueError::Full(_)) => {
                Err((SpawnErrorKind::CapacityExhausted, fallback))
            }
        }
    }

    fn precheck(&self, request: &SpawnRequest) -> Result<(), SpawnErrorKind> {
        if !self.config.enabled || self.shut_down {
            return Err(SpawnErrorKind::CapacityExhausted);
        }
        if self.circuit.state() == CircuitState::Open || !self.resources.is_safe_to_spawn() {
            return Err(SpawnErrorKind::ThrottledNow);
        }
        if let Some(character_id) = request.dedup_key() {
            if self.active.contains_key(&character_id) || self.queue.contains(character_id) {
                return Err(SpawnErrorKind::CapacityExhausted);
            }
        }
        if !self.pool.can_allocate()
            || self.active.len() + self.pending_total() >= self.config.max_bots_total as usize
        {
            return Err(SpawnErrorKind::CapacityExhausted);
        }
        let zone_cap = request.zone_cap.unwrap_or(self.config.max_bots_per_zone);
        if !self.population.can_spawn_in_zone(
            request.zone_id,
            zone_cap,
            self.pending_in_zone(request.zone_id),
        ) {
            return Err(SpawnErrorKind::CapacityExhausted);
        }
        if !self.population.can_spawn_on_map(
            request.map_id,
            self.config.max_bots_per_map,
            self.pending_on_map(request.map_id),
        ) {
            return Err(SpawnErrorKind::CapacityExhausted);
        }
        Ok(())
    }

    fn assign_priority(&self, request: &SpawnRequest) -> SpawnPriority {
        match request.spawn_type {
            SpawnType::GroupMember => SpawnPriority::Critical,
            SpawnType::SpecificCharacter | SpawnType::SpecificZone => SpawnPriority::High,
            SpawnType::Random => {
                let phase = self
                    .startup
                    .pending_priority()
                    .unwrap_or(SpawnPriority::Normal);
                if request.requested_by_human {
                    phase.min(SpawnPriority::High)
                } else {
                    phase
                }
            }
        }
    }

    fn refresh_population(&mut self) {
        let reported = self.world.zones_with_players();
        let mut seen = Vec::with_capacity(reported.len());
        for info in reported {
            seen.push(info.zone_id);
            self.population.update_zone(info);
        }
        for zone in self.population.get_all() {
            if !seen.contains(&zone.zone_id) {
                let humans = self.world.human_players_in_zone(zone.zone_id);
                self.population.set_human_count(zone.zone_id, humans);
            }
        }
    }

    fn despawn_surplus(&mut self) -> usize {
        let mut budget = self.config.spawn_batch_size as usize;
        let mut removed = 0;
        for zone in self.population.overpopulated() {
            if budget == 0 {
                break;
            }
            let mut bots: Vec<(Instant, BotId)> = self
                .active
                .iter()
                .filter(|b| b.zone_id == zone.zone_id)
                .map(|b| (b.spawned_at, b.bot_id))
                .collect();
            // newest first
            bots.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
            let take = (zone.surplus() as usize).min(budget);
            for (_, bot_id) in bots.into_iter().take(take) {
                if self.despawn_bot(bot_id, SURPLUS_DESPAWN_REASON) {
                    removed += 1;
                    budget -= 1;
                }
            }
        }
        if removed > 0 {
            info!("Despawned {} surplus bots", removed);
        }
        removed
    }

    fn publish_population(&self, zone_id: ZoneId) {
        if let Some(zone) = self.population.get_population(zone_id) {
            self.events.publish(EventPayload::PopulationChanged {
                zone_id,
                bot_count: zone.bot_count,
                target_bot_count: zone.target_bot_count,
            });
        }
    }

    fn pending_total(&self) -> usize {
        self.queue.len() + self.in_flight.len()
    }

    fn pending_in_zone(&self, zone_id: ZoneId) -> u32 {
        self.pending_by_zone.get(&zone_id).copied().unwrap_or(0)
    }

    fn pending_on_map(&self, map_id: MapId) -> u32 {
        self.pending_by_map.get(&map_id).copied().unwrap_or(0)
    }

    fn release_pending(&mut self, zone_id: ZoneId, map_id: MapId) {
        if let Some(n) = self.pending_by_zone.get_mut(&zone_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.pending_by_zone.remove(&zone_id);
            }
        }
        if let Some(n) = self.pending_by_map.get_mut(&map_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.pending_by_map.remove(&map_id);
            }
        }
    }
}

impl Drop for SpawnOrchestrator {
    fn drop(&mut self) {
        self.selector.shutdown();
    }
}

fn due(last: Option<Instant>, now: Instant, interval_ms: u64) -> bool {
    match last {
        Some(at) => now.saturating_duration_since(at) >= Duration::from_millis(interval_ms),
        None => true,
    }
}

fn trace_release(request: &PrioritySpawnRequest) {
    trace!(
        "Releasing request {} ({}, zone {}, retry {})",
        request.request_id,
        request.priority.as_str(),
        request.request.zone_id,
        request.retry_count
    );
}
