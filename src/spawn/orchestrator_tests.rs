//! End-to-end pipeline tests against the simulated world and store

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use super::error::SpawnErrorKind;
use super::events::{EventPayload, EventType};
use super::factory::ZoneProfile;
use super::orchestrator::{SpawnOrchestrator, RESTART_DESPAWN_REASON, SURPLUS_DESPAWN_REASON};
use super::request::{BotId, CharacterId, Position, SpawnRequest, SpawnType};
use crate::config::SpawnConfig;
use crate::control::{CircuitState, FixedSampler, PressureLevel, ProcessSample, StartupPhase};
use crate::population::ZoneInfo;
use crate::sim::{SimCharacterStore, SimWorldHost};
use crate::util::ManualClock;

struct Harness {
    orch: SpawnOrchestrator,
    clock: Arc<ManualClock>,
    world: Arc<SimWorldHost>,
    store: Arc<SimCharacterStore>,
    sampler: FixedSampler,
}

impl Harness {
    fn new(config: SpawnConfig) -> Self {
        Self::with_world(config, SimWorldHost::new())
    }

    fn with_world(config: SpawnConfig, world: SimWorldHost) -> Self {
        let clock = ManualClock::new();
        let world = Arc::new(world);
        let store = Arc::new(SimCharacterStore::new());
        let sampler = FixedSampler::new(idle_sample());
        let orch = SpawnOrchestrator::new(
            config,
            world.clone(),
            store.clone(),
            Box::new(sampler.clone()),
            clock.clone(),
            Handle::current(),
        )
        .expect("valid config");
        Self {
            orch,
            clock,
            world,
            store,
            sampler,
        }
    }

    async fn tick(&mut self, ms: u64) {
        self.clock.advance_ms(ms);
        self.orch.update();
        settle().await;
    }

    async fn run(&mut self, total_ms: u64, step_ms: u64) {
        for _ in 0..total_ms / step_ms {
            self.tick(step_ms).await;
        }
    }
}

/// Let selection tasks on the test runtime finish
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn idle_sample() -> ProcessSample {
    ProcessSample {
        cpu_percent: 10.0,
        mem_percent: 30.0,
        working_set_mb: 50.0,
    }
}

fn config() -> SpawnConfig {
    let mut config = SpawnConfig::default();
    config.startup.enabled = false;
    config.pool.initial_size = 10;
    config
}

fn zone(zone_id: u32, map_id: u32, humans: u32) -> ZoneInfo {
    ZoneInfo {
        zone_id,
        map_id,
        human_count: humans,
        min_level: 20,
        max_level: 30,
    }
}

fn count_events(orch: &SpawnOrchestrator, event_type: EventType) -> Arc<AtomicU32> {
    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    orch.events().subscribe(event_type, move |_| {
        c.fetch_add(1, Ordering::Relaxed);
    });
    counter
}

type Outcomes = Arc<Mutex<Vec<(bool, Option<BotId>)>>>;

fn tracked(request: SpawnRequest) -> (SpawnRequest, Outcomes) {
    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let request = request.on_complete(move |ok, bot| sink.lock().push((ok, bot)));
    (request, outcomes)
}

#[tokio::test]
async fn test_cold_start_fills_zone() {
    let mut h = Harness::new(config());
    h.store.populate(20, 2, 20, 30);
    h.world.set_zone(zone(12, 0, 5));
    let failed = count_events(&h.orch, EventType::SpawnFailed);
    let completed = count_events(&h.orch, EventType::SpawnCompleted);

    h.run(3_000, 50).await;

    let stats = h.orch.stats();
    assert_eq!(stats.total_spawned, 10);
    assert_eq!(stats.failed_spawns, 0);
    assert_eq!(stats.peak_concurrent, 10);
    assert_eq!(h.orch.zone_population(12).map(|z| z.bot_count), Some(10));
    assert_eq!(h.world.bots_in_zone(12), 10);
    assert_eq!(completed.load(Ordering::Relaxed), 10);
    assert_eq!(failed.load(Ordering::Relaxed), 0);

    h.run(5_000, 50).await;
    assert_eq!(h.orch.active_bot_count(), 10);
}

#[tokio::test]
async fn test_high_pressure_stretches_interval() {
    let mut h = Harness::new(config());
    h.store.populate(20, 2, 20, 30);
    h.world.set_zone(zone(12, 0, 50));
    h.sampler.set(ProcessSample {
        cpu_percent: 80.0,
        mem_percent: 40.0,
        working_set_mb: 50.0,
    });

    h.run(10_000, 50).await;

    let stats = h.orch.stats();
    assert_eq!(stats.pressure, PressureLevel::High);
    assert_eq!(stats.throttler.current_interval_ms, 400);
    assert!(stats.throttler.total_admitted <= 25);
    assert!(stats.throttler.total_admitted >= 20);
    assert!(!stats.failures_by_kind.contains_key("CAPACITY_EXHAUSTED"));
}

#[tokio::test]
async fn test_failure_storm_cycles_breaker() {
    let mut config = config();
    config.selector.cache_validity_ms = 0;
    let mut h = Harness::new(config);
    let characters: Vec<(CharacterId, u8)> = (1..=300).map(|id| (id, 25)).collect();
    h.store.add_account(1, &characters);
    h.store.set_failure_ratio(0.3);
    h.world.set_zone(zone(12, 0, 25));

    for _ in 0..600 {
        h.tick(100).await;
        if h.orch.circuit_state() == CircuitState::Open {
            break;
        }
    }
    assert_eq!(h.orch.circuit_state(), CircuitState::Open);
    h.store.set_failure_ratio(0.0);

    let admitted = h.orch.stats().throttler.total_admitted;
    h.run(50_000, 100).await;
    assert_eq!(h.orch.circuit_state(), CircuitState::Open);
    assert_eq!(h.orch.stats().throttler.total_admitted, admitted);

    for _ in 0..150 {
        h.tick(100).await;
        if h.orch.circuit_state() == CircuitState::HalfOpen {
            break;
        }
    }
    assert_eq!(h.orch.circuit_state(), CircuitState::HalfOpen);

    // One trial spawn per 5 s
    let trials_from = h.orch.stats().throttler.total_admitted;
    h.run(20_000, 100).await;
    let trials = h.orch.stats().throttler.total_admitted - trials_from;
    assert!((4..=5).contains(&trials), "{} trials in 20 s", trials);

    for _ in 0..1_500 {
        h.tick(100).await;
        if h.orch.circuit_state() == CircuitState::Closed {
            break;
        }
    }
    let stats = h.orch.stats();
    assert_eq!(
        stats.circuit_history,
        vec![
            CircuitState::Closed,
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Closed
        ]
    );
    assert!(stats.retries > 0);
}

#[tokio::test]
async fn test_update_cycle_cap_releases_one_per_tick() {
    let mut config = config();
    config.bot_to_player_ratio = 0.0;
    config.despawn_surplus = false;
    config.selector.max_accounts_per_request = 100;
    let mut h = Harness::new(config);
    h.store.populate(60, 1, 20, 30);

    let requests = (0..50).map(|_| SpawnRequest::random(12, 0)).collect();
    assert_eq!(h.orch.spawn_bots(requests), 50);

    h.tick(100).await;
    let stats = h.orch.stats();
    assert_eq!(stats.throttler.total_admitted, 1);
    assert_eq!(stats.queued, 49);

    h.tick(100).await;
    assert_eq!(h.orch.stats().total_spawned, 1);

    h.run(5_000, 100).await;
    let stats = h.orch.stats();
    assert_eq!(stats.total_spawned, 50);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.throttler.update_cycle_throttle_blocks, 49);
}

#[tokio::test]
async fn test_phased_startup_holds_high_priority() {
    let mut config = SpawnConfig::default();
    config.pool.initial_size = 10;
    config.despawn_surplus = false;
    let mut h = Harness::new(config);
    h.store.populate(5, 2, 20, 30);

    let (request, outcomes) = tracked(SpawnRequest::new(SpawnType::SpecificZone, 12, 0));
    assert!(h.orch.spawn_bot(request));
    assert_eq!(h.orch.stats().queue.high, 1);

    h.run(120_000, 1_000).await;
    assert_eq!(h.orch.startup_phase(), StartupPhase::CriticalBots);
    assert_eq!(h.orch.active_bot_count(), 0);
    assert_eq!(h.orch.stats().queued, 1);

    h.run(10_000, 1_000).await;
    assert_eq!(h.orch.startup_phase(), StartupPhase::HighPriority);
    assert_eq!(h.orch.active_bot_count(), 1);
    assert_eq!(h.orch.stats().failed_spawns, 0);
    assert!(matches!(outcomes.lock().as_slice(), [(true, Some(_))]));
}

#[tokio::test]
async fn test_priority_assignment() {
    let mut h = Harness::new(config());
    assert!(h.orch.spawn_bot(SpawnRequest::group_member(12, 0)));
    assert!(h.orch.spawn_bot(SpawnRequest::new(SpawnType::SpecificZone, 12, 0)));
    assert!(h
        .orch
        .spawn_bot(SpawnRequest::specific_character(77, 12, 0).requested_by_human()));
    assert!(h.orch.spawn_bot(SpawnRequest::specific_character(78, 12, 0)));
    assert!(h.orch.spawn_bot(SpawnRequest::random(12, 0)));
    assert!(h.orch.spawn_bot(SpawnRequest::random(12, 0).requested_by_human()));

    let queue = h.orch.stats().queue;
    assert_eq!(queue.critical, 1);
    assert_eq!(queue.high, 4);
    assert_eq!(queue.normal, 1);
}

#[tokio::test]
async fn test_spawn_from_registered_template() {
    let mut h = Harness::new(config());
    h.store.populate(5, 2, 20, 30);
    let camp = Position {
        x: 10.0,
        y: 20.0,
        z: 5.0,
    };
    h.orch.register_zone_profile(
        14,
        ZoneProfile {
            pvp_enabled: true,
            default_position: Some(camp),
        },
    );
    let (template, outcomes) =
        tracked(SpawnRequest::new(SpawnType::SpecificZone, 14, 1).with_levels(20, 30));
    h.orch.register_template("border-patrol", template);

    assert!(!h.orch.spawn_from_template("missing"));
    assert_eq!(h.orch.stats().rejected_requests, 1);

    assert!(h.orch.spawn_from_template("border-patrol"));
    assert_eq!(h.orch.stats().queue.high, 1);
    h.run(500, 100).await;

    let bot_id = match outcomes.lock().as_slice() {
        [(true, Some(bot_id))] => *bot_id,
        other => panic!("unexpected outcomes {:?}", other),
    };
    let bot = h.world.bot(bot_id).expect("bot in world");
    assert_eq!(bot.zone_id, 14);
    let profile = bot.session.expect("session bound").profile();
    assert!(profile.pvp_enabled);
    assert_eq!(profile.position, Some(camp));
    assert!((20..=30).contains(&profile.level));
    assert_eq!(h.orch.stats().factory.created, 1);
}

#[tokio::test]
async fn test_caps_hold_across_zones() {
    let mut config = config();
    config.max_bots_total = 8;
    let mut h = Harness::new(config);
    h.store.populate(20, 2, 20, 30);
    h.world.set_zone(zone(12, 0, 10));
    h.world.set_zone(zone(14, 1, 10));

    for _ in 0..200 {
        h.tick(50).await;
        let stats = h.orch.stats();
        assert!(stats.active_bots + stats.queued + stats.in_flight <= 8);
    }
    assert_eq!(h.orch.active_bot_count(), 8);
    assert!(!h.orch.can_spawn_more());
}

#[tokio::test]
async fn test_specific_character_spawns_once() {
    let mut h = Harness::new(config());
    h.store.add_account(3, &[(300, 25)]);

    let (request, outcomes) = tracked(
        SpawnRequest::specific_character(300, 12, 0).requested_by_human(),
    );
    assert!(h.orch.spawn_bot(request));
    h.run(500, 100).await;

    assert_eq!(*outcomes.lock(), vec![(true, Some(300))]);
    assert!(h.orch.is_bot_active(300));
    assert_eq!(h.world.bot(300).map(|b| b.zone_id), Some(12));

    let (again, again_outcomes) = tracked(SpawnRequest::specific_character(300, 12, 0));
    assert!(!h.orch.spawn_bot(again));
    assert_eq!(*again_outcomes.lock(), vec![(false, None)]);
    assert_eq!(h.orch.stats().rejected_requests, 1);
}

#[tokio::test]
async fn test_no_suitable_character_is_final() {
    let mut h = Harness::new(config());
    h.store.add_account(1, &[(10, 5)]);

    let (request, outcomes) = tracked(
        SpawnRequest::random(12, 0)
            .with_levels(20, 30)
            .without_creation(),
    );
    assert!(h.orch.spawn_bot(request));
    h.run(1_000, 100).await;

    assert_eq!(*outcomes.lock(), vec![(false, None)]);
    let stats = h.orch.stats();
    assert_eq!(stats.failed_spawns, 1);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.failures_by_kind.get("NO_SUITABLE_CHARACTER"), Some(&1));
    assert_eq!(stats.circuit.total_failures, 0);
}

#[tokio::test]
async fn test_bind_rejection_retries_once() {
    let mut h = Harness::new(config());
    h.store.populate(5, 2, 20, 30);
    h.world.reject_binds(true);
    let failed = count_events(&h.orch, EventType::SpawnFailed);

    let (request, outcomes) = tracked(SpawnRequest::random(12, 0));
    assert!(h.orch.spawn_bot(request));
    h.run(1_000, 100).await;

    assert_eq!(*outcomes.lock(), vec![(false, None)]);
    let stats = h.orch.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.failed_spawns, 1);
    assert_eq!(stats.failures_by_kind.get("WORLD_BIND_REJECTED"), Some(&1));
    assert_eq!(stats.circuit.total_failures, 2);
    assert_eq!(failed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.pool.active, 0);
}

#[tokio::test]
async fn test_surplus_despawns_newest_first() {
    let mut h = Harness::new(config());
    h.store.populate(20, 2, 20, 30);
    h.world.set_zone(zone(12, 0, 5));

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    h.orch.events().subscribe(EventType::SpawnCompleted, move |event| {
        if let EventPayload::SpawnCompleted { bot_id, .. } = &event.payload {
            sink.lock().push(*bot_id);
        }
    });

    h.run(3_000, 50).await;
    assert_eq!(h.orch.active_bot_count(), 10);

    h.world.set_humans(12, 2);
    h.orch.on_player_login();
    h.tick(50).await;

    assert_eq!(h.orch.active_bot_count(), 4);
    let spawned = order.lock().clone();
    for oldest in &spawned[..4] {
        assert!(h.orch.is_bot_active(*oldest));
    }
    let despawned = h.world.despawned();
    assert_eq!(despawned.len(), 6);
    assert!(despawned.iter().all(|(_, reason)| reason == SURPLUS_DESPAWN_REASON));
    assert_eq!(h.orch.zone_population(12).map(|z| z.bot_count), Some(4));
}

#[tokio::test]
async fn test_restart_despawns_orphans() {
    let world = SimWorldHost::new();
    world.preload_bots(12, &[900, 901]);
    let h = Harness::with_world(config(), world);

    let despawned = h.world.despawned();
    assert_eq!(despawned.len(), 2);
    assert!(despawned.iter().all(|(_, reason)| reason == RESTART_DESPAWN_REASON));
    assert_eq!(h.world.bot_count(), 0);
    assert_eq!(h.orch.active_bot_count(), 0);
}

#[tokio::test]
async fn test_despawn_returns_session() {
    let mut h = Harness::new(config());
    h.store.add_account(3, &[(300, 25)]);
    assert!(h.orch.spawn_bot(SpawnRequest::specific_character(300, 12, 0)));
    h.run(500, 100).await;
    assert_eq!(h.orch.stats().pool.active, 1);

    assert!(h.orch.despawn_bot(300, "test"));
    assert!(!h.orch.despawn_bot(300, "test"));
    let stats = h.orch.stats();
    assert_eq!(stats.total_despawned, 1);
    assert_eq!(stats.pool.active, 0);
    assert!(!h.orch.is_bot_active(300));
    assert_eq!(h.orch.zone_population(12).map(|z| z.bot_count), Some(0));
    assert!(h.world.bot(300).is_none());

    // character is free again
    assert!(h.orch.spawn_bot(SpawnRequest::specific_character(300, 12, 0)));
    h.run(500, 100).await;
    assert!(h.orch.is_bot_active(300));
}

#[tokio::test]
async fn test_disabled_rejects_requests() {
    let mut h = Harness::new(config());
    h.orch.set_enabled(false);
    let (request, outcomes) = tracked(SpawnRequest::random(12, 0));
    assert!(!h.orch.spawn_bot(request));
    assert_eq!(*outcomes.lock(), vec![(false, None)]);
    assert_eq!(h.orch.stats().rejected_requests, 1);
}

#[tokio::test]
async fn test_shutdown_concludes_queued_requests() {
    let mut h = Harness::new(config());
    h.store.populate(5, 2, 20, 30);
    let requested = count_events(&h.orch, EventType::SpawnRequested);
    let failed = Arc::new(Mutex::new(Vec::new()));
    let sink = failed.clone();
    h.orch.events().subscribe(EventType::SpawnFailed, move |event| {
        if let EventPayload::SpawnFailed { request_id, kind, .. } = &event.payload {
            sink.lock().push((*request_id, *kind));
        }
    });
    let outcomes: Vec<Outcomes> = (0..3)
        .map(|_| {
            let (request, outcomes) = tracked(SpawnRequest::random(12, 0));
            assert!(h.orch.spawn_bot(request));
            outcomes
        })
        .collect();

    // one request leaves the queue before selection reports back
    h.clock.advance_ms(100);
    h.orch.update();
    let stats = h.orch.stats();
    assert_eq!(stats.queued + stats.in_flight, 3);

    h.orch.shutdown();
    for outcome in &outcomes {
        assert_eq!(*outcome.lock(), vec![(false, None)]);
    }
    assert_eq!(requested.load(Ordering::Relaxed), 3);
    assert_eq!(
        *failed.lock(),
        vec![
            (1, SpawnErrorKind::Cancelled),
            (2, SpawnErrorKind::Cancelled),
            (3, SpawnErrorKind::Cancelled),
        ]
    );
    let stats = h.orch.stats();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.failures_by_kind.get("CANCELLED"), Some(&3));
    assert_eq!(stats.circuit_state, CircuitState::Closed);
    assert!(!h.orch.spawn_bot(SpawnRequest::random(12, 0)));
    h.tick(100).await;
    assert_eq!(h.orch.active_bot_count(), 0);
}

#[tokio::test]
async fn test_reload_config() {
    let mut h = Harness::new(config());

    let mut invalid = config();
    invalid.max_bots_total = 0;
    assert!(h.orch.reload_config(invalid).is_err());
    assert_eq!(h.orch.config().max_bots_total, 500);

    let mut next = config();
    next.max_bots_total = 20;
    next.throttle.base_interval_ms = 200;
    assert!(h.orch.reload_config(next).is_ok());
    assert_eq!(h.orch.config().max_bots_total, 20);
    h.tick(50).await;
    assert_eq!(h.orch.stats().throttler.current_interval_ms, 200);
}
