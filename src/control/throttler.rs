//! Adaptive spawn throttler
//!
//! Folds resource pressure, circuit state, startup phase and burst history
//! into a spawn interval and answers whether a spawn may be admitted now.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitState, SpawnCircuitBreaker};
use super::resource_monitor::PressureLevel;
use crate::config::ThrottleConfig;
use crate::util::SharedClock;

/// Interval factor while the burst flag is raised
const BURST_MULTIPLIER: f64 = 0.5;

/// Outcome of a permit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    CircuitOpen,
    /// Half-open breaker with its trial slot already used
    CircuitTrialPending,
    PressureCritical,
    UpdateCycleCap,
    BurstCutoff,
    Interval { remaining_ms: u64 },
}

impl ThrottleDecision {
    pub fn is_allowed(self) -> bool {
        self == ThrottleDecision::Allowed
    }

    /// Blocks that will not clear by waiting for the next tick alone
    pub fn is_hard_gate(self) -> bool {
        matches!(
            self,
            ThrottleDecision::CircuitOpen | ThrottleDecision::PressureCritical
        )
    }
}

/// Throttler statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThrottlerStats {
    pub current_interval_ms: u64,
    pub spawns_this_update_cycle: u32,
    pub burst_window_count: usize,
    pub burst_detected: bool,
    pub total_admitted: u64,
    pub successes: u64,
    pub failures: u64,
    pub update_cycle_throttle_blocks: u64,
    pub interval_blocks: u64,
    pub burst_blocks: u64,
    pub circuit_blocks: u64,
    pub pressure_blocks: u64,
}

pub struct AdaptiveThrottler {
    config: ThrottleConfig,
    clock: SharedClock,
    current_interval_ms: u64,
    last_spawn_at: Option<Instant>,
    recent_spawn_times: VecDeque<Instant>,
    spawns_this_update_cycle: u32,
    burst_detected: bool,
    pressure: PressureLevel,
    circuit_state: CircuitState,
    circuit_permits: bool,
    phase_multiplier: f64,
    stats: ThrottlerStats,
}

impl AdaptiveThrottler {
    pub fn new(config: ThrottleConfig, clock: SharedClock) -> Self {
        let current_interval_ms = config.base_interval_ms.clamp(
            config.min_interval_ms,
            config.max_interval_ms.max(config.min_interval_ms),
        );
        Self {
            config,
            clock,
            current_interval_ms,
            last_spawn_at: None,
            recent_spawn_times: VecDeque::new(),
            spawns_this_update_cycle: 0,
            burst_detected: false,
            pressure: PressureLevel::Normal,
            circuit_state: CircuitState::Closed,
            circuit_permits: true,
            phase_multiplier: 1.0,
            stats: ThrottlerStats::default(),
        }
    }

    /// Per-tick refresh from the resource monitor and circuit breaker
    pub fn update(&mut self, pressure: PressureLevel, circuit: &SpawnCircuitBreaker) {
        self.pressure = pressure;
        self.observe_circuit(circuit);
        self.prune_burst_window(self.clock.now());
        self.recompute_interval();
    }

    /// Re-read the breaker between admissions of the same tick
    pub fn observe_circuit(&mut self, circuit: &SpawnCircuitBreaker) {
        self.circuit_state = circuit.state();
        self.circuit_permits = circuit.allow_spawn();
    }

    pub fn set_phase_multiplier(&mut self, multiplier: f64) {
        if (self.phase_multiplier - multiplier).abs() > f64::EPSILON {
            debug!("Throttler phase multiplier {:.2}", multiplier);
            self.phase_multiplier = multiplier;
            self.recompute_interval();
        }
    }

    /// Permit check with the reason for a refusal
    pub fn check(&self) -> ThrottleDecision {
        match self.circuit_state {
            CircuitState::Open => return ThrottleDecision::CircuitOpen,
            CircuitState::HalfOpen if !self.circuit_permits => {
                return ThrottleDecision::CircuitTrialPending
            }
            _ => {}
        }
        if self.pressure == PressureLevel::Critical {
            return ThrottleDecision::PressureCritical;
        }
        if self.spawns_this_update_cycle >= self.config.max_spawns_per_update_cycle {
            return ThrottleDecision::UpdateCycleCap;
        }

        let now = self.clock.now();
        if self.burst_count_at(now) >= self.config.max_bursts_per_window as usize {
            return ThrottleDecision::BurstCutoff;
        }
        if let Some(last) = self.last_spawn_at {
            let elapsed = now.saturating_duration_since(last).as_millis() as u64;
            if elapsed < self.current_interval_ms {
                return ThrottleDecision::Interval {
                    remaining_ms: self.current_interval_ms - elapsed,
                };
            }
        }
        ThrottleDecision::Allowed
    }

    pub fn can_spawn_now(&self) -> bool {
        self.check().is_allowed()
    }

    /// A request left the queue for selection
    pub fn record_admission(&mut self) {
        let now = self.clock.now();
        self.last_spawn_at = Some(now);
        self.recent_spawn_times.push_back(now);
        self.spawns_this_update_cycle += 1;
        self.stats.total_admitted += 1;

        self.prune_burst_window(now);
        if !self.burst_detected
            && self.recent_spawn_times.len() >= self.config.max_bursts_per_window as usize
        {
            warn!(
                "Spawn burst detected: {} spawns within {}ms",
                self.recent_spawn_times.len(),
                self.config.burst_window_ms
            );
            self.burst_detected = true;
            self.recompute_interval();
        }
    }

    pub fn record_spawn_success(&mut self) {
        self.stats.successes += 1;
    }

    /// Failures only feed the breaker
    pub fn record_spawn_failure(&mut self, circuit: &mut SpawnCircuitBreaker, reason: &str) {
        self.stats.failures += 1;
        circuit.record_failure(reason);
        self.observe_circuit(circuit);
    }

    pub fn on_tick_boundary(&mut self) {
        self.spawns_this_update_cycle = 0;
    }

    /// Count a refusal that stopped the release loop
    pub fn note_block(&mut self, decision: ThrottleDecision) {
        match decision {
            ThrottleDecision::Allowed => {}
            ThrottleDecision::CircuitOpen | ThrottleDecision::CircuitTrialPending => {
                self.stats.circuit_blocks += 1
            }
            ThrottleDecision::PressureCritical => self.stats.pressure_blocks += 1,
            ThrottleDecision::UpdateCycleCap => self.stats.update_cycle_throttle_blocks += 1,
            ThrottleDecision::BurstCutoff => self.stats.burst_blocks += 1,
            ThrottleDecision::Interval { .. } => self.stats.interval_blocks += 1,
        }
    }

    pub fn current_interval_ms(&self) -> u64 {
        self.current_interval_ms
    }

    pub fn spawns_this_update_cycle(&self) -> u32 {
        self.spawns_this_update_cycle
    }

    pub fn burst_window_count(&self) -> usize {
        self.burst_count_at(self.clock.now())
    }

    pub fn is_burst_detected(&self) -> bool {
        self.burst_detected
    }

    pub fn stats(&self) -> ThrottlerStats {
        ThrottlerStats {
            current_interval_ms: self.current_interval_ms,
            spawns_this_update_cycle: self.spawns_this_update_cycle,
            burst_window_count: self.burst_window_count(),
            burst_detected: self.burst_detected,
            ..self.stats.clone()
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = ThrottlerStats::default();
    }

    pub fn set_config(&mut self, config: ThrottleConfig) {
        self.config = config;
        self.recompute_interval();
    }

    fn burst_count_at(&self, now: Instant) -> usize {
        let window = Duration::from_millis(self.config.burst_window_ms);
        self.recent_spawn_times
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    fn prune_burst_window(&mut self, now: Instant) {
        let window = Duration::from_millis(self.config.burst_window_ms);
        while let Some(front) = self.recent_spawn_times.front() {
            if now.saturating_duration_since(*front) >= window {
                self.recent_spawn_times.pop_front();
            } else {
                break;
            }
        }
        if self.burst_detected
            && self.recent_spawn_times.len() <= (self.config.max_bursts_per_window / 2) as usize
        {
            debug!("Spawn burst window drained");
            self.burst_detected = false;
            self.recompute_interval();
        }
    }

    fn recompute_interval(&mut self) {
        let pressure_mult = self.pressure.multiplier(&self.config.pressure_multipliers);
        let burst_mult = if self.burst_detected { BURST_MULTIPLIER } else { 1.0 };
        let product =
            pressure_mult * self.circuit_state.multiplier() * burst_mult * self.phase_multiplier;

        let min = self.config.min_interval_ms;
        let max = self.config.max_interval_ms.max(min);
        self.current_interval_ms = if product <= 0.0 {
            max
        } else {
            let raw = (self.config.base_interval_ms as f64 / product).round();
            (raw as u64).clamp(min, max)
        };
    }
}
