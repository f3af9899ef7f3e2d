//! Spawn circuit breaker
//!
//! Watches spawn outcomes over a sliding window and blocks new spawns during a
//! failure storm. Recovery goes through a half-open phase that admits one
//! trial spawn per interval.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::CircuitConfig;
use crate::util::SharedClock;

/// Transitions remembered for operators
const MAX_TRANSITIONS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    /// Throttler mixing factor
    pub fn multiplier(self) -> f64 {
        match self {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CircuitAttempt {
    at: Instant,
    success: bool,
}

/// One state change
#[derive(Debug, Clone, Serialize)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Breaker metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_rate_pct: f64,
    pub window_attempts: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    pub time_in_state_ms: u64,
    pub last_failure_reason: Option<String>,
}

/// Sliding-window circuit breaker for the spawn pipeline
pub struct SpawnCircuitBreaker {
    config: CircuitConfig,
    clock: SharedClock,
    state: CircuitState,
    state_entered_at: Instant,
    next_trial_allowed_at: Instant,
    window: VecDeque<CircuitAttempt>,
    /// Outcomes since entering half-open
    recovery_successes: u32,
    recovery_failures: u32,
    total_attempts: u64,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
    last_failure_reason: Option<String>,
    transitions: VecDeque<CircuitTransition>,
}

impl SpawnCircuitBreaker {
    pub fn new(config: CircuitConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: CircuitState::Closed,
            state_entered_at: now,
            next_trial_allowed_at: now,
            window: VecDeque::new(),
            recovery_successes: 0,
            recovery_failures: 0,
            total_attempts: 0,
            total_successes: 0,
            total_failures: 0,
            times_opened: 0,
            last_failure_reason: None,
            transitions: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a spawn may start right now
    pub fn allow_spawn(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.clock.now() >= self.next_trial_allowed_at,
            CircuitState::Open => false,
        }
    }

    /// A spawn was dispatched. In half-open this consumes the trial slot.
    pub fn record_attempt(&mut self) {
        self.total_attempts += 1;
        if self.state == CircuitState::HalfOpen {
            self.next_trial_allowed_at =
                self.clock.now() + Duration::from_millis(self.config.trial_interval_ms);
        }
    }

    pub fn record_success(&mut self) {
        let now = self.clock.now();
        self.total_successes += 1;
        self.push(CircuitAttempt { at: now, success: true });
        if self.state == CircuitState::HalfOpen {
            self.recovery_successes += 1;
        }
    }

    pub fn record_failure(&mut self, reason: &str) {
        let now = self.clock.now();
        self.total_failures += 1;
        self.last_failure_reason = Some(reason.to_string());
        self.push(CircuitAttempt { at: now, success: false });

        match self.state {
            CircuitState::HalfOpen => {
                self.recovery_failures += 1;
                warn!("Spawn failure during recovery trial: {}", reason);
                self.transition(CircuitState::Open);
            }
            CircuitState::Closed => self.evaluate_trip(),
            CircuitState::Open => {}
        }
    }

    /// Advance time-based transitions
    pub fn update(&mut self) {
        let now = self.clock.now();
        self.prune(now);

        let in_state = now.saturating_duration_since(self.state_entered_at);
        match self.state {
            CircuitState::Closed => self.evaluate_trip(),
            CircuitState::Open => {
                if in_state >= Duration::from_millis(self.config.cooldown_ms) {
                    self.transition(CircuitState::HalfOpen);
                }
            }
            CircuitState::HalfOpen => {
                if in_state >= Duration::from_millis(self.config.recovery_ms)
                    && self.recovery_failure_pct() < self.config.close_threshold_pct
                {
                    self.transition(CircuitState::Closed);
                }
            }
        }
    }

    /// Emergency manual override: back to a fresh closed breaker
    pub fn reset(&mut self) {
        warn!("Spawn circuit breaker manually reset (was {})", self.state.as_str());
        *self = Self::new(self.config.clone(), self.clock.clone());
    }

    /// Failure percentage over the sliding window
    pub fn failure_rate_pct(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|a| !a.success).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }

    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            state: self.state,
            failure_rate_pct: self.failure_rate_pct(),
            window_attempts: self.window.len(),
            total_attempts: self.total_attempts,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            times_opened: self.times_opened,
            time_in_state_ms: self
                .clock
                .now()
                .saturating_duration_since(self.state_entered_at)
                .as_millis() as u64,
            last_failure_reason: self.last_failure_reason.clone(),
        }
    }

    /// States visited so far, oldest first (starting from the initial state)
    pub fn state_history(&self) -> Vec<CircuitState> {
        let mut states = Vec::with_capacity(self.transitions.len() + 1);
        match self.transitions.front() {
            Some(first) => states.push(first.from),
            None => states.push(self.state),
        }
        states.extend(self.transitions.iter().map(|t| t.to));
        states
    }

    pub fn transitions(&self) -> impl Iterator<Item = &CircuitTransition> {
        self.transitions.iter()
    }

    pub fn set_config(&mut self, config: CircuitConfig) {
        self.config = config;
    }

    fn push(&mut self, attempt: CircuitAttempt) {
        self.window.push_back(attempt);
        self.prune(attempt.at);
    }

    fn prune(&mut self, now: Instant) {
        let window = Duration::from_millis(self.config.window_ms);
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(front.at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn evaluate_trip(&mut self) {
        if self.window.len() < self.config.minimum_attempts as usize {
            return;
        }
        let rate = self.failure_rate_pct();
        if rate > self.config.open_threshold_pct {
            warn!(
                "Spawn circuit breaker tripped: {:.1}% failures over {} attempts",
                rate,
                self.window.len()
            );
            self.transition(CircuitState::Open);
        }
    }

    fn recovery_failure_pct(&self) -> f64 {
        let total = self.recovery_successes + self.recovery_failures;
        if total == 0 {
            0.0
        } else {
            self.recovery_failures as f64 * 100.0 / total as f64
        }
    }

    fn transition(&mut self, to: CircuitState) {
        if self.state == to {
            return;
        }
        let now = self.clock.now();
        info!("Spawn circuit {} -> {}", self.state.as_str(), to.as_str());

        self.transitions.push_back(CircuitTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        while self.transitions.len() > MAX_TRANSITIONS {
            self.transitions.pop_front();
        }

        self.state = to;
        self.state_entered_at = now;
        match to {
            CircuitState::Open => self.times_opened += 1,
            CircuitState::HalfOpen => {
                self.next_trial_allowed_at = now;
                self.recovery_successes = 0;
                self.recovery_failures = 0;
            }
            CircuitState::Closed => {}
        }
    }
}
