//! Phased startup
//!
//! After a cold start the queue is released in priority tiers, each tier
//! getting its own wall-clock window, target and rate multiplier.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::StartupConfig;
use crate::spawn::request::SpawnPriority;
use crate::util::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StartupPhase {
    Idle,
    CriticalBots,
    HighPriority,
    NormalBots,
    LowPriority,
    Completed,
}

impl StartupPhase {
    /// Name used by the `Phase.<Name>.*` configuration keys
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "CriticalBots" => Some(StartupPhase::CriticalBots),
            "HighPriority" => Some(StartupPhase::HighPriority),
            "NormalBots" => Some(StartupPhase::NormalBots),
            "LowPriority" => Some(StartupPhase::LowPriority),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StartupPhase::Idle => "IDLE",
            StartupPhase::CriticalBots => "CRITICAL_BOTS",
            StartupPhase::HighPriority => "HIGH_PRIORITY",
            StartupPhase::NormalBots => "NORMAL_BOTS",
            StartupPhase::LowPriority => "LOW_PRIORITY",
            StartupPhase::Completed => "COMPLETED",
        }
    }
}

/// One startup tier
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseConfig {
    pub phase: StartupPhase,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    pub target_bots_to_spawn: u32,
    /// Lowest priority released in this phase
    pub allowed_priority: SpawnPriority,
    pub rate_multiplier: f64,
}

impl PhaseConfig {
    pub fn default_table() -> Vec<PhaseConfig> {
        vec![
            PhaseConfig {
                phase: StartupPhase::CriticalBots,
                min_duration_secs: 120,
                max_duration_secs: 180,
                target_bots_to_spawn: 100,
                allowed_priority: SpawnPriority::Critical,
                rate_multiplier: 1.0,
            },
            PhaseConfig {
                phase: StartupPhase::HighPriority,
                min_duration_secs: 180,
                max_duration_secs: 300,
                target_bots_to_spawn: 500,
                allowed_priority: SpawnPriority::High,
                rate_multiplier: 0.75,
            },
            PhaseConfig {
                phase: StartupPhase::NormalBots,
                min_duration_secs: 600,
                max_duration_secs: 900,
                target_bots_to_spawn: 3000,
                allowed_priority: SpawnPriority::Normal,
                rate_multiplier: 0.5,
            },
            PhaseConfig {
                phase: StartupPhase::LowPriority,
                min_duration_secs: 900,
                max_duration_secs: 1200,
                target_bots_to_spawn: 1400,
                allowed_priority: SpawnPriority::Low,
                rate_multiplier: 0.3,
            },
        ]
    }
}

/// Operator view of startup progress
#[derive(Debug, Clone, Serialize)]
pub struct StartupStatus {
    pub phase: StartupPhase,
    pub allowed_priority: Option<SpawnPriority>,
    pub elapsed_in_phase_secs: u64,
    pub spawned_this_phase: u32,
    pub phase_target: u32,
    pub total_spawned: u64,
    pub aborted: bool,
}

pub struct StartupOrchestrator {
    config: StartupConfig,
    clock: SharedClock,
    phase: StartupPhase,
    /// Index into `config.phases` while a tier is running
    current: Option<usize>,
    created_at: Instant,
    phase_started_at: Instant,
    spawned_this_phase: u32,
    total_spawned: u64,
    aborted: bool,
}

impl StartupOrchestrator {
    pub fn new(config: StartupConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        let phase = if config.enabled && !config.phases.is_empty() {
            StartupPhase::Idle
        } else {
            StartupPhase::Completed
        };
        Self {
            config,
            clock,
            phase,
            current: None,
            created_at: now,
            phase_started_at: now,
            spawned_this_phase: 0,
            total_spawned: 0,
            aborted: false,
        }
    }

    pub fn phase(&self) -> StartupPhase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase == StartupPhase::Completed
    }

    /// Advance phases. `has_queued_at_allowed` tells whether the queue still
    /// holds work the current phase may release. Returns the new phase on a
    /// transition.
    pub fn update(&mut self, has_queued_at_allowed: bool) -> Option<StartupPhase> {
        let now = self.clock.now();
        match self.phase {
            StartupPhase::Completed => None,
            StartupPhase::Idle => {
                let delay = Duration::from_secs(self.config.initial_delay_secs);
                if now.saturating_duration_since(self.created_at) >= delay {
                    self.enter(Some(0));
                    Some(self.phase)
                } else {
                    None
                }
            }
            _ => {
                let cfg = self.current_config()?;
                let elapsed = now.saturating_duration_since(self.phase_started_at);
                if elapsed < Duration::from_secs(cfg.min_duration_secs) {
                    return None;
                }
                let target_met = self.spawned_this_phase >= cfg.target_bots_to_spawn;
                let timed_out = elapsed >= Duration::from_secs(cfg.max_duration_secs);
                if target_met || timed_out || !has_queued_at_allowed {
                    self.advance();
                    Some(self.phase)
                } else {
                    None
                }
            }
        }
    }

    /// Whether the current phase releases requests of `priority`
    pub fn allows(&self, priority: SpawnPriority) -> bool {
        match self.allowed_priority() {
            Some(allowed) => allowed.covers(priority),
            None => false,
        }
    }

    /// Lowest releasable priority; `None` before the first phase
    pub fn allowed_priority(&self) -> Option<SpawnPriority> {
        match self.phase {
            StartupPhase::Idle => None,
            StartupPhase::Completed => Some(SpawnPriority::Low),
            _ => self.current_config().map(|c| c.allowed_priority),
        }
    }

    /// Priority of the tier that runs now or next; `None` once complete
    pub fn pending_priority(&self) -> Option<SpawnPriority> {
        match self.phase {
            StartupPhase::Completed => None,
            StartupPhase::Idle => self.config.phases.first().map(|p| p.allowed_priority),
            _ => self.allowed_priority(),
        }
    }

    pub fn should_release_next(&self, top: Option<SpawnPriority>, throttle_ok: bool) -> bool {
        match top {
            Some(priority) => throttle_ok && self.allows(priority),
            None => false,
        }
    }

    pub fn rate_multiplier(&self) -> f64 {
        self.current_config().map(|c| c.rate_multiplier).unwrap_or(1.0)
    }

    pub fn record_spawn(&mut self) {
        self.total_spawned += 1;
        if self.current.is_some() {
            self.spawned_this_phase += 1;
        }
    }

    /// Administrative skip to the next tier
    pub fn force_next(&mut self) -> StartupPhase {
        match self.phase {
            StartupPhase::Completed => {}
            StartupPhase::Idle => self.enter(Some(0)),
            _ => self.advance(),
        }
        info!("Startup phase forced to {}", self.phase.as_str());
        self.phase
    }

    /// Stop gating entirely
    pub fn abort(&mut self) {
        if self.phase != StartupPhase::Completed {
            warn!("Phased startup aborted in {}", self.phase.as_str());
            self.aborted = true;
            self.enter(None);
        }
    }

    pub fn status(&self) -> StartupStatus {
        StartupStatus {
            phase: self.phase,
            allowed_priority: self.allowed_priority(),
            elapsed_in_phase_secs: self
                .clock
                .now()
                .saturating_duration_since(self.phase_started_at)
                .as_secs(),
            spawned_this_phase: self.spawned_this_phase,
            phase_target: self.current_config().map(|c| c.target_bots_to_spawn).unwrap_or(0),
            total_spawned: self.total_spawned,
            aborted: self.aborted,
        }
    }

    /// Swap the phase table. The running tier keeps its start time.
    pub fn set_config(&mut self, config: StartupConfig) {
        let running = self.phase;
        self.config = config;
        if !self.config.enabled {
            self.enter(None);
            return;
        }
        self.current = self.config.phases.iter().position(|p| p.phase == running);
        if self.current.is_none() && running != StartupPhase::Idle {
            self.enter(None);
        }
    }

    fn current_config(&self) -> Option<&PhaseConfig> {
        self.current.and_then(|i| self.config.phases.get(i))
    }

    fn advance(&mut self) {
        let next = self.current.map(|i| i + 1).filter(|i| *i < self.config.phases.len());
        self.enter(next);
    }

    fn enter(&mut self, index: Option<usize>) {
        let previous = self.phase;
        self.current = index.filter(|i| *i < self.config.phases.len());
        self.phase = match self.current_config() {
            Some(cfg) => cfg.phase,
            None => StartupPhase::Completed,
        };
        self.phase_started_at = self.clock.now();
        self.spawned_this_phase = 0;
        info!(
            "Startup phase {} -> {} ({} bots spawned so far)",
            previous.as_str(),
            self.phase.as_str(),
            self.total_spawned
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;
    use std::sync::Arc;

    fn orchestrator(delay: u64) -> (StartupOrchestrator, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let config = StartupConfig {
            initial_delay_secs: delay,
            ..StartupConfig::default()
        };
        (StartupOrchestrator::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_idle_until_initial_delay() {
        let (mut o, clock) = orchestrator(5);
        assert_eq!(o.phase(), StartupPhase::Idle);
        assert!(!o.allows(SpawnPriority::Critical));

        clock.advance_ms(4_999);
        assert_eq!(o.update(true), None);
        clock.advance_ms(1);
        assert_eq!(o.update(true), Some(StartupPhase::CriticalBots));
        assert!(o.allows(SpawnPriority::Critical));
        assert!(!o.allows(SpawnPriority::High));
    }

    #[test]
    fn test_disabled_starts_completed() {
        let clock = ManualClock::new();
        let config = StartupConfig {
            enabled: false,
            ..StartupConfig::default()
        };
        let o = StartupOrchestrator::new(config, clock);
        assert!(o.is_complete());
        assert!(o.allows(SpawnPriority::Low));
        assert_eq!(o.rate_multiplier(), 1.0);
    }

    #[test]
    fn test_high_request_waits_for_phase_two() {
        let (mut o, clock) = orchestrator(0);
        o.update(true);
        assert_eq!(o.phase(), StartupPhase::CriticalBots);

        for _ in 0..119 {
            clock.advance_ms(1_000);
            o.update(false);
            assert!(!o.should_release_next(Some(SpawnPriority::High), true));
        }
        clock.advance_ms(1_000);
        assert_eq!(o.update(false), Some(StartupPhase::HighPriority));
        assert!(o.should_release_next(Some(SpawnPriority::High), true));
        assert!(!o.should_release_next(Some(SpawnPriority::High), false));
        assert_eq!(o.rate_multiplier(), 0.75);
    }

    #[test]
    fn test_stays_while_work_queued_until_max() {
        let (mut o, clock) = orchestrator(0);
        o.update(true);
        clock.advance_ms(150_000);
        assert_eq!(o.update(true), None);
        clock.advance_ms(30_000);
        assert_eq!(o.update(true), Some(StartupPhase::HighPriority));
    }

    #[test]
    fn test_target_met_advances_after_min() {
        let (mut o, clock) = orchestrator(0);
        o.update(true);
        for _ in 0..100 {
            o.record_spawn();
        }
        clock.advance_ms(60_000);
        assert_eq!(o.update(true), None);
        clock.advance_ms(60_000);
        assert_eq!(o.update(true), Some(StartupPhase::HighPriority));
        assert_eq!(o.status().spawned_this_phase, 0);
        assert_eq!(o.status().total_spawned, 100);
    }

    #[test]
    fn test_runs_to_completion() {
        let (mut o, clock) = orchestrator(0);
        o.update(false);
        let mut seen = vec![o.phase()];
        for _ in 0..4 {
            clock.advance_ms(1_200_000);
            if let Some(p) = o.update(false) {
                seen.push(p);
            }
        }
        assert_eq!(
            seen,
            vec![
                StartupPhase::CriticalBots,
                StartupPhase::HighPriority,
                StartupPhase::NormalBots,
                StartupPhase::LowPriority,
                StartupPhase::Completed
            ]
        );
        assert!(o.allows(SpawnPriority::Low));
    }

    #[test]
    fn test_force_next_and_abort() {
        let (mut o, _) = orchestrator(5);
        assert_eq!(o.force_next(), StartupPhase::CriticalBots);
        assert_eq!(o.force_next(), StartupPhase::HighPriority);
        o.abort();
        assert!(o.is_complete());
        assert!(o.status().aborted);
    }

    #[test]
    fn test_config_names() {
        assert_eq!(
            StartupPhase::from_config_name("NormalBots"),
            Some(StartupPhase::NormalBots)
        );
        assert_eq!(StartupPhase::from_config_name("Idle"), None);
    }
}
