//! Spawn pipeline performance monitoring
//!
//! Tracks latency of the spawn path and its dependencies, per-second
//! throughput, and a few resource counters. Provides a health predicate used
//! for operator alerts.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::util::{RollingWindow, SharedClock};

/// Samples kept per latency tracker
const LATENCY_SAMPLES: usize = 1000;

/// Health status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    HighSpawnLatency,
    HighDbLatency,
    HighCpuUsage,
    /// Memory per bot or success rate out of bounds
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::HighSpawnLatency => "HIGH_SPAWN_LATENCY",
            HealthStatus::HighDbLatency => "HIGH_DB_LATENCY",
            HealthStatus::HighCpuUsage => "HIGH_CPU_USAGE",
            HealthStatus::Degraded => "DEGRADED",
        }
    }
}

/// Limits for the health predicate
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub max_avg_spawn_ms: f64,
    pub max_avg_store_ms: f64,
    pub max_cpu_percent: f64,
    pub max_memory_per_bot_bytes: u64,
    pub min_success_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_avg_spawn_ms: 100.0,
            max_avg_store_ms: 10.0,
            max_cpu_percent: 80.0,
            max_memory_per_bot_bytes: 10 * 1024 * 1024,
            min_success_rate: 0.99,
        }
    }
}

/// Counters for one second of throughput
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Throughput {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub status: HealthStatus,
    pub avg_spawn_ms: f64,
    pub p95_spawn_ms: f64,
    pub avg_store_ms: f64,
    pub avg_handler_ms: f64,
    pub avg_lock_wait_ms: f64,
    pub last_second: Throughput,
    pub total: Throughput,
    pub success_rate: f64,
    pub memory_bytes: u64,
    pub active_bots: u32,
    pub cpu_percent: f64,
}

/// Performance monitor for the spawn pipeline
pub struct PerformanceMonitor {
    clock: SharedClock,
    thresholds: HealthThresholds,
    spawn_ms: RollingWindow,
    store_ms: RollingWindow,
    handler_ms: RollingWindow,
    lock_wait_ms: RollingWindow,
    current_second: Throughput,
    last_second: Throughput,
    second_started: Instant,
    total: Throughput,
    memory_bytes: u64,
    active_bots: u32,
    cpu_percent: f64,
    status: HealthStatus,
}

impl PerformanceMonitor {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_thresholds(clock, HealthThresholds::default())
    }

    pub fn with_thresholds(clock: SharedClock, thresholds: HealthThresholds) -> Self {
        let now = clock.now();
        Self {
            clock,
            thresholds,
            spawn_ms: RollingWindow::new(LATENCY_SAMPLES),
            store_ms: RollingWindow::new(LATENCY_SAMPLES),
            handler_ms: RollingWindow::new(LATENCY_SAMPLES),
            lock_wait_ms: RollingWindow::new(LATENCY_SAMPLES),
            current_second: Throughput::default(),
            last_second: Throughput::default(),
            second_started: now,
            total: Throughput::default(),
            memory_bytes: 0,
            active_bots: 0,
            cpu_percent: 0.0,
            status: HealthStatus::Healthy,
        }
    }

    pub fn record_spawn_request(&mut self) {
        self.current_second.requests += 1;
        self.total.requests += 1;
    }

    /// A spawn finished; `latency` is request-to-bind
    pub fn record_spawn_success(&mut self, latency: Duration) {
        self.spawn_ms.push(latency.as_secs_f64() * 1000.0);
        self.current_second.successes += 1;
        self.total.successes += 1;
    }

    pub fn record_spawn_failure(&mut self) {
        self.current_second.failures += 1;
        self.total.failures += 1;
    }

    pub fn record_store_query(&mut self, latency: Duration) {
        self.store_ms.push(latency.as_secs_f64() * 1000.0);
    }

    pub fn record_handler_time(&mut self, elapsed: Duration) {
        self.handler_ms.push(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_lock_wait(&mut self, waited: Duration) {
        self.lock_wait_ms.push(waited.as_secs_f64() * 1000.0);
    }

    pub fn set_resources(&mut self, memory_bytes: u64, active_bots: u32, cpu_percent: f64) {
        self.memory_bytes = memory_bytes;
        self.active_bots = active_bots;
        self.cpu_percent = cpu_percent;
    }

    /// Roll throughput counters and re-evaluate health. Returns the new status
    /// when it changed.
    pub fn update(&mut self) -> Option<HealthStatus> {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.second_started);
        if elapsed >= Duration::from_secs(1) {
            self.last_second = if elapsed >= Duration::from_secs(2) {
                Throughput::default()
            } else {
                self.current_second
            };
            self.current_second = Throughput::default();
            self.second_started = now;
        }

        let status = self.evaluate();
        if status != self.status {
            self.status = status;
            Some(status)
        } else {
            None
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.evaluate() == HealthStatus::Healthy
    }

    /// Share of finished spawns that succeeded (1.0 with no data)
    pub fn success_rate(&self) -> f64 {
        let finished = self.total.successes + self.total.failures;
        if finished == 0 {
            1.0
        } else {
            self.total.successes as f64 / finished as f64
        }
    }

    pub fn memory_per_bot(&self) -> u64 {
        if self.active_bots == 0 {
            0
        } else {
            self.memory_bytes / self.active_bots as u64
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            status: self.status,
            avg_spawn_ms: self.spawn_ms.average(),
            p95_spawn_ms: self.spawn_ms.percentile(0.95),
            avg_store_ms: self.store_ms.average(),
            avg_handler_ms: self.handler_ms.average(),
            avg_lock_wait_ms: self.lock_wait_ms.average(),
            last_second: self.last_second,
            total: self.total,
            success_rate: self.success_rate(),
            memory_bytes: self.memory_bytes,
            active_bots: self.active_bots,
            cpu_percent: self.cpu_percent,
        }
    }

    /// Human-readable status line
    pub fn status_message(&self) -> String {
        format!(
            "{} - spawn {:.1}ms avg, store {:.1}ms avg, {:.1}% success, {} bots",
            self.status.as_str(),
            self.spawn_ms.average(),
            self.store_ms.average(),
            self.success_rate() * 100.0,
            self.active_bots
        )
    }

    pub fn reset(&mut self) {
        let clock = self.clock.clone();
        let thresholds = self.thresholds.clone();
        *self = Self::with_thresholds(clock, thresholds);
    }

    fn evaluate(&self) -> HealthStatus {
        let t = &self.thresholds;
        if self.spawn_ms.average() > t.max_avg_spawn_ms {
            HealthStatus::HighSpawnLatency
        } else if self.store_ms.average() > t.max_avg_store_ms {
            HealthStatus::HighDbLatency
        } else if self.cpu_percent > t.max_cpu_percent {
            HealthStatus::HighCpuUsage
        } else if self.memory_per_bot() > t.max_memory_per_bot_bytes
            || self.success_rate() < t.min_success_rate
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
