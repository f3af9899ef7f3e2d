//! Resource pressure monitor
//!
//! Samples process CPU and memory once per interval, keeps 5s/30s/60s CPU
//! averages and maps them onto a four-level pressure signal for the throttler.
//! A failed sample keeps the previous values and marks the snapshot stale.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{PressureMultipliers, PressureThresholds, ResourceConfig};
use crate::util::{RollingWindow, SharedClock};

/// Server headroom summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PressureLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl PressureLevel {
    /// Spawn rate multiplier for this level
    pub fn multiplier(self, multipliers: &PressureMultipliers) -> f64 {
        match self {
            PressureLevel::Normal => multipliers.normal,
            PressureLevel::Elevated => multipliers.elevated,
            PressureLevel::High => multipliers.high,
            PressureLevel::Critical => multipliers.critical,
        }
    }

    pub fn is_safe_to_spawn(self) -> bool {
        self != PressureLevel::Critical
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Elevated => "elevated",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }

    /// Classify a CPU/memory reading against configured bands
    pub fn classify(
        cpu: f64,
        mem: f64,
        cpu_th: &PressureThresholds,
        mem_th: &PressureThresholds,
    ) -> Self {
        if cpu < cpu_th.normal && mem < mem_th.normal {
            PressureLevel::Normal
        } else if cpu < cpu_th.elevated && mem < mem_th.elevated {
            PressureLevel::Elevated
        } else if cpu < cpu_th.high && mem < mem_th.high {
            PressureLevel::High
        } else {
            PressureLevel::Critical
        }
    }
}

/// One raw reading from the platform
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessSample {
    /// Process CPU, percent of the whole machine
    pub cpu_percent: f64,
    /// Host memory in use, percent
    pub mem_percent: f64,
    /// Process resident set, MB
    pub working_set_mb: f64,
}

/// Sampling failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum SampleError {
    #[error("Resource sample unavailable: {0}")]
    Unavailable(String),
}

/// Platform source of CPU and memory samples
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<ProcessSample, SampleError>;
}

/// Sampler whose readings are set from outside (tests, minimal builds)
#[derive(Debug, Clone)]
pub struct FixedSampler {
    state: Arc<Mutex<Result<ProcessSample, String>>>,
}

impl FixedSampler {
    pub fn new(sample: ProcessSample) -> Self {
        Self {
            state: Arc::new(Mutex::new(Ok(sample))),
        }
    }

    pub fn set(&self, sample: ProcessSample) {
        *self.state.lock() = Ok(sample);
    }

    /// Make subsequent samples fail
    pub fn fail(&self, reason: &str) {
        *self.state.lock() = Err(reason.to_string());
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&mut self) -> Result<ProcessSample, SampleError> {
        self.state.lock().clone().map_err(SampleError::Unavailable)
    }
}

#[cfg(feature = "host_sampler")]
pub use host::SysinfoSampler;

#[cfg(feature = "host_sampler")]
mod host {
    use super::{ProcessSample, ResourceSampler, SampleError};
    use sysinfo::{MemoryRefreshKind, Pid, ProcessesToUpdate, RefreshKind, System};

    /// Reads this process's CPU and memory through sysinfo
    pub struct SysinfoSampler {
        system: System,
        pid: Pid,
        cpu_count: f64,
    }

    impl SysinfoSampler {
        pub fn new() -> Result<Self, SampleError> {
            let pid = sysinfo::get_current_pid()
                .map_err(|e| SampleError::Unavailable(e.to_string()))?;
            let system = System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            );
            let cpu_count = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1) as f64;
            Ok(Self {
                system,
                pid,
                cpu_count,
            })
        }
    }

    impl ResourceSampler for SysinfoSampler {
        fn sample(&mut self) -> Result<ProcessSample, SampleError> {
            self.system.refresh_memory();
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

            let process = self
                .system
                .process(self.pid)
                .ok_or_else(|| SampleError::Unavailable("own process not found".to_string()))?;

            let total = self.system.total_memory() as f64;
            let mem_percent = if total > 0.0 {
                self.system.used_memory() as f64 / total * 100.0
            } else {
                0.0
            };

            Ok(ProcessSample {
                cpu_percent: (process.cpu_usage() as f64 / self.cpu_count).clamp(0.0, 100.0),
                mem_percent,
                working_set_mb: process.memory() as f64 / (1024.0 * 1024.0),
            })
        }
    }
}

/// Latest resource snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceMetrics {
    pub cpu_instant: f64,
    pub cpu_5s: f64,
    pub cpu_30s: f64,
    pub cpu_60s: f64,
    pub mem_pct: f64,
    pub working_set_mb: f64,
    pub db_pool_in_use: u32,
    pub db_pool_max: u32,
    pub active_map_instances: u32,
    pub total_active_bots: u32,
    /// Previous values carried over after a failed sample
    pub stale: bool,
    #[serde(skip)]
    pub collected_at: Option<Instant>,
}

/// Periodic resource sampler with smoothed CPU windows
pub struct ResourceMonitor {
    config: ResourceConfig,
    sampler: Box<dyn ResourceSampler>,
    clock: SharedClock,
    last_sample_at: Option<Instant>,
    cpu_5s: RollingWindow,
    cpu_30s: RollingWindow,
    cpu_60s: RollingWindow,
    metrics: ResourceMetrics,
    pressure: PressureLevel,
    samples_taken: u64,
    sample_failures: u64,
}

/// Samples needed to span `window_ms` at one sample per `interval_ms`
fn window_slots(window_ms: u64, interval_ms: u64) -> usize {
    (window_ms / interval_ms.max(1)).max(1) as usize
}

impl ResourceMonitor {
    pub fn new(config: ResourceConfig, sampler: Box<dyn ResourceSampler>, clock: SharedClock) -> Self {
        let interval = config.sample_interval_ms;
        Self {
            cpu_5s: RollingWindow::new(window_slots(5_000, interval)),
            cpu_30s: RollingWindow::new(window_slots(30_000, interval)),
            cpu_60s: RollingWindow::new(window_slots(60_000, interval)),
            config,
            sampler,
            clock,
            last_sample_at: None,
            metrics: ResourceMetrics::default(),
            pressure: PressureLevel::Normal,
            samples_taken: 0,
            sample_failures: 0,
        }
    }

    /// Sample if the interval has elapsed
    pub fn update(&mut self) {
        let now = self.clock.now();
        let due = match self.last_sample_at {
            Some(last) => {
                now.saturating_duration_since(last)
                    >= Duration::from_millis(self.config.sample_interval_ms)
            }
            None => true,
        };
        if due {
            self.sample_now();
        }
    }

    /// Take a sample immediately
    pub fn sample_now(&mut self) {
        let now = self.clock.now();
        self.last_sample_at = Some(now);

        match self.sampler.sample() {
            Ok(sample) => {
                self.cpu_5s.push(sample.cpu_percent);
                self.cpu_30s.push(sample.cpu_percent);
                self.cpu_60s.push(sample.cpu_percent);

                self.metrics.cpu_instant = sample.cpu_percent;
                self.metrics.cpu_5s = self.cpu_5s.average();
                self.metrics.cpu_30s = self.cpu_30s.average();
                self.metrics.cpu_60s = self.cpu_60s.average();
                self.metrics.mem_pct = sample.mem_percent;
                self.metrics.working_set_mb = sample.working_set_mb;
                self.metrics.stale = false;
                self.metrics.collected_at = Some(now);
                self.samples_taken += 1;
            }
            Err(e) => {
                if !self.metrics.stale {
                    tracing::warn!("{}; keeping previous resource values", e);
                }
                self.metrics.stale = true;
                self.sample_failures += 1;
            }
        }

        let previous = self.pressure;
        self.pressure = PressureLevel::classify(
            self.metrics.cpu_5s,
            self.metrics.mem_pct,
            &self.config.cpu_thresholds,
            &self.config.mem_thresholds,
        );
        if self.pressure != previous {
            tracing::info!(
                "Resource pressure {} -> {} (cpu5s {:.1}%, mem {:.1}%)",
                previous.as_str(),
                self.pressure.as_str(),
                self.metrics.cpu_5s,
                self.metrics.mem_pct
            );
        }
    }

    pub fn set_db_pool(&mut self, in_use: u32, max: u32) {
        self.metrics.db_pool_in_use = in_use;
        self.metrics.db_pool_max = max;
    }

    pub fn set_active_map_instances(&mut self, count: u32) {
        self.metrics.active_map_instances = count;
    }

    pub fn set_total_active_bots(&mut self, count: u32) {
        self.metrics.total_active_bots = count;
    }

    pub fn current_metrics(&self) -> ResourceMetrics {
        self.metrics.clone()
    }

    pub fn pressure(&self) -> PressureLevel {
        self.pressure
    }

    pub fn is_safe_to_spawn(&self) -> bool {
        self.pressure.is_safe_to_spawn()
    }

    pub fn sample_failures(&self) -> u64 {
        self.sample_failures
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }

    /// Apply new thresholds. A new sample interval resizes the CPU windows
    /// so they keep spanning 5, 30 and 60 seconds.
    pub fn set_config(&mut self, config: ResourceConfig) {
        let interval = config.sample_interval_ms;
        if interval != self.config.sample_interval_ms {
            self.cpu_5s.resize(window_slots(5_000, interval));
            self.cpu_30s.resize(window_slots(30_000, interval));
            self.cpu_60s.resize(window_slots(60_000, interval));
            tracing::debug!(
                "Resource sample interval {}ms -> {}ms",
                self.config.sample_interval_ms,
                interval
            );
        }
        self.config = config;
    }
}
