//! Prometheus-compatible metrics endpoint
//!
//! Exposes spawn control-plane metrics in Prometheus text format and JSON.
//! Default endpoint: http://localhost:9090/metrics

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::control::{CircuitState, PressureLevel};
use crate::performance::HealthStatus;
use crate::spawn::SpawnStats;

/// Tick samples kept for percentiles
const TICK_HISTORY: usize = 1000;

/// Metrics registry for the spawn control plane
#[derive(Debug)]
pub struct Metrics {
    // Population
    pub active_bots: AtomicU64,
    pub peak_concurrent: AtomicU64,
    pub queued: AtomicU64,
    pub in_flight: AtomicU64,

    // Pipeline counters
    pub total_requested: AtomicU64,
    pub total_spawned: AtomicU64,
    pub failed_spawns: AtomicU64,
    pub total_despawned: AtomicU64,
    pub retries: AtomicU64,
    pub rejected_requests: AtomicU64,

    // Admission control (0=closed, 1=half-open, 2=open)
    pub circuit_state: AtomicU64,
    // 0=normal .. 3=critical
    pub pressure: AtomicU64,
    pub throttle_interval_ms: AtomicU64,
    pub update_cycle_blocks: AtomicU64,
    pub interval_blocks: AtomicU64,
    pub burst_blocks: AtomicU64,
    pub circuit_blocks: AtomicU64,
    pub pressure_blocks: AtomicU64,

    // Latency (microseconds)
    pub spawn_latency_avg_us: AtomicU64,
    pub spawn_latency_p95_us: AtomicU64,
    pub store_latency_avg_us: AtomicU64,

    // Health (0=healthy, 1=unhealthy)
    pub unhealthy: AtomicU64,

    // Event bus
    pub events_published: AtomicU64,
    pub events_dropped: AtomicU64,
    pub handler_failures: AtomicU64,

    // Session pool
    pub sessions_active: AtomicU64,
    pub sessions_pooled: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,
    startup_phase: RwLock<&'static str>,
    health: RwLock<&'static str>,
    failures_by_kind: RwLock<HashMap<&'static str, u64>>,
    tick_history: RwLock<VecDeque<u64>>,
}

fn circuit_code(state: CircuitState) -> u64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

fn pressure_code(level: PressureLevel) -> u64 {
    match level {
        PressureLevel::Normal => 0,
        PressureLevel::Elevated => 1,
        PressureLevel::High => 2,
        PressureLevel::Critical => 3,
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_bots: AtomicU64::new(0),
            peak_concurrent: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            total_requested: AtomicU64::new(0),
            total_spawned: AtomicU64::new(0),
            failed_spawns: AtomicU64::new(0),
            total_despawned: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            circuit_state: AtomicU64::new(0),
            pressure: AtomicU64::new(0),
            throttle_interval_ms: AtomicU64::new(0),
            update_cycle_blocks: AtomicU64::new(0),
            interval_blocks: AtomicU64::new(0),
            burst_blocks: AtomicU64::new(0),
            circuit_blocks: AtomicU64::new(0),
            pressure_blocks: AtomicU64::new(0),
            spawn_latency_avg_us: AtomicU64::new(0),
            spawn_latency_p95_us: AtomicU64::new(0),
            store_latency_avg_us: AtomicU64::new(0),
            unhealthy: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            sessions_pooled: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            startup_phase: RwLock::new("IDLE"),
            health: RwLock::new("HEALTHY"),
            failures_by_kind: RwLock::new(HashMap::new()),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Copy a stats snapshot into the registry
    pub fn update_from(&self, stats: &SpawnStats) {
        let set = |gauge: &AtomicU64, value: u64| gauge.store(value, Ordering::Relaxed);

        set(&self.active_bots, stats.active_bots as u64);
        set(&self.peak_concurrent, stats.peak_concurrent as u64);
        set(&self.queued, stats.queued as u64);
        set(&self.in_flight, stats.in_flight as u64);
        set(&self.total_requested, stats.total_requested);
        set(&self.total_spawned, stats.total_spawned);
        set(&self.failed_spawns, stats.failed_spawns);
        set(&self.total_despawned, stats.total_despawned);
        set(&self.retries, stats.retries);
        set(&self.rejected_requests, stats.rejected_requests);

        set(&self.circuit_state, circuit_code(stats.circuit_state));
        set(&self.pressure, pressure_code(stats.pressure));
        set(&self.throttle_interval_ms, stats.throttler.current_interval_ms);
        set(&self.update_cycle_blocks, stats.throttler.update_cycle_throttle_blocks);
        set(&self.interval_blocks, stats.throttler.interval_blocks);
        set(&self.burst_blocks, stats.throttler.burst_blocks);
        set(&self.circuit_blocks, stats.throttler.circuit_blocks);
        set(&self.pressure_blocks, stats.throttler.pressure_blocks);

        set(&self.spawn_latency_avg_us, (stats.performance.avg_spawn_ms * 1000.0) as u64);
        set(&self.spawn_latency_p95_us, (stats.performance.p95_spawn_ms * 1000.0) as u64);
        set(&self.store_latency_avg_us, (stats.performance.avg_store_ms * 1000.0) as u64);
        set(&self.unhealthy, u64::from(stats.health != HealthStatus::Healthy));

        set(&self.events_published, stats.events.published);
        set(&self.events_dropped, stats.events.dropped);
        set(&self.handler_failures, stats.events.handler_failures);
        set(&self.sessions_active, stats.pool.active as u64);
        set(&self.sessions_pooled, stats.pool.pooled as u64);

        *self.startup_phase.write() = stats.startup_phase.as_str();
        *self.health.write() = stats.health.as_str();
        let mut kinds = self.failures_by_kind.write();
        kinds.clear();
        kinds.extend(stats.failures_by_kind.iter().map(|(k, v)| (*k, *v)));
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            self.tick_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);

        metric!("bots_active", "Bots currently in the world", "gauge", load(&self.active_bots));
        metric!("bots_peak_concurrent", "Highest concurrent bot count", "gauge",
            load(&self.peak_concurrent));
        metric!("bots_spawn_queue_depth", "Requests waiting in the spawn queue", "gauge",
            load(&self.queued));
        metric!("bots_spawn_in_flight", "Requests between release and bind", "gauge",
            load(&self.in_flight));

        metric!("bots_spawn_requested_total", "Spawn requests accepted", "counter",
            load(&self.total_requested));
        metric!("bots_spawned_total", "Bots bound into the world", "counter",
            load(&self.total_spawned));
        metric!("bots_spawn_failed_total", "Spawn requests that failed for good", "counter",
            load(&self.failed_spawns));
        metric!("bots_despawned_total", "Bots removed from the world", "counter",
            load(&self.total_despawned));
        metric!("bots_spawn_retries_total", "Spawn requests retried", "counter",
            load(&self.retries));
        metric!("bots_spawn_rejected_total", "Spawn requests refused at pre-check", "counter",
            load(&self.rejected_requests));

        metric!("bots_circuit_state", "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            "gauge", load(&self.circuit_state));
        metric!("bots_resource_pressure", "Resource pressure (0=normal, 3=critical)", "gauge",
            load(&self.pressure));
        metric!("bots_throttle_interval_ms", "Current minimum gap between spawns", "gauge",
            load(&self.throttle_interval_ms));
        metric!("bots_throttle_update_cycle_blocks_total", "Releases deferred by the per-tick cap",
            "counter", load(&self.update_cycle_blocks));
        metric!("bots_throttle_interval_blocks_total", "Releases deferred by the spawn interval",
            "counter", load(&self.interval_blocks));
        metric!("bots_throttle_burst_blocks_total", "Releases deferred by the burst guard",
            "counter", load(&self.burst_blocks));
        metric!("bots_throttle_circuit_blocks_total", "Releases deferred by the circuit breaker",
            "counter", load(&self.circuit_blocks));
        metric!("bots_throttle_pressure_blocks_total", "Releases deferred by critical pressure",
            "counter", load(&self.pressure_blocks));

        metric!("bots_spawn_latency_avg_microseconds", "Average request-to-bind latency",
            "gauge", load(&self.spawn_latency_avg_us));
        metric!("bots_spawn_latency_p95_microseconds", "95th percentile request-to-bind latency",
            "gauge", load(&self.spawn_latency_p95_us));
        metric!("bots_store_latency_avg_microseconds", "Average character store call latency",
            "gauge", load(&self.store_latency_avg_us));
        metric!("bots_unhealthy", "Spawn pipeline health (0=healthy)", "gauge",
            load(&self.unhealthy));

        metric!("bots_events_published_total", "Events published", "counter",
            load(&self.events_published));
        metric!("bots_events_dropped_total", "Events shed on overflow", "counter",
            load(&self.events_dropped));
        metric!("bots_event_handler_failures_total", "Event handlers that panicked", "counter",
            load(&self.handler_failures));
        metric!("bots_sessions_active", "Sessions bound to bots", "gauge",
            load(&self.sessions_active));
        metric!("bots_sessions_pooled", "Idle sessions ready for reuse", "gauge",
            load(&self.sessions_pooled));

        metric!("bots_tick_time_microseconds", "Last control-plane tick time", "gauge",
            load(&self.tick_time_us));
        metric!("bots_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            load(&self.tick_time_p95_us));
        metric!("bots_tick_time_max_microseconds", "Maximum tick time", "gauge",
            load(&self.tick_time_max_us));
        metric!("bots_tick_count", "Ticks processed", "counter", load(&self.tick_count));
        metric!("bots_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output.push_str(&format!(
            "# HELP bots_startup_phase Current startup phase\n# TYPE bots_startup_phase gauge\nbots_startup_phase{{phase=\"{}\"}} 1\n",
            *self.startup_phase.read()
        ));
        output.push_str(&format!(
            "# HELP bots_health_state Spawn pipeline health state\n# TYPE bots_health_state gauge\nbots_health_state{{state=\"{}\"}} 1\n",
            *self.health.read()
        ));

        let kinds = self.failures_by_kind.read();
        if !kinds.is_empty() {
            output.push_str(
                "# HELP bots_spawn_failures_by_kind_total Final spawn failures by kind\n# TYPE bots_spawn_failures_by_kind_total counter\n",
            );
            let mut sorted: Vec<_> = kinds.iter().collect();
            sorted.sort();
            for (kind, count) in sorted {
                output.push_str(&format!(
                    "bots_spawn_failures_by_kind_total{{kind=\"{}\"}} {}\n",
                    kind, count
                ));
            }
        }

        output
    }

    /// JSON form of the same registry
    pub fn to_json(&self) -> String {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        let kinds: std::collections::BTreeMap<&str, u64> = self
            .failures_by_kind
            .read()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();

        let value = serde_json::json!({
            "bots": {
                "active": load(&self.active_bots),
                "peak_concurrent": load(&self.peak_concurrent),
                "queued": load(&self.queued),
                "in_flight": load(&self.in_flight),
            },
            "pipeline": {
                "requested": load(&self.total_requested),
                "spawned": load(&self.total_spawned),
                "failed": load(&self.failed_spawns),
                "despawned": load(&self.total_despawned),
                "retries": load(&self.retries),
                "rejected": load(&self.rejected_requests),
                "failures_by_kind": kinds,
            },
            "admission": {
                "circuit_state": load(&self.circuit_state),
                "pressure": load(&self.pressure),
                "startup_phase": *self.startup_phase.read(),
                "throttle_interval_ms": load(&self.throttle_interval_ms),
                "update_cycle_blocks": load(&self.update_cycle_blocks),
            },
            "performance": {
                "health": *self.health.read(),
                "spawn_latency_avg_us": load(&self.spawn_latency_avg_us),
                "spawn_latency_p95_us": load(&self.spawn_latency_p95_us),
                "store_latency_avg_us": load(&self.store_latency_avg_us),
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_count": load(&self.tick_count),
            },
            "uptime_seconds": self.uptime_seconds(),
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn http_ok(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Route one raw HTTP request
fn respond(metrics: &Metrics, request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next());

    match path {
        Some("/metrics/json") | Some("/json") => http_ok("application/json", &metrics.to_json()),
        Some("/metrics") => http_ok("text/plain; version=0.0.4", &metrics.to_prometheus()),
        Some("/health") | Some("/") => {
            if metrics.unhealthy.load(Ordering::Relaxed) == 0 {
                http_ok("text/plain", "OK")
            } else {
                let body = *metrics.health.read();
                format!(
                    "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                )
            }
        }
        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    }
}
