//! Admission control: resource pressure, circuit breaking, throttling and
//! phased startup

pub mod circuit_breaker;
pub mod resource_monitor;
pub mod startup;
pub mod throttler;

pub use circuit_breaker::{CircuitMetrics, CircuitState, SpawnCircuitBreaker};
pub use resource_monitor::{
    FixedSampler, PressureLevel, ProcessSample, ResourceMetrics, ResourceMonitor, ResourceSampler,
};
pub use startup::{PhaseConfig, StartupOrchestrator, StartupPhase, StartupStatus};
pub use throttler::{AdaptiveThrottler, ThrottleDecision, ThrottlerStats};
