//! Spawn control-plane configuration
//!
//! Defaults live in the `Default` impls. On top of them sits a flat key/value
//! surface (`MaxBotsTotal`, `CpuThresholds.Normal`, ...) that can be fed from
//! pairs or from `BOTS_<KEY>` environment variables.

use crate::control::startup::{PhaseConfig, StartupPhase};
use crate::spawn::request::SpawnPriority;

/// Configuration errors (refuse to start)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown configuration key '{0}'")]
    UnknownKey(String),
    #[error("Invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Spawn rate multipliers per pressure level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureMultipliers {
    pub normal: f64,
    pub elevated: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for PressureMultipliers {
    fn default() -> Self {
        Self {
            normal: 1.0,
            elevated: 0.5,
            high: 0.25,
            critical: 0.0,
        }
    }
}

/// Adaptive throttler settings
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub base_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Spawns admitted per world tick
    pub max_spawns_per_update_cycle: u32,
    pub burst_window_ms: u64,
    pub max_bursts_per_window: u32,
    pub pressure_multipliers: PressureMultipliers,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 100,
            min_interval_ms: 50,
            max_interval_ms: 5000,
            max_spawns_per_update_cycle: 1,
            burst_window_ms: 10_000,
            max_bursts_per_window: 50,
            pressure_multipliers: PressureMultipliers::default(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Failure percentage strictly above which a closed breaker trips
    pub open_threshold_pct: f64,
    /// Failure percentage a half-open breaker must stay under to close
    pub close_threshold_pct: f64,
    pub cooldown_ms: u64,
    pub recovery_ms: u64,
    pub minimum_attempts: u32,
    pub window_ms: u64,
    pub trial_interval_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            open_threshold_pct: 10.0,
            close_threshold_pct: 5.0,
            cooldown_ms: 60_000,
            recovery_ms: 120_000,
            minimum_attempts: 10,
            window_ms: 60_000,
            trial_interval_ms: 5_000,
        }
    }
}

/// Upper bounds (percent) of the NORMAL, ELEVATED and HIGH pressure bands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub normal: f64,
    pub elevated: f64,
    pub high: f64,
}

/// Resource monitor settings
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    pub sample_interval_ms: u64,
    pub cpu_thresholds: PressureThresholds,
    pub mem_thresholds: PressureThresholds,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            cpu_thresholds: PressureThresholds {
                normal: 60.0,
                elevated: 75.0,
                high: 85.0,
            },
            mem_thresholds: PressureThresholds {
                normal: 70.0,
                elevated: 80.0,
                high: 90.0,
            },
        }
    }
}

/// Session pool sizing
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub initial_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub cleanup_interval_ms: u64,
    /// Pooled handles idle longer than this are drained (down to `min_size`)
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 100,
            min_size: 50,
            max_size: 1000,
            cleanup_interval_ms: 30_000,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Phased startup settings
#[derive(Debug, Clone, PartialEq)]
pub struct StartupConfig {
    pub enabled: bool,
    pub initial_delay_secs: u64,
    pub phases: Vec<PhaseConfig>,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: 5,
            phases: PhaseConfig::default_table(),
        }
    }
}

impl StartupConfig {
    pub fn phase_mut(&mut self, phase: StartupPhase) -> Option<&mut PhaseConfig> {
        self.phases.iter_mut().find(|p| p.phase == phase)
    }
}

/// Event bus sizing
#[derive(Debug, Clone, PartialEq)]
pub struct EventBusConfig {
    pub max_queue_size: usize,
    pub batch_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            batch_size: 100,
        }
    }
}

/// Character selector settings
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    pub max_pending: usize,
    pub cache_validity_ms: u64,
    pub store_timeout_ms: u64,
    pub max_accounts_per_request: usize,
    pub allow_create: bool,
    /// Class and race used when creating a character without filters
    pub default_class: u8,
    pub default_race: u8,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_pending: 5000,
            cache_validity_ms: 30_000,
            store_timeout_ms: 5_000,
            max_accounts_per_request: 10,
            allow_create: true,
            default_class: 1,
            default_race: 1,
        }
    }
}

/// Population accounting settings
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationConfig {
    pub stale_ms: u64,
    pub cache_ms: u64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            stale_ms: 5 * 60 * 1000,
            cache_ms: 5_000,
        }
    }
}

/// Full control-plane configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnConfig {
    /// Master switch
    pub enabled: bool,
    pub max_bots_total: u32,
    pub max_bots_per_zone: u32,
    pub max_bots_per_map: u32,
    pub bot_to_player_ratio: f64,
    /// Max requests composed per cadence tick
    pub spawn_batch_size: u32,
    pub despawn_surplus: bool,
    /// Whether NoSuitableCharacter counts as a circuit-breaker failure
    pub count_provisioning_failures: bool,
    pub target_calc_interval_ms: u64,
    pub population_update_interval_ms: u64,
    pub spawn_queue_max_size: usize,
    pub throttle: ThrottleConfig,
    pub circuit: CircuitConfig,
    pub resource: ResourceConfig,
    pub pool: PoolConfig,
    pub startup: StartupConfig,
    pub event_bus: EventBusConfig,
    pub selector: SelectorConfig,
    pub population: PopulationConfig,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bots_total: 500,
            max_bots_per_zone: 50,
            max_bots_per_map: 200,
            bot_to_player_ratio: 2.0,
            spawn_batch_size: 10,
            despawn_surplus: true,
            count_provisioning_failures: false,
            target_calc_interval_ms: 2000,
            population_update_interval_ms: 5000,
            spawn_queue_max_size: 10_000,
            throttle: ThrottleConfig::default(),
            circuit: CircuitConfig::default(),
            resource: ResourceConfig::default(),
            pool: PoolConfig::default(),
            startup: StartupConfig::default(),
            event_bus: EventBusConfig::default(),
            selector: SelectorConfig::default(),
            population: PopulationConfig::default(),
        }
    }
}

/// Every recognized key of the flat configuration surface
pub const CONFIG_KEYS: &[&str] = &[
    "Enabled",
    "MaxBotsTotal",
    "MaxBotsPerZone",
    "MaxBotsPerMap",
    "BotToPlayerRatio",
    "SpawnBatchSize",
    "MaxSpawnsPerUpdateCycle",
    "BaseSpawnIntervalMs",
    "MinSpawnIntervalMs",
    "MaxSpawnIntervalMs",
    "PressureMult.Normal",
    "PressureMult.Elevated",
    "PressureMult.High",
    "PressureMult.Critical",
    "BurstWindowMs",
    "MaxBurstsPerWindow",
    "CircuitOpenPct",
    "ClosePct",
    "CooldownMs",
    "RecoveryMs",
    "MinimumAttempts",
    "Circuit.WindowMs",
    "Circuit.TrialIntervalMs",
    "CpuThresholds.Normal",
    "CpuThresholds.Elevated",
    "CpuThresholds.High",
    "MemThresholds.Normal",
    "MemThresholds.Elevated",
    "MemThresholds.High",
    "Resource.SampleIntervalMs",
    "Pool.Initial",
    "Pool.Min",
    "Pool.Max",
    "Pool.CleanupIntervalMs",
    "Pool.IdleTimeoutMs",
    "PhasedStartup",
    "InitialDelaySeconds",
    "Phase.CriticalBots.MinSeconds",
    "Phase.CriticalBots.MaxSeconds",
    "Phase.CriticalBots.Target",
    "Phase.CriticalBots.RateMultiplier",
    "Phase.HighPriority.MinSeconds",
    "Phase.HighPriority.MaxSeconds",
    "Phase.HighPriority.Target",
    "Phase.HighPriority.RateMultiplier",
    "Phase.NormalBots.MinSeconds",
    "Phase.NormalBots.MaxSeconds",
    "Phase.NormalBots.Target",
    "Phase.NormalBots.RateMultiplier",
    "Phase.LowPriority.MinSeconds",
    "Phase.LowPriority.MaxSeconds",
    "Phase.LowPriority.Target",
    "Phase.LowPriority.RateMultiplier",
    "EventBus.MaxQueueSize",
    "EventBus.BatchSize",
    "SpawnQueue.MaxSize",
    "Selector.MaxPending",
    "Selector.CacheValidityMs",
    "Selector.StoreTimeoutMs",
    "Selector.MaxAccountsPerRequest",
    "Selector.AllowCreate",
    "DespawnSurplus",
    "CountProvisioningFailures",
    "TargetCalcIntervalMs",
    "PopulationUpdateIntervalMs",
    "Population.StaleMs",
    "Population.CacheMs",
];

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl SpawnConfig {
    /// Environment variable name for a configuration key
    pub fn env_name(key: &str) -> String {
        format!("BOTS_{}", key.to_ascii_uppercase().replace('.', "_"))
    }

    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        for key in CONFIG_KEYS {
            let name = Self::env_name(key);
            if let Ok(value) = std::env::var(&name) {
                if let Err(e) = config.apply(key, &value) {
                    tracing::warn!("{} ({}), using default", e, name);
                }
            }
        }

        config
    }

    /// Build a config from key/value pairs on top of the defaults
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one key of the flat surface
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        if let Some(rest) = key.strip_prefix("Phase.") {
            return self.apply_phase(key, rest, value);
        }

        match key {
            "Enabled" => self.enabled = parse_bool(key, value)?,
            "MaxBotsTotal" => self.max_bots_total = parse(key, value)?,
            "MaxBotsPerZone" => self.max_bots_per_zone = parse(key, value)?,
            "MaxBotsPerMap" => self.max_bots_per_map = parse(key, value)?,
            "BotToPlayerRatio" => self.bot_to_player_ratio = parse(key, value)?,
            "SpawnBatchSize" => self.spawn_batch_size = parse(key, value)?,
            "MaxSpawnsPerUpdateCycle" => {
                self.throttle.max_spawns_per_update_cycle = parse(key, value)?
            }
            "BaseSpawnIntervalMs" => self.throttle.base_interval_ms = parse(key, value)?,
            "MinSpawnIntervalMs" => self.throttle.min_interval_ms = parse(key, value)?,
            "MaxSpawnIntervalMs" => self.throttle.max_interval_ms = parse(key, value)?,
            "PressureMult.Normal" => self.throttle.pressure_multipliers.normal = parse(key, value)?,
            "PressureMult.Elevated" => {
                self.throttle.pressure_multipliers.elevated = parse(key, value)?
            }
            "PressureMult.High" => self.throttle.pressure_multipliers.high = parse(key, value)?,
            "PressureMult.Critical" => {
                self.throttle.pressure_multipliers.critical = parse(key, value)?
            }
            "BurstWindowMs" => self.throttle.burst_window_ms = parse(key, value)?,
            "MaxBurstsPerWindow" => self.throttle.max_bursts_per_window = parse(key, value)?,
            "CircuitOpenPct" => self.circuit.open_threshold_pct = parse(key, value)?,
            "ClosePct" => self.circuit.close_threshold_pct = parse(key, value)?,
            "CooldownMs" => self.circuit.cooldown_ms = parse(key, value)?,
            "RecoveryMs" => self.circuit.recovery_ms = parse(key, value)?,
            "MinimumAttempts" => self.circuit.minimum_attempts = parse(key, value)?,
            "Circuit.WindowMs" => self.circuit.window_ms = parse(key, value)?,
            "Circuit.TrialIntervalMs" => self.circuit.trial_interval_ms = parse(key, value)?,
            "CpuThresholds.Normal" => self.resource.cpu_thresholds.normal = parse(key, value)?,
            "CpuThresholds.Elevated" => self.resource.cpu_thresholds.elevated = parse(key, value)?,
            "CpuThresholds.High" => self.resource.cpu_thresholds.high = parse(key, value)?,
            "MemThresholds.Normal" => self.resource.mem_thresholds.normal = parse(key, value)?,
            "MemThresholds.Elevated" => self.resource.mem_thresholds.elevated = parse(key, value)?,
            "MemThresholds.High" => self.resource.mem_thresholds.high = parse(key, value)?,
            "Resource.SampleIntervalMs" => self.resource.sample_interval_ms = parse(key, value)?,
            "Pool.Initial" => self.pool.initial_size = parse(key, value)?,
            "Pool.Min" => self.pool.min_size = parse(key, value)?,
            "Pool.Max" => self.pool.max_size = parse(key, value)?,
            "Pool.CleanupIntervalMs" => self.pool.cleanup_interval_ms = parse(key, value)?,
            "Pool.IdleTimeoutMs" => self.pool.idle_timeout_ms = parse(key, value)?,
            "PhasedStartup" => self.startup.enabled = parse_bool(key, value)?,
            "InitialDelaySeconds" => self.startup.initial_delay_secs = parse(key, value)?,
            "EventBus.MaxQueueSize" => self.event_bus.max_queue_size = parse(key, value)?,
            "EventBus.BatchSize" => self.event_bus.batch_size = parse(key, value)?,
            "SpawnQueue.MaxSize" => self.spawn_queue_max_size = parse(key, value)?,
            "Selector.MaxPending" => self.selector.max_pending = parse(key, value)?,
            "Selector.CacheValidityMs" => self.selector.cache_validity_ms = parse(key, value)?,
            "Selector.StoreTimeoutMs" => self.selector.store_timeout_ms = parse(key, value)?,
            "Selector.MaxAccountsPerRequest" => {
                self.selector.max_accounts_per_request = parse(key, value)?
            }
            "Selector.AllowCreate" => self.selector.allow_create = parse_bool(key, value)?,
            "DespawnSurplus" => self.despawn_surplus = parse_bool(key, value)?,
            "CountProvisioningFailures" => {
                self.count_provisioning_failures = parse_bool(key, value)?
            }
            "TargetCalcIntervalMs" => self.target_calc_interval_ms = parse(key, value)?,
            "PopulationUpdateIntervalMs" => {
                self.population_update_interval_ms = parse(key, value)?
            }
            "Population.StaleMs" => self.population.stale_ms = parse(key, value)?,
            "Population.CacheMs" => self.population.cache_ms = parse(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn apply_phase(&mut self, key: &str, rest: &str, value: &str) -> Result<(), ConfigError> {
        let (name, field) = rest
            .split_once('.')
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let phase = StartupPhase::from_config_name(name)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let phase_config = self
            .startup
            .phase_mut(phase)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

        match field {
            "MinSeconds" => phase_config.min_duration_secs = parse(key, value)?,
            "MaxSeconds" => phase_config.max_duration_secs = parse(key, value)?,
            "Target" => phase_config.target_bots_to_spawn = parse(key, value)?,
            "RateMultiplier" => phase_config.rate_multiplier = parse(key, value)?,
            "AllowedPriority" => {
                phase_config.allowed_priority =
                    SpawnPriority::parse(value).ok_or_else(|| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.max_bots_total == 0 {
            return invalid("MaxBotsTotal must be at least 1");
        }
        if self.max_bots_per_zone == 0 || self.max_bots_per_map == 0 {
            return invalid("per-zone and per-map caps must be at least 1");
        }
        if !self.bot_to_player_ratio.is_finite() || self.bot_to_player_ratio < 0.0 {
            return invalid("BotToPlayerRatio must be a non-negative number");
        }
        if self.spawn_batch_size == 0 {
            return invalid("SpawnBatchSize must be at least 1");
        }

        let t = &self.throttle;
        if t.min_interval_ms == 0 {
            return invalid("MinSpawnIntervalMs must be at least 1");
        }
        if t.min_interval_ms > t.base_interval_ms || t.base_interval_ms > t.max_interval_ms {
            return invalid("spawn intervals must satisfy Min <= Base <= Max");
        }
        if t.max_spawns_per_update_cycle == 0 {
            return invalid("MaxSpawnsPerUpdateCycle must be at least 1");
        }
        if t.burst_window_ms == 0 || t.max_bursts_per_window == 0 {
            return invalid("burst window and limit must be positive");
        }
        let m = &t.pressure_multipliers;
        if [m.normal, m.elevated, m.high, m.critical]
            .iter()
            .any(|v| !(0.0..=1.0).contains(v))
        {
            return invalid("pressure multipliers must be within [0, 1]");
        }

        let c = &self.circuit;
        if !(0.0..=100.0).contains(&c.open_threshold_pct)
            || !(0.0..=100.0).contains(&c.close_threshold_pct)
        {
            return invalid("circuit thresholds must be percentages");
        }
        if c.close_threshold_pct > c.open_threshold_pct {
            return invalid("ClosePct cannot exceed CircuitOpenPct");
        }
        if c.window_ms == 0 || c.trial_interval_ms == 0 {
            return invalid("circuit window and trial interval must be positive");
        }

        for (name, th) in [
            ("CpuThresholds", &self.resource.cpu_thresholds),
            ("MemThresholds", &self.resource.mem_thresholds),
        ] {
            if !(th.normal <= th.elevated && th.elevated <= th.high) {
                return Err(ConfigError::Invalid(format!(
                    "{} must satisfy Normal <= Elevated <= High",
                    name
                )));
            }
        }
        if self.resource.sample_interval_ms == 0 {
            return invalid("Resource.SampleIntervalMs must be positive");
        }

        let p = &self.pool;
        if p.min_size > p.max_size || p.initial_size > p.max_size {
            return invalid("pool sizes must satisfy Min <= Max and Initial <= Max");
        }

        for phase in &self.startup.phases {
            if phase.min_duration_secs > phase.max_duration_secs {
                return Err(ConfigError::Invalid(format!(
                    "phase {:?} min duration exceeds max duration",
                    phase.phase
                )));
            }
            if !(0.0..=1.0).contains(&phase.rate_multiplier) || phase.rate_multiplier == 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "phase {:?} rate multiplier must be within (0, 1]",
                    phase.phase
                )));
            }
        }

        if self.event_bus.max_queue_size == 0 || self.event_bus.batch_size == 0 {
            return invalid("event bus sizes must be positive");
        }
        if self.spawn_queue_max_size == 0 || self.selector.max_pending == 0 {
            return invalid("queue bounds must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpawnConfig::default();
        assert_eq!(config.max_bots_total, 500);
        assert_eq!(config.max_bots_per_zone, 50);
        assert_eq!(config.max_bots_per_map, 200);
        assert_eq!(config.throttle.base_interval_ms, 100);
        assert_eq!(config.circuit.minimum_attempts, 10);
        assert_eq!(config.pool.initial_size, 100);
        assert_eq!(config.event_bus.max_queue_size, 10_000);
        assert!(config.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_pairs() {
        let config = SpawnConfig::from_pairs([
            ("MaxBotsTotal", "1000"),
            ("BotToPlayerRatio", "1.5"),
            ("CpuThresholds.High", "95"),
            ("Pool.Max", "2000"),
            ("Phase.CriticalBots.Target", "40"),
            ("Enabled", "false"),
        ])
        .unwrap();

        assert_eq!(config.max_bots_total, 1000);
        assert_eq!(config.bot_to_player_ratio, 1.5);
        assert_eq!(config.resource.cpu_thresholds.high, 95.0);
        assert_eq!(config.pool.max_size, 2000);
        assert!(!config.enabled);
        let phase = config
            .startup
            .phases
            .iter()
            .find(|p| p.phase == StartupPhase::CriticalBots)
            .unwrap();
        assert_eq!(phase.target_bots_to_spawn, 40);
    }

    #[test]
    fn test_unknown_key() {
        let result = SpawnConfig::from_pairs([("MaxBananas", "3")]);
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_invalid_value() {
        let result = SpawnConfig::from_pairs([("MaxBotsTotal", "lots")]);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validate_interval_order() {
        let result = SpawnConfig::from_pairs([("MinSpawnIntervalMs", "500")]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_thresholds() {
        let mut config = SpawnConfig::default();
        config.circuit.close_threshold_pct = 20.0;
        assert!(config.validate().is_err());

        let mut config = SpawnConfig::default();
        config.resource.mem_thresholds.normal = 95.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_every_listed_key_is_recognized() {
        let mut config = SpawnConfig::default();
        for key in CONFIG_KEYS {
            let value = if key.contains("Enabled")
                || key.contains("Startup")
                || key.contains("AllowCreate")
                || key.contains("Surplus")
                || key.contains("Provisioning")
            {
                "true"
            } else {
                "1"
            };
            assert!(
                !matches!(config.apply(key, value), Err(ConfigError::UnknownKey(_))),
                "key {} not recognized",
                key
            );
        }
    }

    #[test]
    fn test_env_name() {
        assert_eq!(SpawnConfig::env_name("MaxBotsTotal"), "BOTS_MAXBOTSTOTAL");
        assert_eq!(SpawnConfig::env_name("Pool.Min"), "BOTS_POOL_MIN");
    }

    #[test]
    fn test_load_or_default() {
        let config = SpawnConfig::load_or_default();
        assert!(config.max_bots_total > 0);
    }
}
