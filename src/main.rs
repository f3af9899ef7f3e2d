use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bot_population_server::adapter::{create_spawner, BotSpawner, SpawnerKind};
use bot_population_server::commands::run_line;
use bot_population_server::config::SpawnConfig;
use bot_population_server::control::ResourceSampler;
use bot_population_server::metrics::{self, Metrics};
use bot_population_server::population::ZoneInfo;
use bot_population_server::sim::{SimCharacterStore, SimWorldHost};
use bot_population_server::spawn::{Position, SpawnRequest, SpawnType, ZoneProfile};
use bot_population_server::util::MonotonicClock;

/// World tick period
const TICK: Duration = Duration::from_millis(50);

#[cfg(feature = "host_sampler")]
fn sampler() -> Box<dyn ResourceSampler> {
    use bot_population_server::control::resource_monitor::SysinfoSampler;
    match SysinfoSampler::new() {
        Ok(sampler) => Box::new(sampler),
        Err(e) => {
            warn!("Process sampling unavailable ({}), using static sample", e);
            static_sampler()
        }
    }
}

#[cfg(not(feature = "host_sampler"))]
fn sampler() -> Box<dyn ResourceSampler> {
    static_sampler()
}

fn static_sampler() -> Box<dyn ResourceSampler> {
    use bot_population_server::control::{FixedSampler, ProcessSample};
    Box::new(FixedSampler::new(ProcessSample::default()))
}

/// A handful of zones with human players for the demo world
fn demo_world() -> (Arc<SimWorldHost>, Arc<SimCharacterStore>) {
    let world = Arc::new(SimWorldHost::new());
    for (zone_id, map_id, humans, min_level, max_level) in [
        (12u32, 0u32, 6u32, 1u8, 10u8),
        (1519, 0, 12, 10, 60),
        (14, 1, 4, 1, 10),
        (1637, 1, 9, 10, 60),
        (3703, 530, 3, 58, 70),
    ] {
        world.set_zone(ZoneInfo {
            zone_id,
            map_id,
            human_count: humans,
            min_level,
            max_level,
        });
    }

    let store = Arc::new(SimCharacterStore::new());
    store.populate(200, 4, 1, 70);
    (world, store)
}

/// Named spawn shapes for the `template` command
fn register_demo_templates(spawner: &dyn BotSpawner) {
    spawner.register_zone_profile(
        3703,
        ZoneProfile {
            pvp_enabled: true,
            default_position: Some(Position {
                x: -1830.0,
                y: 5400.0,
                z: -12.4,
            }),
        },
    );
    spawner.register_template(
        "outland-veteran",
        SpawnRequest::new(SpawnType::SpecificZone, 3703, 530).with_levels(58, 70),
    );
    spawner.register_template(
        "starter-escort",
        SpawnRequest::new(SpawnType::SpecificZone, 12, 0)
            .with_levels(1, 10)
            .without_creation(),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Bot population server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = SpawnConfig::load_or_default();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }
    info!(
        "Configuration loaded: max_bots={}, per_zone={}, ratio={:.2}, startup={}",
        config.max_bots_total,
        config.max_bots_per_zone,
        config.bot_to_player_ratio,
        config.startup.enabled
    );

    let kind = match std::env::var("BOTS_SPAWNER_KIND") {
        Ok(value) => value.parse::<SpawnerKind>()?,
        Err(_) => SpawnerKind::default(),
    };

    let (world, store) = demo_world();
    let spawner = create_spawner(
        kind,
        config,
        world,
        store,
        sampler(),
        MonotonicClock::shared(),
        Handle::current(),
    )?;

    register_demo_templates(spawner.as_ref());

    let metrics = Arc::new(Metrics::new());

    #[cfg(feature = "metrics_server")]
    {
        // Metrics server on port 9090 (configurable via METRICS_PORT)
        let metrics_port: u16 = std::env::var("METRICS_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(9090);

        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // Tick driver
    let tick_spawner = spawner.clone();
    let tick_metrics = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let started = Instant::now();
            tick_spawner.update();
            tick_metrics.record_tick_time(started.elapsed());
            tick_metrics.update_from(&tick_spawner.stats());
        }
    });

    info!("Ready. Type 'help' for operator commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match run_line(&line, spawner.as_ref()) {
                    Ok(reply) => println!("{}", reply),
                    Err(e) => println!("{}", e),
                },
                // stdin closed, keep ticking until interrupted
                Ok(None) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    warn!("Failed to read command: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    spawner.shutdown();
    Ok(())
}
