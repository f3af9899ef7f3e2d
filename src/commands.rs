//! Operator command surface
//!
//! Parses one-line text commands and runs them against a [`BotSpawner`].

use std::fmt;
use std::str::FromStr;

use crate::adapter::BotSpawner;
use crate::spawn::{SpawnRequest, ZoneId};

/// Errors from parsing or running a command
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command '{0}'")]
    Unknown(String),
    #[error("Missing argument for '{0}'")]
    MissingArgument(&'static str),
    #[error("Invalid argument '{value}' for '{command}'")]
    InvalidArgument { command: &'static str, value: String },
    #[error("Failed to render stats: {0}")]
    Render(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Enable,
    Disable,
    MaxBots(u32),
    Ratio(f64),
    DespawnAll,
    ResetBreaker,
    ResetStats,
    Stats,
    /// Queue `count` random spawns in a zone
    Spawn { zone_id: ZoneId, count: u32 },
    /// Queue one spawn from a registered template
    Template(String),
    NextPhase,
    AbortStartup,
    Help,
}

pub const HELP: &str = "commands: enable | disable | maxbots <n> | ratio <f> | despawnall | \
resetbreaker | resetstats | stats | spawn <zone> [count] | template <name> | nextphase | abortstartup | help";

fn arg<T: FromStr>(command: &'static str, value: Option<&str>) -> Result<T, CommandError> {
    let value = value.ok_or(CommandError::MissingArgument(command))?;
    value.parse().map_err(|_| CommandError::InvalidArgument {
        command,
        value: value.to_string(),
    })
}

impl FromStr for ControlCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or(CommandError::Empty)?.to_ascii_lowercase();
        let command = match name.as_str() {
            "enable" => ControlCommand::Enable,
            "disable" => ControlCommand::Disable,
            "maxbots" => ControlCommand::MaxBots(arg("maxbots", parts.next())?),
            "ratio" => {
                let ratio: f64 = arg("ratio", parts.next())?;
                if !ratio.is_finite() || ratio < 0.0 {
                    return Err(CommandError::InvalidArgument {
                        command: "ratio",
                        value: ratio.to_string(),
                    });
                }
                ControlCommand::Ratio(ratio)
            }
            "despawnall" => ControlCommand::DespawnAll,
            "resetbreaker" => ControlCommand::ResetBreaker,
            "resetstats" => ControlCommand::ResetStats,
            "stats" => ControlCommand::Stats,
            "spawn" => {
                let zone_id = arg("spawn", parts.next())?;
                let count = match parts.next() {
                    Some(v) => arg("spawn", Some(v))?,
                    None => 1,
                };
                ControlCommand::Spawn { zone_id, count }
            }
            "template" => ControlCommand::Template(
                parts
                    .next()
                    .ok_or(CommandError::MissingArgument("template"))?
                    .to_string(),
            ),
            "nextphase" => ControlCommand::NextPhase,
            "abortstartup" => ControlCommand::AbortStartup,
            "help" | "?" => ControlCommand::Help,
            _ => return Err(CommandError::Unknown(name)),
        };
        Ok(command)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Enable => write!(f, "enable"),
            ControlCommand::Disable => write!(f, "disable"),
            ControlCommand::MaxBots(n) => write!(f, "maxbots {}", n),
            ControlCommand::Ratio(r) => write!(f, "ratio {}", r),
            ControlCommand::DespawnAll => write!(f, "despawnall"),
            ControlCommand::ResetBreaker => write!(f, "resetbreaker"),
            ControlCommand::ResetStats => write!(f, "resetstats"),
            ControlCommand::Stats => write!(f, "stats"),
            ControlCommand::Spawn { zone_id, count } => write!(f, "spawn {} {}", zone_id, count),
            ControlCommand::Template(name) => write!(f, "template {}", name),
            ControlCommand::NextPhase => write!(f, "nextphase"),
            ControlCommand::AbortStartup => write!(f, "abortstartup"),
            ControlCommand::Help => write!(f, "help"),
        }
    }
}

impl ControlCommand {
    /// Run against `spawner`, returning the operator-facing reply
    pub fn execute(&self, spawner: &dyn BotSpawner) -> Result<String, CommandError> {
        let reply = match self {
            ControlCommand::Enable => {
                spawner.set_enabled(true);
                "bot spawning enabled".to_string()
            }
            ControlCommand::Disable => {
                spawner.set_enabled(false);
                "bot spawning disabled".to_string()
            }
            ControlCommand::MaxBots(n) => {
                spawner.set_max_bots(*n);
                format!("max bots set to {}", n)
            }
            ControlCommand::Ratio(r) => {
                spawner.set_bot_to_player_ratio(*r);
                format!("bot to player ratio set to {:.2}", r)
            }
            ControlCommand::DespawnAll => format!("despawned {} bots", spawner.despawn_all()),
            ControlCommand::ResetBreaker => {
                spawner.reset_circuit_breaker();
                "circuit breaker reset".to_string()
            }
            ControlCommand::ResetStats => {
                spawner.reset_stats();
                "statistics reset".to_string()
            }
            ControlCommand::Stats => serde_json::to_string_pretty(&spawner.stats())
                .map_err(|e| CommandError::Render(e.to_string()))?,
            ControlCommand::Spawn { zone_id, count } => {
                let requests = (0..*count)
                    .map(|_| SpawnRequest::random(*zone_id, 0))
                    .collect();
                let queued = spawner.spawn_bots(requests);
                format!("queued {} of {} spawns in zone {}", queued, count, zone_id)
            }
            ControlCommand::Template(name) => {
                if spawner.spawn_from_template(name) {
                    format!("queued spawn from template {}", name)
                } else {
                    format!("template {} not queued", name)
                }
            }
            ControlCommand::NextPhase => {
                format!("startup phase now {}", spawner.force_next_phase().as_str())
            }
            ControlCommand::AbortStartup => {
                spawner.abort_startup();
                "phased startup aborted".to_string()
            }
            ControlCommand::Help => HELP.to_string(),
        };
        Ok(reply)
    }
}

/// Parse and run one line
pub fn run_line(line: &str, spawner: &dyn BotSpawner) -> Result<String, CommandError> {
    line.parse::<ControlCommand>()?.execute(spawner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{create_spawner, SpawnerKind};
    use crate::config::SpawnConfig;
    use crate::control::{FixedSampler, ProcessSample};
    use crate::sim::{SimCharacterStore, SimWorldHost};
    use crate::util::ManualClock;
    use std::sync::Arc;
    use tokio::runtime::Handle;

    fn spawner() -> Arc<dyn BotSpawner> {
        create_spawner(
            SpawnerKind::Legacy,
            SpawnConfig::default(),
            Arc::new(SimWorldHost::new()),
            Arc::new(SimCharacterStore::new()),
            Box::new(FixedSampler::new(ProcessSample::default())),
            ManualClock::new(),
            Handle::current(),
        )
        .expect("spawner")
    }

    #[test]
    fn test_parse() {
        assert_eq!("enable".parse::<ControlCommand>(), Ok(ControlCommand::Enable));
        assert_eq!("  MaxBots 250 ".parse::<ControlCommand>(), Ok(ControlCommand::MaxBots(250)));
        assert_eq!("ratio 1.5".parse::<ControlCommand>(), Ok(ControlCommand::Ratio(1.5)));
        assert_eq!(
            "spawn 12".parse::<ControlCommand>(),
            Ok(ControlCommand::Spawn {
                zone_id: 12,
                count: 1
            })
        );
        assert_eq!(
            "spawn 12 5".parse::<ControlCommand>(),
            Ok(ControlCommand::Spawn {
                zone_id: 12,
                count: 5
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<ControlCommand>(), Err(CommandError::Empty));
        assert_eq!(
            "maxbots".parse::<ControlCommand>(),
            Err(CommandError::MissingArgument("maxbots"))
        );
        assert!(matches!(
            "maxbots lots".parse::<ControlCommand>(),
            Err(CommandError::InvalidArgument { command: "maxbots", .. })
        ));
        assert!(matches!(
            "ratio -1".parse::<ControlCommand>(),
            Err(CommandError::InvalidArgument { command: "ratio", .. })
        ));
        assert_eq!(
            "launch".parse::<ControlCommand>(),
            Err(CommandError::Unknown("launch".to_string()))
        );
    }

    #[test]
    fn test_display_parses_back() {
        for command in [
            ControlCommand::Disable,
            ControlCommand::MaxBots(10),
            ControlCommand::Template("escort".to_string()),
            ControlCommand::Spawn {
                zone_id: 4,
                count: 2,
            },
        ] {
            assert_eq!(command.to_string().parse::<ControlCommand>(), Ok(command));
        }
    }

    #[tokio::test]
    async fn test_execute() {
        let spawner = spawner();
        assert!(run_line("disable", spawner.as_ref()).is_ok());
        assert!(!spawner.stats().enabled);
        assert!(run_line("enable", spawner.as_ref()).is_ok());
        assert!(spawner.stats().enabled);

        run_line("maxbots 3", spawner.as_ref()).expect("maxbots");
        let reply = run_line("spawn 7 5", spawner.as_ref()).expect("spawn");
        assert_eq!(reply, "queued 3 of 5 spawns in zone 7");

        let stats = run_line("stats", spawner.as_ref()).expect("stats");
        let parsed: serde_json::Value = serde_json::from_str(&stats).expect("json");
        assert_eq!(parsed["queued"], 3);
        assert_eq!(parsed["rejected_requests"], 2);

        assert_eq!(
            run_line("resetbreaker", spawner.as_ref()),
            Ok("circuit breaker reset".to_string())
        );
        assert_eq!(run_line("despawnall", spawner.as_ref()), Ok("despawned 0 bots".to_string()));
    }

    #[tokio::test]
    async fn test_template_command() {
        let spawner = spawner();
        assert_eq!(
            "template".parse::<ControlCommand>(),
            Err(CommandError::MissingArgument("template"))
        );
        assert_eq!(
            run_line("template escort", spawner.as_ref()),
            Ok("template escort not queued".to_string())
        );

        spawner.register_template("escort", SpawnRequest::random(9, 0).with_levels(10, 20));
        assert_eq!(
            run_line("template escort", spawner.as_ref()),
            Ok("queued spawn from template escort".to_string())
        );
        assert_eq!(spawner.stats().queued, 1);
    }
}
